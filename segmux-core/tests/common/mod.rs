#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use segmux_core::{
    Muxer, MuxerFactory, RecorderConfig, RecorderError, SampleFlags, SampleInfo, StaticFormats,
    TrackFormat, TrackKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    Open(u64),
    AddTrack(u64, TrackKind),
    Start(u64),
    Write { segment: u64, kind: TrackKind, pts: i64 },
    Stop(u64),
    Release(u64),
}

/// Blocks muxer writes until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn pass(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

/// In-memory muxer factory that logs every call in one shared, ordered log.
#[derive(Default)]
pub struct RecordingMuxerFactory {
    pub log: Arc<Mutex<Vec<MuxEvent>>>,
    pub fail_open_from: Option<u64>,
    /// Segments from this index open but refuse to start.
    pub fail_start_from: Option<u64>,
    /// (segment, n): the n-th write into that segment fails.
    pub fail_write: Option<(u64, usize)>,
    pub write_delay: Option<Duration>,
    pub gate: Option<Arc<Gate>>,
    /// Holds every `stop()` until opened.
    pub stop_gate: Option<Arc<Gate>>,
}

impl RecordingMuxerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MuxEvent> {
        self.log.lock().clone()
    }
}

pub fn segment_index(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.rsplit('_').next())
        .and_then(|s| s.parse().ok())
        .expect("segment path ends in _<index>")
}

impl MuxerFactory for RecordingMuxerFactory {
    fn open(&self, path: &Path) -> segmux_core::error::Result<Box<dyn Muxer>> {
        let segment = segment_index(path);
        if self.fail_open_from.is_some_and(|from| segment >= from) {
            return Err(RecorderError::Muxer(format!("injected open failure for {segment}")));
        }
        self.log.lock().push(MuxEvent::Open(segment));
        Ok(Box::new(RecordingMuxer {
            segment,
            log: Arc::clone(&self.log),
            kinds: Vec::new(),
            writes: 0,
            fail_write_at: self
                .fail_write
                .filter(|(s, _)| *s == segment)
                .map(|(_, n)| n),
            write_delay: self.write_delay,
            gate: self.gate.clone(),
            fail_start: self.fail_start_from.is_some_and(|from| segment >= from),
            stop_gate: self.stop_gate.clone(),
        }))
    }
}

struct RecordingMuxer {
    segment: u64,
    log: Arc<Mutex<Vec<MuxEvent>>>,
    kinds: Vec<TrackKind>,
    writes: usize,
    fail_write_at: Option<usize>,
    write_delay: Option<Duration>,
    gate: Option<Arc<Gate>>,
    fail_start: bool,
    stop_gate: Option<Arc<Gate>>,
}

impl Muxer for RecordingMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> segmux_core::error::Result<usize> {
        self.log
            .lock()
            .push(MuxEvent::AddTrack(self.segment, format.kind));
        self.kinds.push(format.kind);
        Ok(self.kinds.len() - 1)
    }

    fn start(&mut self) -> segmux_core::error::Result<()> {
        if self.fail_start {
            return Err(RecorderError::Muxer(format!(
                "injected start failure for {}",
                self.segment
            )));
        }
        self.log.lock().push(MuxEvent::Start(self.segment));
        Ok(())
    }

    fn write_sample(
        &mut self,
        track_index: usize,
        data: &[u8],
        info: &SampleInfo,
    ) -> segmux_core::error::Result<()> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if let Some(delay) = self.write_delay {
            thread::sleep(delay);
        }
        if self.fail_write_at == Some(self.writes) {
            return Err(RecorderError::Muxer("injected write failure".into()));
        }
        self.writes += 1;

        assert_eq!(data, &payload(info.pts_us)[..], "payload mangled in the ring");
        self.log.lock().push(MuxEvent::Write {
            segment: self.segment,
            kind: self.kinds[track_index],
            pts: info.pts_us,
        });
        Ok(())
    }

    fn stop(&mut self) -> segmux_core::error::Result<()> {
        if let Some(gate) = &self.stop_gate {
            gate.pass();
        }
        self.log.lock().push(MuxEvent::Stop(self.segment));
        Ok(())
    }

    fn release(&mut self) {
        self.log.lock().push(MuxEvent::Release(self.segment));
    }
}

pub fn formats() -> Arc<StaticFormats> {
    Arc::new(StaticFormats {
        video: TrackFormat::video("video/avc", 1280, 720),
        audio: TrackFormat::audio("audio/mp4a-latm", 44_100, 1),
    })
}

pub fn config(dir: &Path) -> RecorderConfig {
    RecorderConfig {
        output_dir: dir.to_path_buf(),
        ..RecorderConfig::default()
    }
}

/// Deterministic payload for sample `n`; size varies with `n`.
pub fn payload(n: i64) -> Vec<u8> {
    let len = 8 + (n as usize % 24);
    let mut bytes = n.to_le_bytes().to_vec();
    bytes.resize(len, (n % 251) as u8);
    bytes
}

pub fn sample_info(n: i64) -> SampleInfo {
    let flags = if n % 30 == 0 {
        SampleFlags::KEY_FRAME
    } else {
        SampleFlags::NONE
    };
    SampleInfo::new(n, flags, payload(n).len())
}

pub fn wait_until(timeout: Duration, what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() >= timeout {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Per-segment pts list for one track, in write order.
pub fn writes_by_segment(events: &[MuxEvent], track: TrackKind) -> Vec<(u64, Vec<i64>)> {
    let mut out: Vec<(u64, Vec<i64>)> = Vec::new();
    for event in events {
        if let MuxEvent::Write { segment, kind, pts } = event {
            if *kind != track {
                continue;
            }
            match out.last_mut() {
                Some((s, list)) if s == segment => list.push(*pts),
                _ => out.push((*segment, vec![*pts])),
            }
        }
    }
    out
}

/// Every write lands between its segment's Start and Stop.
pub fn assert_writes_inside_open_sessions(events: &[MuxEvent]) {
    let mut open: Option<u64> = None;
    for event in events {
        match event {
            MuxEvent::Start(s) => {
                assert!(open.is_none(), "segment {s} started while another was open");
                open = Some(*s);
            }
            MuxEvent::Stop(s) => {
                assert_eq!(open, Some(*s), "stop of a segment that is not current");
                open = None;
            }
            MuxEvent::Write { segment, kind, pts } => {
                assert_eq!(
                    open,
                    Some(*segment),
                    "{kind} sample {pts} written outside an open session"
                );
            }
            MuxEvent::AddTrack(s, _) => {
                assert_ne!(open, Some(*s), "track added to a started session");
            }
            MuxEvent::Open(_) | MuxEvent::Release(_) => {}
        }
    }
}

pub fn temp_output() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("segments");
    (dir, out)
}
