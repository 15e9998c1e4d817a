//! `MuxSession` — one open segment file and its registered tracks.
//!
//! ## Lifecycle
//!
//! ```text
//! open() ─► add_track() × 2 ─► start() ─► write_sample()* ─► stop() ─► release()
//! ```
//!
//! Strictly sequential and never re-entered. `stop()` and `release()` are
//! idempotent and do nothing on a session that was never started.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::buffering::sample::{SampleInfo, TrackKind};
use crate::error::{RecorderError, Result};
use crate::mux::{Muxer, MuxerFactory, TrackFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Stopped,
    Released,
}

pub struct MuxSession {
    segment: u64,
    path: PathBuf,
    muxer: Box<dyn Muxer>,
    video_track: Option<usize>,
    audio_track: Option<usize>,
    state: SessionState,
    samples_written: u64,
}

impl MuxSession {
    /// Open the container for `segment` at `path`.
    pub fn open(factory: &dyn MuxerFactory, segment: u64, path: PathBuf) -> Result<Self> {
        let muxer = factory.open(&path)?;
        debug!(segment, path = %path.display(), "mux session opened");
        Ok(Self {
            segment,
            path,
            muxer,
            video_track: None,
            audio_track: None,
            state: SessionState::Created,
            samples_written: 0,
        })
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn track_index(&self, kind: TrackKind) -> Option<usize> {
        match kind {
            TrackKind::Video => self.video_track,
            TrackKind::Audio => self.audio_track,
        }
    }

    /// Register the track described by `format`.
    ///
    /// # Errors
    /// `InvalidState` once the session has started, or if the track kind is
    /// already registered.
    pub fn add_track(&mut self, format: &TrackFormat) -> Result<usize> {
        if self.state != SessionState::Created {
            return Err(RecorderError::InvalidState("track added after session start"));
        }
        if self.track_index(format.kind).is_some() {
            return Err(RecorderError::InvalidState("track kind already registered"));
        }

        let index = self.muxer.add_track(format)?;
        match format.kind {
            TrackKind::Video => self.video_track = Some(index),
            TrackKind::Audio => self.audio_track = Some(index),
        }
        Ok(index)
    }

    /// Start the container. Both tracks must be registered.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(RecorderError::InvalidState("session started twice"));
        }
        if self.video_track.is_none() || self.audio_track.is_none() {
            return Err(RecorderError::InvalidState("session started without both tracks"));
        }

        self.muxer.start()?;
        self.state = SessionState::Started;
        info!(segment = self.segment, path = %self.path.display(), "segment started");
        Ok(())
    }

    pub fn write_sample(&mut self, kind: TrackKind, data: &[u8], info: &SampleInfo) -> Result<()> {
        if self.state != SessionState::Started {
            return Err(RecorderError::InvalidState("sample written to a session that is not started"));
        }
        let index = self
            .track_index(kind)
            .ok_or(RecorderError::InvalidState("sample written to an unregistered track"))?;

        self.muxer.write_sample(index, data, info)?;
        self.samples_written += 1;
        Ok(())
    }

    /// Flush and finalise the container. No-op unless started.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != SessionState::Started {
            return Ok(());
        }
        // Marked stopped before the call so a failing stop is not retried.
        self.state = SessionState::Stopped;
        self.muxer.stop()?;
        info!(
            segment = self.segment,
            samples = self.samples_written,
            path = %self.path.display(),
            "segment finalized"
        );
        Ok(())
    }

    /// Release the file handle. No-op unless the session was started.
    pub fn release(&mut self) {
        if matches!(self.state, SessionState::Started | SessionState::Stopped) {
            self.muxer.release();
            self.state = SessionState::Released;
        }
    }

    /// `stop()` followed by `release()`; the handle is released even if
    /// the stop fails.
    pub fn finalize(&mut self) -> Result<()> {
        let stopped = self.stop();
        self.release();
        stopped
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("segment", &self.segment)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("samples_written", &self.samples_written)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::buffering::sample::SampleFlags;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        AddTrack(TrackKind),
        Start,
        Write(usize),
        Stop,
        Release,
    }

    struct LogMuxer {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_stop: bool,
    }

    impl Muxer for LogMuxer {
        fn add_track(&mut self, format: &TrackFormat) -> Result<usize> {
            let mut calls = self.calls.lock();
            calls.push(Call::AddTrack(format.kind));
            Ok(calls.iter().filter(|c| matches!(c, Call::AddTrack(_))).count() - 1)
        }

        fn start(&mut self) -> Result<()> {
            self.calls.lock().push(Call::Start);
            Ok(())
        }

        fn write_sample(&mut self, track_index: usize, _data: &[u8], _info: &SampleInfo) -> Result<()> {
            self.calls.lock().push(Call::Write(track_index));
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.calls.lock().push(Call::Stop);
            if self.fail_stop {
                return Err(RecorderError::Muxer("stop failed".into()));
            }
            Ok(())
        }

        fn release(&mut self) {
            self.calls.lock().push(Call::Release);
        }
    }

    struct LogFactory {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_stop: bool,
    }

    impl MuxerFactory for LogFactory {
        fn open(&self, _path: &Path) -> Result<Box<dyn Muxer>> {
            Ok(Box::new(LogMuxer {
                calls: Arc::clone(&self.calls),
                fail_stop: self.fail_stop,
            }))
        }
    }

    fn session(fail_stop: bool) -> (MuxSession, Arc<Mutex<Vec<Call>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = LogFactory {
            calls: Arc::clone(&calls),
            fail_stop,
        };
        let session =
            MuxSession::open(&factory, 1, PathBuf::from("seg_1.seg")).expect("open session");
        (session, calls)
    }

    fn sample() -> SampleInfo {
        SampleInfo::new(0, SampleFlags::KEY_FRAME, 3)
    }

    fn add_both(session: &mut MuxSession) {
        session
            .add_track(&TrackFormat::video("video/avc", 640, 480))
            .expect("video track");
        session
            .add_track(&TrackFormat::audio("audio/mp4a-latm", 44_100, 1))
            .expect("audio track");
    }

    #[test]
    fn full_lifecycle_routes_samples_to_registered_indices() {
        let (mut s, calls) = session(false);
        add_both(&mut s);
        s.start().expect("start");
        s.write_sample(TrackKind::Audio, &[1, 2, 3], &sample()).expect("audio");
        s.write_sample(TrackKind::Video, &[1, 2, 3], &sample()).expect("video");
        s.finalize().expect("finalize");

        assert_eq!(
            &*calls.lock(),
            &vec![
                Call::AddTrack(TrackKind::Video),
                Call::AddTrack(TrackKind::Audio),
                Call::Start,
                Call::Write(1),
                Call::Write(0),
                Call::Stop,
                Call::Release,
            ]
        );
        assert_eq!(s.samples_written(), 2);
        assert_eq!(s.state(), SessionState::Released);
    }

    #[test]
    fn write_before_start_fails() {
        let (mut s, calls) = session(false);
        add_both(&mut s);
        let err = s
            .write_sample(TrackKind::Video, &[0], &sample())
            .expect_err("write before start");
        assert!(matches!(err, RecorderError::InvalidState(_)));
        assert!(!calls.lock().iter().any(|c| matches!(c, Call::Write(_))));
    }

    #[test]
    fn add_track_after_start_fails() {
        let (mut s, _) = session(false);
        add_both(&mut s);
        s.start().expect("start");
        let err = s
            .add_track(&TrackFormat::video("video/hevc", 1, 1))
            .expect_err("add after start");
        assert!(matches!(err, RecorderError::InvalidState(_)));
    }

    #[test]
    fn duplicate_track_kind_is_rejected() {
        let (mut s, _) = session(false);
        s.add_track(&TrackFormat::video("video/avc", 1, 1))
            .expect("first video track");
        assert!(s.add_track(&TrackFormat::video("video/avc", 1, 1)).is_err());
    }

    #[test]
    fn start_requires_both_tracks() {
        let (mut s, _) = session(false);
        s.add_track(&TrackFormat::video("video/avc", 1, 1))
            .expect("video track");
        assert!(s.start().is_err());
    }

    #[test]
    fn stop_and_release_are_noops_when_never_started() {
        let (mut s, calls) = session(false);
        add_both(&mut s);
        s.stop().expect("stop");
        s.release();
        s.finalize().expect("finalize");
        assert_eq!(calls.lock().len(), 2);
        assert_eq!(s.state(), SessionState::Created);
    }

    #[test]
    fn finalize_is_idempotent_and_releases_after_failed_stop() {
        let (mut s, calls) = session(true);
        add_both(&mut s);
        s.start().expect("start");
        assert!(s.finalize().is_err());
        s.finalize().expect("second finalize is a no-op");

        let stops = calls.lock().iter().filter(|c| **c == Call::Stop).count();
        let releases = calls.lock().iter().filter(|c| **c == Call::Release).count();
        assert_eq!((stops, releases), (1, 1));
    }
}
