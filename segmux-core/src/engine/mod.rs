//! `Recorder` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Recorder::new()
//!     └─► start()                → output dir checked, first segment open,
//!         │                        two writer threads spawned, status = Recording
//!         ├─► on_sample_available()  (encoder output threads, any number of calls)
//!         └─► stop()             → pipes closed, writers drain and join,
//!                                  last segment finalized, status = Stopped
//!             abort()            → queued samples discarded, writers join,
//!                                  last segment still finalized
//! ```
//!
//! ## Threading
//!
//! Up to four contexts run at once: one producer per track (the encoder's
//! callback thread calling `on_sample_available`) and one dedicated writer
//! thread per track. The producers only touch their `TrackPipe`; the writers
//! meet at the `RotationCoordinator`.

pub mod pipe;
pub mod pipeline;
pub mod rotation;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    buffering::sample::{SampleInfo, TrackKind},
    config::RecorderConfig,
    error::{RecorderError, RecordingFailure, Result},
    events::{RecorderStatus, RecorderStatusEvent, SegmentEvent},
    mux::{FormatSource, MuxerFactory, SegmentFileMuxerFactory},
    output::prepare_output_dir,
};

use pipe::TrackPipe;
use pipeline::{DiagnosticsSnapshot, RecorderDiagnostics, WriterContext};
use rotation::{Clock, CoordinatorParts, FinalizedSegment, RotationCoordinator, SystemClock};

/// Broadcast channel capacity: events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Shared status cell plus the broadcast senders observers subscribe to.
#[derive(Clone)]
pub struct Observers {
    status: Arc<Mutex<RecorderStatus>>,
    status_tx: broadcast::Sender<RecorderStatusEvent>,
    segment_tx: broadcast::Sender<SegmentEvent>,
}

impl Observers {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (segment_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            status: Arc::new(Mutex::new(RecorderStatus::Idle)),
            status_tx,
            segment_tx,
        }
    }

    pub fn status(&self) -> RecorderStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: RecorderStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(RecorderStatusEvent { status, detail });
    }

    /// Move to `to` only if the current status is `from`.
    pub fn transition(&self, from: RecorderStatus, to: RecorderStatus) {
        let mut current = self.status.lock();
        if *current == from {
            *current = to;
            let _ = self.status_tx.send(RecorderStatusEvent {
                status: to,
                detail: None,
            });
        }
    }

    pub fn segment(&self, event: SegmentEvent) {
        let _ = self.segment_tx.send(event);
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

/// What a cleanly stopped recording produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub segments: Vec<FinalizedSegment>,
    pub video_samples: u64,
    pub audio_samples: u64,
}

struct ActiveRecording {
    video: Arc<TrackPipe>,
    audio: Arc<TrackPipe>,
    coordinator: Arc<RotationCoordinator>,
    writers: Vec<(TrackKind, JoinHandle<Result<u64>>)>,
}

impl ActiveRecording {
    fn pipe(&self, kind: TrackKind) -> &Arc<TrackPipe> {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }
}

/// Two-track segmented recorder.
///
/// `Recorder` is `Send + Sync`; share it behind an `Arc` between the encoder
/// callbacks and whatever controls start/stop.
pub struct Recorder {
    config: RecorderConfig,
    formats: Arc<dyn FormatSource>,
    factory: Arc<dyn MuxerFactory>,
    clock: Arc<dyn Clock>,
    active: Mutex<Option<ActiveRecording>>,
    observers: Observers,
    diagnostics: Arc<RecorderDiagnostics>,
}

impl Recorder {
    /// Create a recorder writing `SegmentFileMuxer` files. Does not start.
    pub fn new(config: RecorderConfig, formats: Arc<dyn FormatSource>) -> Self {
        Self {
            config,
            formats,
            factory: Arc::new(SegmentFileMuxerFactory),
            clock: Arc::new(SystemClock),
            active: Mutex::new(None),
            observers: Observers::new(),
            diagnostics: Arc::new(RecorderDiagnostics::default()),
        }
    }

    /// Use a different container muxer.
    pub fn with_muxer_factory(mut self, factory: Arc<dyn MuxerFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Use a different clock for rotation deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Open the first segment and spawn both writer threads.
    ///
    /// # Errors
    /// - `AlreadyRunning` if a recording is active.
    /// - `Config` if the configuration is invalid.
    /// - `Permission` if the output directory is not writable; nothing is
    ///   buffered in that case.
    ///
    /// Segment numbering continues after any segment files already in the
    /// output directory, so a restart never overwrites a finished segment.
    /// - `Rotation` if the first segment cannot be opened.
    pub fn start(&self) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(RecorderError::AlreadyRunning);
        }

        self.config.validate()?;
        let mut namer = self.config.namer();
        if let Err(e) =
            prepare_output_dir(&self.config.output_dir).and_then(|()| namer.skip_existing())
        {
            self.observers
                .set_status(RecorderStatus::Error, Some(e.to_string()));
            return Err(e);
        }

        self.diagnostics.reset();
        let coordinator = match RotationCoordinator::open(CoordinatorParts {
            factory: Arc::clone(&self.factory),
            formats: Arc::clone(&self.formats),
            clock: Arc::clone(&self.clock),
            namer,
            segment_duration: self.config.segment_duration(),
            diagnostics: Arc::clone(&self.diagnostics),
            observers: self.observers.clone(),
        }) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                self.observers
                    .set_status(RecorderStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        let pipe_for = |kind: TrackKind| {
            Arc::new(TrackPipe::new(
                kind,
                self.config.initial_ring_bytes(kind),
                self.config.max_ring_bytes,
                Arc::clone(&self.diagnostics),
            ))
        };
        let video = pipe_for(TrackKind::Video);
        let audio = pipe_for(TrackKind::Audio);
        let all_pipes = vec![Arc::clone(&video), Arc::clone(&audio)];

        let mut writers = Vec::with_capacity(2);
        for pipe in [&video, &audio] {
            let ctx = WriterContext {
                kind: pipe.kind(),
                pipe: Arc::clone(pipe),
                coordinator: Arc::clone(&coordinator),
                all_pipes: all_pipes.clone(),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("segmux-{}-writer", pipe.kind()))
                .spawn(move || pipeline::run(ctx));
            match spawned {
                Ok(handle) => writers.push((pipe.kind(), handle)),
                Err(e) => {
                    // Unwind whatever already started.
                    for p in &all_pipes {
                        p.abort();
                    }
                    for (_, handle) in writers {
                        let _ = handle.join();
                    }
                    let _ = coordinator.finish();
                    self.observers
                        .set_status(RecorderStatus::Error, Some(e.to_string()));
                    return Err(e.into());
                }
            }
        }

        *active = Some(ActiveRecording {
            video,
            audio,
            coordinator,
            writers,
        });
        self.observers.set_status(RecorderStatus::Recording, None);
        info!(
            dir = %self.config.output_dir.display(),
            segment_ms = self.config.segment_duration_ms,
            "recording started"
        );
        Ok(())
    }

    /// Encoder notification: a compressed sample is ready.
    ///
    /// The bytes are copied into the track's ring buffer and `release` is
    /// called right after the copy (also when the sample is refused), so the
    /// encoder can reuse its buffer before the sample reaches disk. Blocks
    /// while the ring is full and cannot grow.
    ///
    /// # Errors
    /// - `NotRunning` when no recording is active or it is stopping.
    /// - `Aborted` after a fatal writer error.
    /// - `BufferExhausted` for a sample larger than the ring ceiling.
    pub fn on_sample_available<R>(
        &self,
        kind: TrackKind,
        data: &[u8],
        info: SampleInfo,
        release: R,
    ) -> Result<()>
    where
        R: FnOnce(),
    {
        // Clone the pipe out so a blocked producer never holds the recorder lock.
        let pipe = self
            .active
            .lock()
            .as_ref()
            .map(|a| Arc::clone(a.pipe(kind)));

        let result = match pipe {
            Some(pipe) => pipe.enqueue(data, SampleInfo { size: data.len(), ..info }),
            None => Err(RecorderError::NotRunning),
        };
        release();
        result
    }

    /// Stop accepting samples, write everything already queued, finalize
    /// the last segment and join the writers.
    ///
    /// # Errors
    /// - `NotRunning` if not recording.
    /// - `Failed` with a `RecordingFailure` if a fatal error ended the
    ///   recording; it names the corrupt segment, if any, and the segments
    ///   that were finalized before it.
    pub fn stop(&self) -> Result<RecordingSummary> {
        self.shutdown(false)
    }

    /// Like `stop`, but discards queued samples. The current segment is
    /// still finalized so the file stays playable.
    pub fn abort(&self) -> Result<RecordingSummary> {
        self.shutdown(true)
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Current recorder status (snapshot).
    pub fn status(&self) -> RecorderStatus {
        self.observers.status()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<RecorderStatusEvent> {
        self.observers.status_tx.subscribe()
    }

    /// Subscribe to segment opened / finalized / corrupt events.
    pub fn subscribe_segments(&self) -> broadcast::Receiver<SegmentEvent> {
        self.observers.segment_tx.subscribe()
    }

    /// Snapshot of buffering and rotation counters.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Path of the segment currently being written, if recording.
    pub fn current_segment_path(&self) -> Option<PathBuf> {
        let active = self.active.lock();
        let segment = active.as_ref()?.coordinator.current_segment()?;
        Some(self.config.namer().path_for(segment))
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn shutdown(&self, discard: bool) -> Result<RecordingSummary> {
        let Some(recording) = self.active.lock().take() else {
            return Err(RecorderError::NotRunning);
        };
        self.observers
            .transition(RecorderStatus::Recording, RecorderStatus::Stopping);
        info!(discard, "recording stop requested");

        for kind in TrackKind::ALL {
            let pipe = recording.pipe(kind);
            if discard {
                pipe.abort();
            } else {
                pipe.close();
            }
        }

        let mut fatal: Option<RecorderError> = None;
        let mut video_samples = 0;
        let mut audio_samples = 0;
        for (kind, handle) in recording.writers {
            match handle.join() {
                Ok(Ok(written)) => match kind {
                    TrackKind::Video => video_samples = written,
                    TrackKind::Audio => audio_samples = written,
                },
                // Secondary to whatever aborted the pipes.
                Ok(Err(RecorderError::Aborted)) => {}
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                }
                Err(_) => {
                    error!(track = %kind, "writer thread panicked");
                    fatal.get_or_insert(RecorderError::Other(anyhow::anyhow!(
                        "{kind} writer thread panicked"
                    )));
                }
            }
        }

        // Finalize exactly once, whatever happened above.
        if let Err(e) = recording.coordinator.finish() {
            if fatal.is_none() {
                fatal = Some(e);
            } else {
                warn!("finalize after failure also failed: {e}");
            }
        }

        let segments = recording.coordinator.finalized_segments();
        match fatal {
            None => {
                self.observers.set_status(RecorderStatus::Stopped, None);
                info!(
                    segments = segments.len(),
                    video_samples, audio_samples, "recording stopped"
                );
                Ok(RecordingSummary {
                    segments,
                    video_samples,
                    audio_samples,
                })
            }
            Some(error) => {
                let corrupt_segment = error
                    .corrupt_segment()
                    .or_else(|| recording.coordinator.corrupt_segment());
                self.observers
                    .set_status(RecorderStatus::Error, Some(error.to_string()));
                error!(?corrupt_segment, "recording failed: {error}");
                Err(RecorderError::Failed(Box::new(RecordingFailure {
                    error,
                    corrupt_segment,
                    finalized_segments: segments.iter().map(|s| s.index).collect(),
                })))
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.active.get_mut().is_some() {
            warn!("recorder dropped while recording, stopping");
            if let Err(e) = self.stop() {
                error!("stop on drop failed: {e}");
            }
        }
    }
}
