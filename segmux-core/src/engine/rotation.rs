//! `RotationCoordinator` — owns the active `MuxSession` and cuts segments.
//!
//! ## State machine
//!
//! ```text
//!            video write past deadline
//!  ACTIVE ─────────────────────────────► ROTATING
//!    ▲                                      │ finalize old, open + start new
//!    └──────────── notify_all ◄─────────────┘
//!
//!  ROTATING ── open/start/finalize error ──► FAILED
//!  ACTIVE   ── write error ────────────────► FAILED
//!  ACTIVE   ── finish() ───────────────────► FINISHED
//! ```
//!
//! Only `ROTATION_DRIVER` (video) ever checks the deadline, so there is a
//! single initiator. While ROTATING the old session has already been taken
//! out of the shared state and the lock is released for the file I/O; every
//! other writer waits on the `active` condition variable and then writes into
//! whichever session is current. The rotating writer completes the whole cut,
//! including the wake-up, before it writes its own sample.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::buffering::sample::{SampleInfo, TrackKind};
use crate::engine::{pipeline::RecorderDiagnostics, Observers};
use crate::error::{RecorderError, Result};
use crate::events::{RecorderStatus, SegmentEvent, SegmentState};
use crate::mux::{FormatSource, MuxSession, MuxerFactory};
use crate::output::SegmentNamer;

/// The only track whose writer may trigger a rotation.
pub const ROTATION_DRIVER: TrackKind = TrackKind::Video;

/// Wall-clock source for rotation deadlines.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Rotating,
    Failed,
    Finished,
}

/// A segment that was stopped and released cleanly.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedSegment {
    pub index: u64,
    pub path: PathBuf,
    pub samples: u64,
}

struct CoordinatorState {
    phase: Phase,
    session: Option<MuxSession>,
    /// Armed by the first video sample.
    deadline: Option<Instant>,
    namer: SegmentNamer,
    finalized: Vec<FinalizedSegment>,
    corrupt: Option<u64>,
}

/// Collaborators a coordinator is built from.
pub struct CoordinatorParts {
    pub factory: Arc<dyn MuxerFactory>,
    pub formats: Arc<dyn FormatSource>,
    pub clock: Arc<dyn Clock>,
    pub namer: SegmentNamer,
    pub segment_duration: Duration,
    pub diagnostics: Arc<RecorderDiagnostics>,
    pub observers: Observers,
}

pub struct RotationCoordinator {
    state: Mutex<CoordinatorState>,
    active: Condvar,
    factory: Arc<dyn MuxerFactory>,
    formats: Arc<dyn FormatSource>,
    clock: Arc<dyn Clock>,
    segment_duration: Duration,
    diagnostics: Arc<RecorderDiagnostics>,
    observers: Observers,
}

impl RotationCoordinator {
    /// Open and start the first segment.
    ///
    /// # Errors
    /// `RecorderError::Rotation` naming the first segment index if the
    /// container cannot be opened, configured or started.
    pub fn open(parts: CoordinatorParts) -> Result<Self> {
        let CoordinatorParts {
            factory,
            formats,
            clock,
            mut namer,
            segment_duration,
            diagnostics,
            observers,
        } = parts;

        let (index, path) = namer.next_path();
        let coordinator = Self {
            state: Mutex::new(CoordinatorState {
                phase: Phase::Active,
                session: None,
                deadline: None,
                namer,
                finalized: Vec::new(),
                corrupt: None,
            }),
            active: Condvar::new(),
            factory,
            formats,
            clock,
            segment_duration,
            diagnostics,
            observers,
        };

        let session = coordinator.open_session(index, path)?;
        coordinator.state.lock().session = Some(session);
        Ok(coordinator)
    }

    /// Write one sample into the current segment.
    ///
    /// Waits while another writer is rotating. When called by the rotation
    /// driver past the deadline, performs the rotation first.
    ///
    /// # Errors
    /// - `Rotation` / `Finalize` if the cut failed (driver only).
    /// - `Write` if the muxer rejected the sample; the segment is finalized
    ///   best-effort and reported corrupt.
    /// - `Aborted` if the coordinator already failed or finished.
    pub fn write(&self, kind: TrackKind, data: &[u8], info: SampleInfo) -> Result<()> {
        let mut state = self.state.lock();
        while state.phase == Phase::Rotating {
            self.active.wait(&mut state);
        }
        if matches!(state.phase, Phase::Failed | Phase::Finished) {
            return Err(RecorderError::Aborted);
        }

        if kind == ROTATION_DRIVER {
            let now = self.clock.now();
            let deadline = *state.deadline.get_or_insert(now + self.segment_duration);
            if now >= deadline {
                state = self.rotate(state, deadline, now)?;
            }
        }

        self.write_locked(&mut state, kind, data, &info)
    }

    /// Finalize the current segment. Runs at most once; later calls and
    /// calls after a failure are no-ops.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.phase == Phase::Rotating {
            self.active.wait(&mut state);
        }
        if state.phase == Phase::Active {
            state.phase = Phase::Finished;
        }
        let Some(mut session) = state.session.take() else {
            return Ok(());
        };
        self.active.notify_all();

        let result = self.finalize_session(&mut state, &mut session);
        if let Err(e) = &result {
            state.phase = Phase::Failed;
            error!("final segment could not be finalized: {e}");
        }
        result
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Index of the segment currently open, if any.
    pub fn current_segment(&self) -> Option<u64> {
        self.state.lock().session.as_ref().map(MuxSession::segment)
    }

    pub fn finalized_segments(&self) -> Vec<FinalizedSegment> {
        self.state.lock().finalized.clone()
    }

    pub fn corrupt_segment(&self) -> Option<u64> {
        self.state.lock().corrupt
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn rotate<'a>(
        &'a self,
        mut state: MutexGuard<'a, CoordinatorState>,
        deadline: Instant,
        now: Instant,
    ) -> Result<MutexGuard<'a, CoordinatorState>> {
        state.phase = Phase::Rotating;
        let old = state.session.take();
        let (index, path) = state.namer.next_path();
        self.observers
            .transition(RecorderStatus::Recording, RecorderStatus::Rotating);
        info!(next_segment = index, "rotating segment");

        // The old session is out of reach of other writers; do the file I/O
        // without holding the coordinator lock.
        drop(state);
        let finalized = match old {
            Some(mut session) => {
                let outcome = session.finalize().map_err(|e| RecorderError::Finalize {
                    segment: session.segment(),
                    source: Box::new(e),
                });
                Some((session, outcome))
            }
            None => None,
        };
        let opened = match &finalized {
            Some((_, Err(_))) => None,
            _ => Some(self.open_session(index, path)),
        };

        let mut state = self.state.lock();
        if let Some((session, outcome)) = finalized {
            match outcome {
                Ok(()) => self.record_finalized(&mut state, &session),
                Err(e) => {
                    state.corrupt = Some(session.segment());
                    self.observers.segment(SegmentEvent::new(
                        session.segment(),
                        session.path().to_path_buf(),
                        SegmentState::Corrupt,
                    ));
                    return Err(self.fail(state, e));
                }
            }
        }

        match opened {
            Some(Ok(session)) => {
                state.session = Some(session);
                state.deadline = Some(next_deadline(deadline, now, self.segment_duration));
                state.phase = Phase::Active;
                self.diagnostics.record_rotation();
                self.active.notify_all();
                self.observers
                    .transition(RecorderStatus::Rotating, RecorderStatus::Recording);
                Ok(state)
            }
            Some(Err(e)) => Err(self.fail(state, e)),
            None => Err(self.fail(state, RecorderError::Aborted)),
        }
    }

    /// Open the container, register video then audio, and start it.
    fn open_session(&self, index: u64, path: PathBuf) -> Result<MuxSession> {
        let rotation_error = |e: RecorderError| RecorderError::Rotation {
            segment: index,
            source: Box::new(e),
        };

        let mut session =
            MuxSession::open(&*self.factory, index, path).map_err(rotation_error)?;
        if let Err(e) = self.configure_session(&mut session) {
            // The container exists but never got a usable header.
            if let Err(fe) = session.finalize() {
                warn!(segment = index, "best-effort finalize after failed setup failed: {fe}");
            }
            warn!(segment = index, path = %session.path().display(), "segment left incomplete");
            self.state.lock().corrupt = Some(index);
            self.observers.segment(SegmentEvent::new(
                index,
                session.path().to_path_buf(),
                SegmentState::Corrupt,
            ));
            return Err(rotation_error(e));
        }

        self.observers.segment(SegmentEvent::new(
            index,
            session.path().to_path_buf(),
            SegmentState::Opened,
        ));
        Ok(session)
    }

    fn configure_session(&self, session: &mut MuxSession) -> Result<()> {
        for kind in TrackKind::ALL {
            let format = self.formats.output_format(kind)?;
            session.add_track(&format)?;
        }
        session.start()
    }

    fn write_locked(
        &self,
        state: &mut MutexGuard<'_, CoordinatorState>,
        kind: TrackKind,
        data: &[u8],
        info: &SampleInfo,
    ) -> Result<()> {
        let Some(session) = state.session.as_mut() else {
            return Err(RecorderError::Aborted);
        };
        let segment = session.segment();
        let e = match session.write_sample(kind, data, info) {
            Ok(()) => {
                self.diagnostics.record_written(kind);
                return Ok(());
            }
            Err(e) => e,
        };

        // A partial write leaves the container unusable: close it as well as
        // possible and stop the recording.
        error!(segment, track = %kind, "sample write failed: {e}");
        state.phase = Phase::Failed;
        state.corrupt = Some(segment);
        if let Some(mut session) = state.session.take() {
            if let Err(fe) = session.finalize() {
                warn!(segment, "best-effort finalize after write failure failed: {fe}");
            }
            self.observers.segment(SegmentEvent::new(
                segment,
                session.path().to_path_buf(),
                SegmentState::Corrupt,
            ));
        }
        self.active.notify_all();
        self.observers
            .set_status(RecorderStatus::Error, Some(format!("write failed: {e}")));

        Err(RecorderError::Write {
            segment,
            track: kind,
            source: Box::new(e),
        })
    }

    fn finalize_session(
        &self,
        state: &mut MutexGuard<'_, CoordinatorState>,
        session: &mut MuxSession,
    ) -> Result<()> {
        match session.finalize() {
            Ok(()) => {
                self.record_finalized(state, session);
                Ok(())
            }
            Err(e) => {
                state.corrupt = Some(session.segment());
                self.observers.segment(SegmentEvent::new(
                    session.segment(),
                    session.path().to_path_buf(),
                    SegmentState::Corrupt,
                ));
                Err(RecorderError::Finalize {
                    segment: session.segment(),
                    source: Box::new(e),
                })
            }
        }
    }

    fn record_finalized(&self, state: &mut CoordinatorState, session: &MuxSession) {
        state.finalized.push(FinalizedSegment {
            index: session.segment(),
            path: session.path().to_path_buf(),
            samples: session.samples_written(),
        });
        self.diagnostics.record_segment_finalized();
        self.observers.segment(SegmentEvent::new(
            session.segment(),
            session.path().to_path_buf(),
            SegmentState::Finalized,
        ));
    }

    /// Enter FAILED, release waiting writers and hand back the error.
    fn fail(&self, mut state: MutexGuard<'_, CoordinatorState>, e: RecorderError) -> RecorderError {
        state.phase = Phase::Failed;
        drop(state);
        self.active.notify_all();
        error!("rotation failed: {e}");
        self.observers
            .set_status(RecorderStatus::Error, Some(e.to_string()));
        e
    }
}

/// Advance by one segment, re-anchoring on `now` if the stall outlasted it.
fn next_deadline(previous: Instant, now: Instant, segment: Duration) -> Instant {
    let next = previous + segment;
    if next <= now {
        now + segment
    } else {
        next
    }
}
