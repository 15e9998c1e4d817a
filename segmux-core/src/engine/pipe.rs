//! `TrackPipe` — one track's ring buffer plus its producer/consumer handshake.
//!
//! ## Producer (encoder output thread)
//!
//! ```text
//! add ─ ok ──────────────────────────────► wake writer
//!  └─ full ─► can grow? ─ yes ─► grow ─ ok ─► retry add
//!                └─ no / grow failed ─► wait on not_full ─► retry add
//! ```
//!
//! Samples are never dropped: the only ways out of `enqueue` are a copied
//! sample, an aborted pipe, or a sample larger than the ring could ever hold.
//!
//! ## Consumer (dedicated writer thread)
//!
//! `next_sample` copies the oldest record out; the writer hands it to the
//! rotation coordinator and only then calls `complete_oldest`, which frees the
//! slot and wakes a blocked producer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::buffering::{
    ring::SampleRing,
    sample::{SampleInfo, TrackKind},
};
use crate::engine::pipeline::RecorderDiagnostics;
use crate::error::{RecorderError, Result};

/// Pause before re-attempting a failed allocation on an empty ring.
const GROWTH_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeMode {
    Open,
    /// No new samples accepted; the writer drains what is queued.
    Closed,
    /// Queued samples are discarded; everybody leaves.
    Aborted,
}

struct PipeState {
    ring: SampleRing,
    /// Cleared by the first failed growth attempt; never set again.
    can_grow: bool,
    mode: PipeMode,
    /// Producers currently inside `enqueue` (possibly blocked).
    producers_inside: usize,
}

pub struct TrackPipe {
    kind: TrackKind,
    state: Mutex<PipeState>,
    not_empty: Condvar,
    not_full: Condvar,
    diagnostics: Arc<RecorderDiagnostics>,
}

impl TrackPipe {
    pub fn new(
        kind: TrackKind,
        initial_bytes: usize,
        ceiling_bytes: usize,
        diagnostics: Arc<RecorderDiagnostics>,
    ) -> Self {
        Self {
            kind,
            state: Mutex::new(PipeState {
                ring: SampleRing::new(initial_bytes, ceiling_bytes),
                can_grow: true,
                mode: PipeMode::Open,
                producers_inside: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            diagnostics,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Copy one sample into the ring, growing or blocking as needed.
    ///
    /// # Errors
    /// - `NotRunning` once the pipe is closed.
    /// - `Aborted` if the pipe is aborted, including while blocked.
    /// - `BufferExhausted` if the sample cannot fit even in an empty ring.
    pub fn enqueue(&self, data: &[u8], info: SampleInfo) -> Result<()> {
        let mut state = self.state.lock();
        match state.mode {
            PipeMode::Open => {}
            PipeMode::Closed => return Err(RecorderError::NotRunning),
            PipeMode::Aborted => return Err(RecorderError::Aborted),
        }

        state.producers_inside += 1;
        let result = loop {
            if state.mode == PipeMode::Aborted {
                break Err(RecorderError::Aborted);
            }
            if state.ring.add(data, info) {
                break Ok(());
            }

            if state.can_grow {
                let before = state.ring.capacity();
                state.can_grow = state.ring.grow();
                if state.can_grow {
                    self.diagnostics.record_growth();
                    debug!(
                        track = %self.kind,
                        from = before,
                        to = state.ring.capacity(),
                        "ring grown"
                    );
                    continue;
                }
                self.diagnostics.record_growth_failure();
                warn!(
                    track = %self.kind,
                    capacity = before,
                    ceiling = state.ring.ceiling(),
                    "ring growth exhausted, falling back to blocking"
                );
            }

            if state.ring.is_empty() && data.len() <= state.ring.ceiling() {
                // Growth failed below the ceiling and nothing queued will free
                // room: wait a little, then try to allocate again.
                self.diagnostics.record_producer_block();
                warn!(
                    track = %self.kind,
                    size = data.len(),
                    capacity = state.ring.capacity(),
                    "ring growth failed below the ceiling, retrying"
                );
                self.not_full.wait_for(&mut state, GROWTH_RETRY);
                if state.ring.grow() {
                    self.diagnostics.record_growth();
                }
                continue;
            }

            if state.ring.is_empty() {
                // Nothing queued will ever free enough room for this sample.
                self.diagnostics.record_buffer_exhausted();
                error!(
                    track = %self.kind,
                    size = data.len(),
                    capacity = state.ring.capacity(),
                    "sample larger than the ring can ever hold"
                );
                break Err(RecorderError::BufferExhausted {
                    track: self.kind,
                    size: data.len(),
                    ceiling: state.ring.ceiling(),
                });
            }

            self.diagnostics.record_producer_block();
            warn!(
                track = %self.kind,
                pts_us = info.pts_us,
                queued = state.ring.len(),
                "blocked until the writer frees space"
            );
            self.not_full.wait(&mut state);
        };
        state.producers_inside -= 1;
        drop(state);

        if result.is_ok() {
            self.diagnostics.record_enqueued(self.kind);
        }
        // Wakes the writer for the new sample, or lets a draining writer
        // re-check whether the last producer has left.
        self.not_empty.notify_one();
        result
    }

    /// Block until a sample is queued and copy it into `scratch`.
    ///
    /// Returns `None` once the pipe is closed and drained, or aborted. The
    /// slot stays occupied until `complete_oldest`.
    pub fn next_sample(&self, scratch: &mut Vec<u8>) -> Option<SampleInfo> {
        let mut state = self.state.lock();
        loop {
            if state.mode == PipeMode::Aborted {
                return None;
            }
            if let Some((bytes, info)) = state.ring.peek_oldest() {
                scratch.clear();
                scratch.extend_from_slice(bytes);
                return Some(info);
            }
            if state.mode == PipeMode::Closed && state.producers_inside == 0 {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Free the slot returned by the last `next_sample` and wake producers.
    pub fn complete_oldest(&self) {
        let removed = self.state.lock().ring.remove_oldest();
        debug_assert!(removed.is_some(), "complete_oldest on an empty ring");
        self.not_full.notify_all();
    }

    /// Stop accepting samples; the writer drains the rest.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.mode == PipeMode::Open {
                state.mode = PipeMode::Closed;
            }
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Discard queued samples and release every waiter.
    pub fn abort(&self) {
        self.state.lock().mode = PipeMode::Aborted;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Number of queued samples.
    pub fn queued(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().ring.capacity()
    }

    pub fn can_grow(&self) -> bool {
        self.state.lock().can_grow
    }
}

impl std::fmt::Debug for TrackPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackPipe")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
