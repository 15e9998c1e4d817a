//! Blocking writer loop, one per track.
//!
//! ## Per iteration
//!
//! ```text
//! 1. TrackPipe::next_sample  → copy oldest record into the scratch buffer
//! 2. RotationCoordinator::write
//!      video: rotate first if the segment deadline has passed
//!      audio: wait while a rotation is in progress
//! 3. TrackPipe::complete_oldest → free the slot, wake a blocked producer
//! ```
//!
//! The loop ends when the pipe is closed and drained, or aborted. A fatal
//! write or rotation error aborts every pipe so producers and the other
//! writer stop too.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tracing::{debug, error, info, info_span};

use crate::buffering::sample::TrackKind;
use crate::engine::{pipe::TrackPipe, rotation::RotationCoordinator};
use crate::error::{RecorderError, Result};

#[derive(Default)]
pub struct RecorderDiagnostics {
    pub video_enqueued: AtomicUsize,
    pub audio_enqueued: AtomicUsize,
    pub video_written: AtomicUsize,
    pub audio_written: AtomicUsize,
    pub growth_events: AtomicUsize,
    pub growth_failures: AtomicUsize,
    pub producer_blocks: AtomicUsize,
    pub buffer_exhausted: AtomicUsize,
    pub rotations: AtomicUsize,
    pub segments_finalized: AtomicUsize,
}

impl RecorderDiagnostics {
    pub fn reset(&self) {
        self.video_enqueued.store(0, Ordering::Relaxed);
        self.audio_enqueued.store(0, Ordering::Relaxed);
        self.video_written.store(0, Ordering::Relaxed);
        self.audio_written.store(0, Ordering::Relaxed);
        self.growth_events.store(0, Ordering::Relaxed);
        self.growth_failures.store(0, Ordering::Relaxed);
        self.producer_blocks.store(0, Ordering::Relaxed);
        self.buffer_exhausted.store(0, Ordering::Relaxed);
        self.rotations.store(0, Ordering::Relaxed);
        self.segments_finalized.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            video_enqueued: self.video_enqueued.load(Ordering::Relaxed),
            audio_enqueued: self.audio_enqueued.load(Ordering::Relaxed),
            video_written: self.video_written.load(Ordering::Relaxed),
            audio_written: self.audio_written.load(Ordering::Relaxed),
            growth_events: self.growth_events.load(Ordering::Relaxed),
            growth_failures: self.growth_failures.load(Ordering::Relaxed),
            producer_blocks: self.producer_blocks.load(Ordering::Relaxed),
            buffer_exhausted: self.buffer_exhausted.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            segments_finalized: self.segments_finalized.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_enqueued(&self, kind: TrackKind) {
        match kind {
            TrackKind::Video => self.video_enqueued.fetch_add(1, Ordering::Relaxed),
            TrackKind::Audio => self.audio_enqueued.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_written(&self, kind: TrackKind) {
        match kind {
            TrackKind::Video => self.video_written.fetch_add(1, Ordering::Relaxed),
            TrackKind::Audio => self.audio_written.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_growth(&self) {
        self.growth_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_growth_failure(&self) {
        self.growth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_producer_block(&self) {
        self.producer_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_buffer_exhausted(&self) {
        self.buffer_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_finalized(&self) {
        self.segments_finalized.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub video_enqueued: usize,
    pub audio_enqueued: usize,
    pub video_written: usize,
    pub audio_written: usize,
    pub growth_events: usize,
    pub growth_failures: usize,
    pub producer_blocks: usize,
    pub buffer_exhausted: usize,
    pub rotations: usize,
    pub segments_finalized: usize,
}

impl DiagnosticsSnapshot {
    pub fn written(&self, kind: TrackKind) -> usize {
        match kind {
            TrackKind::Video => self.video_written,
            TrackKind::Audio => self.audio_written,
        }
    }
}

/// Everything one writer thread needs.
pub struct WriterContext {
    pub kind: TrackKind,
    pub pipe: Arc<TrackPipe>,
    pub coordinator: Arc<RotationCoordinator>,
    /// Every pipe of the recording, aborted together on a fatal error.
    pub all_pipes: Vec<Arc<TrackPipe>>,
}

/// Log progress every this many written samples.
const PROGRESS_EVERY: u64 = 500;

/// Run the writer until its pipe is drained or aborted.
///
/// Returns the number of samples this writer wrote.
pub fn run(ctx: WriterContext) -> Result<u64> {
    let span = info_span!("writer", track = %ctx.kind);
    let _enter = span.enter();
    info!("writer started");

    // Reused for every sample; grows to the largest sample seen.
    let mut scratch = Vec::new();
    let mut written = 0u64;

    while let Some(info) = ctx.pipe.next_sample(&mut scratch) {
        let result = ctx.coordinator.write(ctx.kind, &scratch, info);
        ctx.pipe.complete_oldest();

        if let Err(e) = result {
            if !matches!(e, RecorderError::Aborted) {
                error!(written, "writer stopped on fatal error: {e}");
            }
            for pipe in &ctx.all_pipes {
                pipe.abort();
            }
            return Err(e);
        }

        written += 1;
        if written % PROGRESS_EVERY == 0 {
            debug!(written, queued = ctx.pipe.queued(), "writer progress");
        }
    }

    info!(written, "writer finished");
    Ok(written)
}
