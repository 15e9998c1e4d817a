//! # segmux-core
//!
//! Buffers encoded audio and video samples from two independent encoders and
//! writes them, in order, into a rotating sequence of fixed-duration segment
//! files.
//!
//! ## Architecture
//!
//! ```text
//! video encoder ─► on_sample_available ─► TrackPipe(SampleRing) ─► video writer ─┐
//!                                                                                 ├─► RotationCoordinator ─► MuxSession ─► <base>_<n>.seg
//! audio encoder ─► on_sample_available ─► TrackPipe(SampleRing) ─► audio writer ─┘
//! ```
//!
//! Producers only copy into their ring and return the encoder buffer. Each
//! writer thread drains its own ring; the video writer alone decides when a
//! segment is cut, and the audio writer waits out the cut instead of writing
//! into a closing file.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod mux;
pub mod output;

// Convenience re-exports for downstream crates
pub use buffering::{SampleFlags, SampleInfo, TrackKind};
pub use config::RecorderConfig;
pub use engine::rotation::{Clock, ManualClock, SystemClock, ROTATION_DRIVER};
pub use engine::{Recorder, RecordingSummary};
pub use error::{RecorderError, RecordingFailure};
pub use events::{RecorderStatus, RecorderStatusEvent, SegmentEvent, SegmentState};
pub use mux::{FormatSource, Muxer, MuxerFactory, StaticFormats, TrackFormat};
