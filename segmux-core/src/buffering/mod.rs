//! Per-track sample buffering.
//!
//! `SampleRing` is a growable byte ring of variably-sized encoded samples.
//! It has no locking of its own; `engine::pipe::TrackPipe` wraps one ring
//! per track with the producer/consumer synchronisation.

pub mod ring;
pub mod sample;

pub use ring::SampleRing;
pub use sample::{SampleFlags, SampleInfo, TrackKind};
