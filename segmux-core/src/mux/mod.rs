//! Container muxer abstraction.
//!
//! The `Muxer` trait is the seam to whatever serialises samples into a file.
//! `MuxSession` drives one muxer through its strict lifecycle; the rotation
//! coordinator opens a fresh session per segment through a `MuxerFactory`.
//!
//! All calls are synchronous and block the calling writer thread.

pub mod container;
pub mod session;

pub use container::{read_segment, SegmentContents, SegmentFileMuxer, SegmentFileMuxerFactory};
pub use session::MuxSession;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffering::sample::{SampleInfo, TrackKind};
use crate::error::Result;

/// Output format of one encoder, registered as a track on every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFormat {
    pub kind: TrackKind,
    /// Codec MIME type, e.g. `video/avc` or `audio/mp4a-latm`.
    pub mime: String,
    /// Codec-specific configuration bytes (SPS/PPS, AudioSpecificConfig, ...).
    #[serde(default)]
    pub codec_config: Vec<u8>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
}

impl TrackFormat {
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            kind: TrackKind::Video,
            mime: mime.into(),
            codec_config: Vec::new(),
            width: Some(width),
            height: Some(height),
            sample_rate: None,
            channels: None,
        }
    }

    pub fn audio(mime: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            kind: TrackKind::Audio,
            mime: mime.into(),
            codec_config: Vec::new(),
            width: None,
            height: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
        }
    }
}

/// Supplies the current encoder output format for a track.
///
/// Queried once per session, so an encoder that renegotiated its format
/// mid-recording is picked up at the next rotation.
pub trait FormatSource: Send + Sync + 'static {
    fn output_format(&self, kind: TrackKind) -> Result<TrackFormat>;
}

/// Fixed formats, for callers whose encoders never renegotiate.
#[derive(Debug, Clone)]
pub struct StaticFormats {
    pub video: TrackFormat,
    pub audio: TrackFormat,
}

impl FormatSource for StaticFormats {
    fn output_format(&self, kind: TrackKind) -> Result<TrackFormat> {
        Ok(match kind {
            TrackKind::Video => self.video.clone(),
            TrackKind::Audio => self.audio.clone(),
        })
    }
}

/// Contract for a container writer bound to one open output file.
pub trait Muxer: Send + 'static {
    /// Register a track; returns the container's index for it.
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize>;

    /// Write the container header. No tracks may be added afterwards.
    fn start(&mut self) -> Result<()>;

    /// Serialise one sample into the container.
    fn write_sample(&mut self, track_index: usize, data: &[u8], info: &SampleInfo) -> Result<()>;

    /// Flush and finalise the container.
    fn stop(&mut self) -> Result<()>;

    /// Release the underlying file handle.
    fn release(&mut self);
}

/// Opens a muxer for a new segment file.
pub trait MuxerFactory: Send + Sync + 'static {
    fn open(&self, path: &Path) -> Result<Box<dyn Muxer>>;
}
