//! Sample metadata carried alongside the encoded bytes in the ring buffer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which of the two recorded streams a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Registration order on every mux session.
    pub const ALL: [TrackKind; 2] = [TrackKind::Video, TrackKind::Audio];

    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder buffer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const NONE: SampleFlags = SampleFlags(0);
    pub const KEY_FRAME: SampleFlags = SampleFlags(1);
    pub const CODEC_CONFIG: SampleFlags = SampleFlags(1 << 1);
    pub const END_OF_STREAM: SampleFlags = SampleFlags(1 << 2);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SampleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

impl std::ops::BitOr for SampleFlags {
    type Output = SampleFlags;

    fn bitor(self, rhs: SampleFlags) -> SampleFlags {
        SampleFlags(self.0 | rhs.0)
    }
}

/// Metadata for one encoded sample.
///
/// Immutable once enqueued; `size` always equals the payload length stored
/// in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleInfo {
    /// Presentation timestamp in microseconds, non-decreasing per track.
    pub pts_us: i64,
    pub flags: SampleFlags,
    /// Payload length in bytes.
    pub size: usize,
}

impl SampleInfo {
    pub fn new(pts_us: i64, flags: SampleFlags, size: usize) -> Self {
        Self {
            pts_us,
            flags,
            size,
        }
    }
}
