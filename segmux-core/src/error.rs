use std::path::PathBuf;

use thiserror::Error;

use crate::buffering::sample::TrackKind;

/// All errors produced by segmux-core.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("{track} sample of {size} bytes can never fit under the {ceiling}-byte ring ceiling")]
    BufferExhausted {
        track: TrackKind,
        size: usize,
        ceiling: usize,
    },

    #[error("rotation to segment {segment} failed: {source}")]
    Rotation {
        segment: u64,
        #[source]
        source: Box<RecorderError>,
    },

    #[error("writing {track} sample into segment {segment} failed: {source}")]
    Write {
        segment: u64,
        track: TrackKind,
        #[source]
        source: Box<RecorderError>,
    },

    #[error("finalizing segment {segment} failed: {source}")]
    Finalize {
        segment: u64,
        #[source]
        source: Box<RecorderError>,
    },

    #[error("output location {path} is not writable: {reason}")]
    Permission { path: PathBuf, reason: String },

    #[error("muxer error: {0}")]
    Muxer(String),

    #[error("invalid mux session state: {0}")]
    InvalidState(&'static str),

    #[error("recorder is already running")]
    AlreadyRunning,

    #[error("recorder is not running")]
    NotRunning,

    #[error("recording was aborted")]
    Aborted,

    #[error(transparent)]
    Failed(Box<RecordingFailure>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RecorderError {
    /// Segment left incomplete by this error, if any.
    pub fn corrupt_segment(&self) -> Option<u64> {
        match self {
            RecorderError::Write { segment, .. } | RecorderError::Finalize { segment, .. } => {
                Some(*segment)
            }
            RecorderError::Failed(failure) => failure.corrupt_segment,
            _ => None,
        }
    }

    /// Whether the error ends the recording.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RecorderError::Rotation { .. }
                | RecorderError::Write { .. }
                | RecorderError::Finalize { .. }
                | RecorderError::Permission { .. }
                | RecorderError::Failed(_)
        )
    }
}

/// Outcome of a recording that ended on a fatal error.
#[derive(Debug, Error)]
#[error("recording failed: {error}")]
pub struct RecordingFailure {
    #[source]
    pub error: RecorderError,
    /// Segment that is incomplete on disk, if the failure left one behind.
    pub corrupt_segment: Option<u64>,
    /// Segments that were fully finalized before the failure and remain valid.
    pub finalized_segments: Vec<u64>,
}

pub type Result<T> = std::result::Result<T, RecorderError>;
