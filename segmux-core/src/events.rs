//! Event types broadcast to recorder observers.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `RecorderStatusEvent` | `Recorder::subscribe_status` |
//! | `SegmentEvent` | `Recorder::subscribe_segments` |

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatusEvent {
    pub status: RecorderStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderStatus {
    /// Created, `start()` not yet called.
    Idle,
    /// Both tracks are accepting samples.
    Recording,
    /// The video writer is swapping segments; audio writes are held.
    Rotating,
    /// Producers closed, writers draining.
    Stopping,
    /// Last segment finalized; the recorder may be started again.
    Stopped,
    /// A fatal failure ended the recording early.
    Error,
}

// ---------------------------------------------------------------------------
// Segment events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEvent {
    pub index: u64,
    pub path: PathBuf,
    pub state: SegmentState,
    pub at: DateTime<Utc>,
}

impl SegmentEvent {
    pub fn new(index: u64, path: PathBuf, state: SegmentState) -> Self {
        Self {
            index,
            path,
            state,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    /// Container opened and started.
    Opened,
    /// Container stopped and released; the file is complete.
    Finalized,
    /// The segment could not be completed and is not playable.
    Corrupt,
}
