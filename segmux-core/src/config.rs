//! Recorder configuration (JSON file, every field optional).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::buffering::sample::TrackKind;
use crate::error::{RecorderError, Result};
use crate::output::SegmentNamer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RecorderConfig {
    /// Directory segment files are written into. Default: `./segments`.
    pub output_dir: PathBuf,
    /// Shared file name prefix. Default: `video`.
    pub base_name: String,
    /// File extension without the dot. Default: `seg`.
    pub extension: String,
    /// Index of the first segment file. Default: 101.
    pub first_segment_index: u64,
    /// Fixed segment length. Default: 5000 ms.
    pub segment_duration_ms: u64,
    /// Initial video ring capacity in bytes. Default: 1 MiB.
    pub video_ring_bytes: usize,
    /// Initial audio ring capacity in bytes. Default: 128 KiB.
    pub audio_ring_bytes: usize,
    /// Hard growth ceiling per ring in bytes. Default: 64 MiB.
    pub max_ring_bytes: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("segments"),
            base_name: "video".into(),
            extension: "seg".into(),
            first_segment_index: 101,
            segment_duration_ms: 5_000,
            video_ring_bytes: 1 << 20,
            audio_ring_bytes: 128 << 10,
            max_ring_bytes: 64 << 20,
        }
    }
}

impl RecorderConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no recorder config found, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_duration_ms == 0 {
            return Err(RecorderError::Config("segmentDurationMs must be positive".into()));
        }
        if self.base_name.trim().is_empty() {
            return Err(RecorderError::Config("baseName must not be empty".into()));
        }
        if self.base_name.contains(['/', '\\']) {
            return Err(RecorderError::Config("baseName must not contain path separators".into()));
        }
        if u32::try_from(self.max_ring_bytes).is_err() {
            return Err(RecorderError::Config(
                "maxRingBytes must fit in a 32-bit sample length".into(),
            ));
        }
        if self.video_ring_bytes > self.max_ring_bytes || self.audio_ring_bytes > self.max_ring_bytes {
            return Err(RecorderError::Config(
                "initial ring capacity exceeds maxRingBytes".into(),
            ));
        }
        Ok(())
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    pub fn initial_ring_bytes(&self, kind: TrackKind) -> usize {
        match kind {
            TrackKind::Video => self.video_ring_bytes,
            TrackKind::Audio => self.audio_ring_bytes,
        }
    }

    pub fn namer(&self) -> SegmentNamer {
        SegmentNamer::new(
            self.output_dir.clone(),
            self.base_name.clone(),
            self.extension.clone(),
            self.first_segment_index,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: RecorderConfig =
            serde_json::from_str(r#"{"baseName":"cam","segmentDurationMs":2000}"#)
                .expect("parse");
        assert_eq!(config.base_name, "cam");
        assert_eq!(config.segment_duration(), Duration::from_secs(2));
        assert_eq!(config.first_segment_index, 101);
        assert_eq!(config.max_ring_bytes, 64 << 20);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecorderConfig::load(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config, RecorderConfig::default());
    }

    #[test]
    fn save_then_load_preserves_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("recorder.json");
        let config = RecorderConfig {
            base_name: "dashcam".into(),
            max_ring_bytes: 8 << 20,
            ..RecorderConfig::default()
        };
        config.save(&path).expect("save");
        assert_eq!(RecorderConfig::load(&path).expect("load"), config);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero = RecorderConfig {
            segment_duration_ms: 0,
            ..RecorderConfig::default()
        };
        assert!(matches!(zero.validate(), Err(RecorderError::Config(_))));

        let oversized = RecorderConfig {
            video_ring_bytes: 2 << 20,
            max_ring_bytes: 1 << 20,
            ..RecorderConfig::default()
        };
        assert!(oversized.validate().is_err());

        if let Ok(too_big) = usize::try_from(u64::from(u32::MAX) + 1) {
            let unbounded = RecorderConfig {
                max_ring_bytes: too_big,
                ..RecorderConfig::default()
            };
            assert!(matches!(unbounded.validate(), Err(RecorderError::Config(_))));
        }

        let nested = RecorderConfig {
            base_name: "a/b".into(),
            ..RecorderConfig::default()
        };
        assert!(nested.validate().is_err());
    }
}
