//! Segment file naming and output directory checks.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{RecorderError, Result};

/// Hands out `<dir>/<base>_<index>.<ext>` paths with a strictly increasing
/// index, one per segment.
#[derive(Debug, Clone)]
pub struct SegmentNamer {
    dir: PathBuf,
    base_name: String,
    extension: String,
    next_index: u64,
}

impl SegmentNamer {
    pub fn new(
        dir: impl Into<PathBuf>,
        base_name: impl Into<String>,
        extension: impl Into<String>,
        first_index: u64,
    ) -> Self {
        Self {
            dir: dir.into(),
            base_name: base_name.into(),
            extension: extension.into(),
            next_index: first_index,
        }
    }

    /// Index the next call to `next_path` will use.
    pub fn peek_index(&self) -> u64 {
        self.next_index
    }

    /// Claim the next segment index and its path.
    pub fn next_path(&mut self) -> (u64, PathBuf) {
        let index = self.next_index;
        self.next_index += 1;
        (index, self.path_for(index))
    }

    /// Move past every `<base>_<index>.<ext>` already in the directory, so a
    /// new recording never reuses a finished segment's name.
    ///
    /// A missing directory counts as empty.
    pub fn skip_existing(&mut self) -> Result<()> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let before = self.next_index;
        for entry in entries {
            let name = entry?.file_name();
            if let Some(index) = name.to_str().and_then(|n| self.index_of(n)) {
                self.next_index = self.next_index.max(index.saturating_add(1));
            }
        }
        if self.next_index != before {
            info!(
                dir = %self.dir.display(),
                next_index = self.next_index,
                "existing segments found, continuing numbering"
            );
        }
        Ok(())
    }

    /// Segment index encoded in `file_name`, if it is one of ours.
    fn index_of(&self, file_name: &str) -> Option<u64> {
        let rest = file_name.strip_prefix(self.base_name.as_str())?.strip_prefix('_')?;
        let digits = if self.extension.is_empty() {
            rest
        } else {
            rest.strip_suffix(self.extension.as_str())?.strip_suffix('.')?
        };
        digits.parse().ok()
    }

    pub fn path_for(&self, index: u64) -> PathBuf {
        let file = if self.extension.is_empty() {
            format!("{}_{index}", self.base_name)
        } else {
            format!("{}_{index}.{}", self.base_name, self.extension)
        };
        self.dir.join(file)
    }
}

/// Create `dir` if needed and prove it is writable by creating and removing
/// a scratch file.
///
/// # Errors
/// `RecorderError::Permission` naming the directory and the OS reason.
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    let denied = |reason: String| RecorderError::Permission {
        path: dir.to_path_buf(),
        reason,
    };

    fs::create_dir_all(dir).map_err(|e| denied(format!("cannot create directory: {e}")))?;
    if !dir.is_dir() {
        return Err(denied("not a directory".into()));
    }

    let scratch = dir.join(format!(".segmux-write-check-{}", std::process::id()));
    fs::write(&scratch, b"").map_err(|e| denied(format!("cannot create files: {e}")))?;
    if let Err(e) = fs::remove_file(&scratch) {
        debug!(path = %scratch.display(), "failed to remove write check file: {e}");
    }

    info!(dir = %dir.display(), "output directory ready");
    Ok(())
}
