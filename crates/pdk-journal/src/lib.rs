//! pdk-journal
//!
//! File-backed run journal: JSON Lines, one event per line, canonically
//! encoded so identical events compare byte-for-byte across hosts. The
//! file rotates once it grows past a size cap, keeping one previous
//! generation, so a long-lived process cannot fill a disk with retry
//! telemetry. Appends never fail the request path: I/O errors are logged
//! and swallowed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pdk_provider::{Journal, JournalEvent};
use pdk_schemas::canonical::canonical_json_of;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Rotation threshold when none is configured.
const DEFAULT_MAX_BYTES: u64 = 32 * 1024 * 1024;

/// One journal line: the event plus its wall-clock timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub ts_utc: DateTime<Utc>,
    #[serde(flatten)]
    pub event: JournalEvent,
}

/// Append-only JSONL journal with single-generation rotation.
///
/// Opening is lazy: the file (and parent dirs) appear on first append, and
/// a restarted process simply keeps appending to the same path. When an
/// append would push the file past the size cap, the current file is
/// renamed to `<path>.1` (replacing any earlier generation) and a fresh
/// file starts.
pub struct FileJournal {
    path: PathBuf,
    max_bytes: u64,
}

impl FileJournal {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create journal directory {:?}", parent))?;
        }
        Ok(Self {
            path,
            max_bytes: DEFAULT_MAX_BYTES,
        })
    }

    /// Override the rotation threshold.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the previous generation lives after a rotation.
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    fn try_append(&self, event: &JournalEvent) -> Result<()> {
        let line = canonical_json_of(&JournalLine {
            ts_utc: Utc::now(),
            event: event.clone(),
        })?;
        self.rotate_if_needed(line.len() as u64 + 1)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open journal {:?}", self.path))?;
        writeln!(file, "{line}").with_context(|| format!("append to journal {:?}", self.path))?;
        Ok(())
    }

    /// Rotate when the pending write would cross the cap. A missing file
    /// means nothing to rotate; the previous generation, if any, is
    /// replaced.
    fn rotate_if_needed(&self, incoming: u64) -> Result<()> {
        let current = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if current == 0 || current + incoming <= self.max_bytes {
            return Ok(());
        }
        let rotated = self.rotated_path();
        fs::rename(&self.path, &rotated)
            .with_context(|| format!("rotate journal {:?} -> {:?}", self.path, rotated))?;
        Ok(())
    }
}

impl Journal for FileJournal {
    fn append(&self, event: JournalEvent) {
        if let Err(e) = self.try_append(&event) {
            warn!(path = ?self.path, error = %e, "journal append failed");
        }
    }
}

/// Read the current generation back, oldest first. Rotated-out events live
/// at [`FileJournal::rotated_path`] and are read separately when needed.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<JournalLine>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read journal {:?}", path.as_ref()))?;

    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("journal line {} is malformed", i + 1))
        })
        .collect()
}
