//! JSONL run journal: an append-only record of harvest events.
//!
//! - One JSON object per line: `{"timestamp": ..., "event": {...}}`
//! - Rotates when the file exceeds the size limit (`.1`, `.2`, ...)
//! - Keeps at most `MAX_ROTATIONS` rotated files

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use petreg::{EventSink, HarvestEvent};

/// Default size before rotation (10 MB).
pub const MAX_JOURNAL_SIZE: u64 = 10 * 1024 * 1024;

const MAX_ROTATIONS: u32 = 5;

#[derive(Serialize)]
struct JournalLine<'a> {
    timestamp: String,
    event: &'a HarvestEvent,
}

struct JournalFile {
    file: File,
    current_size: u64,
}

/// Event sink that appends every event to a JSONL file.
pub struct RunJournal {
    path: PathBuf,
    max_size: u64,
    inner: Mutex<JournalFile>,
}

impl RunJournal {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_limit(path, MAX_JOURNAL_SIZE)
    }

    pub fn open_with_limit(path: &Path, max_size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = open_append(path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            max_size,
            inner: Mutex::new(JournalFile { file, current_size }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event.
    pub fn record(&self, event: &HarvestEvent) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if inner.current_size >= self.max_size {
            self.rotate(&mut inner)?;
        }

        let line = serde_json::to_string(&JournalLine {
            timestamp: Utc::now().to_rfc3339(),
            event,
        })?;
        writeln!(inner.file, "{line}")?;
        inner.current_size += line.len() as u64 + 1;
        Ok(())
    }

    /// Shift every generation one step older and start a fresh file.
    fn rotate(&self, inner: &mut JournalFile) -> Result<()> {
        inner.file.flush()?;

        let chain = generations(&self.path);
        if let Some(oldest) = chain.last().filter(|p| p.exists()) {
            std::fs::remove_file(oldest)
                .with_context(|| format!("failed to prune {}", oldest.display()))?;
        }
        // Oldest pair first, so no generation is overwritten.
        for pair in chain.windows(2).rev() {
            let (newer, older) = (&pair[0], &pair[1]);
            if newer.exists() {
                std::fs::rename(newer, older)
                    .with_context(|| format!("failed to rotate {}", newer.display()))?;
            }
        }

        inner.file = open_append(&self.path)?;
        inner.current_size = 0;
        Ok(())
    }
}

impl EventSink for RunJournal {
    fn emit(&self, event: &HarvestEvent) {
        if let Err(e) = self.record(event) {
            tracing::warn!("journal write to {} failed: {e:#}", self.path.display());
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open journal: {}", path.display()))
}

/// The live file followed by its rotated generations, newest first:
/// `journal.jsonl`, `journal.jsonl.1`, ..., `journal.jsonl.5`.
fn generations(base: &Path) -> Vec<PathBuf> {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "journal.jsonl".to_string());
    std::iter::once(base.to_path_buf())
        .chain((1..=MAX_ROTATIONS).map(|i| base.with_file_name(format!("{name}.{i}"))))
        .collect()
}
