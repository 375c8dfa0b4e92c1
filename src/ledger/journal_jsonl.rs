//! JSONL ledger journal for audit and export.
//!
//! Enable with the `jsonl` feature flag. The journal is not a balance
//! store: it mirrors every appended ledger entry to an append-only JSONL
//! file and can re-read them for offline replay. One entry per line,
//! incremental appends only.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::entry::LedgerEntry;
use super::{LedgerError, LedgerResult};

/// Sync mode for file operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// No explicit sync (OS buffering only).
    #[default]
    None,
    /// Sync after every write (safest, slowest).
    OnWrite,
}

/// Configuration for the JSONL journal.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// Journal file path (default: ./credit-ledger.jsonl).
    pub path: PathBuf,
    /// File sync mode for durability.
    pub sync_mode: SyncMode,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("credit-ledger.jsonl"),
            sync_mode: SyncMode::default(),
        }
    }
}

impl JournalConfig {
    pub fn builder() -> JournalConfigBuilder {
        JournalConfigBuilder::default()
    }
}

/// Builder for JournalConfig.
#[derive(Default)]
pub struct JournalConfigBuilder {
    path: Option<PathBuf>,
    sync_mode: Option<SyncMode>,
}

impl JournalConfigBuilder {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = Some(mode);
        self
    }

    pub fn build(self) -> JournalConfig {
        let default = JournalConfig::default();
        JournalConfig {
            path: self.path.unwrap_or(default.path),
            sync_mode: self.sync_mode.unwrap_or(default.sync_mode),
        }
    }
}

fn read_entries_sync(path: &Path) -> LedgerResult<Vec<LedgerEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = std::fs::File::open(path).map_err(|e| LedgerError::Storage {
        message: format!("Failed to open {}: {}", path.display(), e),
    })?;

    let reader = BufReader::with_capacity(64 * 1024, file);
    let mut entries = Vec::with_capacity(128);

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| LedgerError::Storage {
            message: format!("Read error at line {}: {}", line_num + 1, e),
        })?;

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<LedgerEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_num + 1,
                    error = %e,
                    "Skipping malformed journal entry"
                );
            }
        }
    }

    Ok(entries)
}

fn append_entries_sync(path: &Path, entries: &[LedgerEntry], sync: bool) -> LedgerResult<()> {
    if entries.is_empty() {
        return Ok(());
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| LedgerError::Storage {
            message: format!("Failed to create directory {}: {}", parent.display(), e),
        })?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LedgerError::Storage {
            message: format!("Failed to open {} for writing: {}", path.display(), e),
        })?;

    let mut writer = std::io::BufWriter::with_capacity(64 * 1024, file);

    for entry in entries {
        serde_json::to_writer(&mut writer, entry)?;
        writeln!(writer).map_err(|e| LedgerError::Storage {
            message: format!("Write failed: {}", e),
        })?;
    }

    writer.flush().map_err(|e| LedgerError::Storage {
        message: format!("Flush failed: {}", e),
    })?;

    if sync {
        writer
            .into_inner()
            .map_err(|e| LedgerError::Storage {
                message: format!("Buffer error: {}", e.error()),
            })?
            .sync_all()
            .map_err(|e| LedgerError::Storage {
                message: format!("Sync failed: {}", e),
            })?;
    }

    Ok(())
}

/// Append-only JSONL mirror of the ledger.
#[derive(Clone, Debug)]
pub struct JsonlJournal {
    config: JournalConfig,
}

impl JsonlJournal {
    pub fn new(config: JournalConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Append entries to the journal file.
    pub async fn append(&self, entries: &[LedgerEntry]) -> LedgerResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let path = self.config.path.clone();
        let sync = self.config.sync_mode == SyncMode::OnWrite;
        let entries = entries.to_vec();
        tokio::task::spawn_blocking(move || append_entries_sync(&path, &entries, sync))
            .await
            .map_err(|e| LedgerError::Storage {
                message: format!("Task join error: {}", e),
            })?
    }

    /// Re-read every journaled entry, in append order.
    pub async fn read_all(&self) -> LedgerResult<Vec<LedgerEntry>> {
        let path = self.config.path.clone();
        tokio::task::spawn_blocking(move || read_entries_sync(&path))
            .await
            .map_err(|e| LedgerError::Storage {
                message: format!("Task join error: {}", e),
            })?
    }
}
