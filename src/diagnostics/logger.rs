//! Rotating JSONL log files.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::storage::{JsonlWriter, StorageError};

const FILE_PREFIX: &str = "diagnostics-";
const FILE_SUFFIX: &str = ".jsonl";

/// Appends records to numbered JSONL files, starting a new file every
/// `max_records_per_file` records and keeping the newest `max_files_to_keep`.
#[derive(Debug)]
pub struct RotatingLogger {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    current: Option<JsonlWriter>,
    records_in_current: usize,
    file_counter: u32,
}

impl RotatingLogger {
    pub fn new<P: AsRef<Path>>(dir: P, max_records_per_file: usize, max_files_to_keep: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_records_per_file: max_records_per_file.max(1),
            max_files_to_keep: max_files_to_keep.max(1),
            current: None,
            records_in_current: 0,
            file_counter: 0,
        }
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<(), StorageError> {
        if self.current.is_none() || self.records_in_current >= self.max_records_per_file {
            self.rotate()?;
        }

        if let Some(writer) = self.current.as_mut() {
            writer.append(record)?;
            self.records_in_current += 1;
        }
        Ok(())
    }

    /// Path of the file currently written to
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(JsonlWriter::path)
    }

    fn rotate(&mut self) -> Result<(), StorageError> {
        let name = format!(
            "{}{}-{:04}{}",
            FILE_PREFIX,
            chrono::Utc::now().format("%Y%m%dT%H%M%S"),
            self.file_counter,
            FILE_SUFFIX
        );
        self.file_counter = self.file_counter.wrapping_add(1);

        let path = self.dir.join(name);
        debug!("Rotating diagnostics log to {}", path.display());
        self.current = Some(JsonlWriter::open(&path)?);
        self.records_in_current = 0;
        self.prune()
    }

    fn prune(&self) -> Result<(), StorageError> {
        let mut files = log_files(&self.dir)?;
        // Names sort chronologically
        files.sort();

        let excess = files.len().saturating_sub(self.max_files_to_keep);
        for path in files.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove old diagnostics log {}: {}", path.display(), e);
            }
        }
        Ok(())
    }
}

/// Diagnostics log files in `dir`, unsorted
pub fn log_files(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX));
        if is_log {
            files.push(path);
        }
    }
    Ok(files)
}
