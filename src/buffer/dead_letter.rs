//! Terminal store for events that will never be delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

use crate::model::CaptureEvent;
use crate::storage::{read_jsonl, JsonlWriter, StorageError};

/// An event removed from the buffer without delivery, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event: CaptureEvent,
    pub reason: String,
    pub retry_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Dead letters on disk, with the most recent ones kept in memory
#[derive(Debug)]
pub struct DeadLetterStore {
    recent: VecDeque<DeadLetterRecord>,
    window: usize,
    writer: JsonlWriter,
}

impl DeadLetterStore {
    /// Opens the store, keeping at most `window` of the newest records in
    /// memory. Older records stay on disk.
    pub fn open<P: AsRef<Path>>(path: P, window: usize) -> Result<Self, StorageError> {
        let records: Vec<DeadLetterRecord> = read_jsonl(path.as_ref())?;
        let skip = records.len().saturating_sub(window);
        let recent = records.into_iter().skip(skip).collect();
        let writer = JsonlWriter::open(path)?;
        Ok(Self { recent, window, writer })
    }

    pub fn push(&mut self, record: DeadLetterRecord) -> Result<(), StorageError> {
        self.writer.append(&record)?;
        if self.window == 0 {
            return Ok(());
        }
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
        Ok(())
    }

    /// Newest records, oldest first
    pub fn recent(&self) -> Vec<DeadLetterRecord> {
        self.recent.iter().cloned().collect()
    }
}
