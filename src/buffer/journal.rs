//! Write-ahead journal backing the event buffer.
//!
//! Each mutation is one JSON line. Replaying the lines in order rebuilds the
//! buffer; compaction rewrites the file as one `append` line per live entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::BufferedEvent;
use crate::model::{DeliveryState, EventId};
use crate::storage::{read_jsonl, rewrite_jsonl, JsonlWriter, StorageError};

/// A single journaled mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    Append {
        entry: BufferedEvent,
    },
    Transition {
        id: EventId,
        state: DeliveryState,
        retry_count: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    },
    Remove {
        id: EventId,
    },
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    writer: JsonlWriter,
    ops_since_compaction: usize,
}

impl Journal {
    /// Opens the journal and returns every op recorded so far.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, Vec<JournalOp>), StorageError> {
        let path = path.as_ref().to_path_buf();
        let ops: Vec<JournalOp> = read_jsonl(&path)?;
        let writer = JsonlWriter::open(&path)?;
        debug!("Replaying {} journal ops from {}", ops.len(), path.display());

        let journal = Self {
            path,
            writer,
            ops_since_compaction: ops.len(),
        };
        Ok((journal, ops))
    }

    pub fn record(&mut self, op: &JournalOp) -> Result<(), StorageError> {
        self.writer.append(op)?;
        self.ops_since_compaction += 1;
        Ok(())
    }

    pub fn ops_since_compaction(&self) -> usize {
        self.ops_since_compaction
    }

    /// Replaces the journal with a snapshot of `entries`.
    pub fn compact<'a, I>(&mut self, entries: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = &'a BufferedEvent>,
    {
        let snapshot: Vec<JournalOp> = entries
            .into_iter()
            .map(|entry| JournalOp::Append { entry: entry.clone() })
            .collect();

        rewrite_jsonl(&self.path, &snapshot)?;
        // The old handle points at the replaced file
        self.writer = JsonlWriter::open(&self.path)?;
        debug!(
            "Compacted journal {} ({} ops -> {} entries)",
            self.path.display(),
            self.ops_since_compaction,
            snapshot.len()
        );
        self.ops_since_compaction = snapshot.len();
        Ok(())
    }
}
