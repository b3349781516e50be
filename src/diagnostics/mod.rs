//! # Diagnostics Module
//!
//! Records consent, capture, buffer and delivery failures for the host.
//!
//! This module handles:
//! - Keeping recent diagnostic records in memory for retrieval
//! - Emitting each record as a structured `tracing` event
//! - Writing records to rotating JSONL files (max N records per file)
//! - Retaining only the last M files

pub mod logger;

pub use logger::RotatingLogger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

use crate::config::DiagnosticsConfig;
use crate::model::{CaptureKind, EventId};

/// Which component produced a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Consent,
    Capture,
    Buffer,
    Delivery,
}

/// A single recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub kind: DiagnosticKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<CaptureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl DiagnosticRecord {
    pub fn new(kind: DiagnosticKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            capability: None,
            event_id: None,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_capability(mut self, capability: CaptureKind) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn with_event(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

/// Shared diagnostics sink.
#[derive(Debug)]
pub struct Diagnostics {
    recent: Mutex<VecDeque<DiagnosticRecord>>,
    max_in_memory: usize,
    logger: Option<Mutex<RotatingLogger>>,
}

impl Diagnostics {
    /// In-memory only
    pub fn new(max_in_memory: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            max_in_memory: max_in_memory.max(1),
            logger: None,
        }
    }

    /// Builds the sink from configuration. Relative log directories resolve
    /// against `data_dir`.
    pub fn from_config(config: &DiagnosticsConfig, data_dir: &Path) -> Self {
        let mut diagnostics = Self::new(config.max_in_memory);
        if config.enabled {
            let dir = data_dir.join(&config.log_dir);
            diagnostics.logger = Some(Mutex::new(RotatingLogger::new(
                dir,
                config.max_records_per_file,
                config.max_files_to_keep,
            )));
        }
        diagnostics
    }

    pub fn record(&self, record: DiagnosticRecord) {
        warn!(
            kind = ?record.kind,
            capability = ?record.capability,
            event_id = ?record.event_id,
            "{}",
            record.reason
        );

        if let Some(logger) = &self.logger {
            // A failing log file must not take the pipeline down
            if let Err(e) = lock(logger).write(&record) {
                error!("Failed to write diagnostics log: {}", e);
            }
        }

        let mut recent = lock(&self.recent);
        if recent.len() >= self.max_in_memory {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Recent records, oldest first
    pub fn snapshot(&self) -> Vec<DiagnosticRecord> {
        lock(&self.recent).iter().cloned().collect()
    }

    pub fn count(&self, kind: DiagnosticKind, capability: Option<CaptureKind>) -> usize {
        lock(&self.recent)
            .iter()
            .filter(|r| r.kind == kind && (capability.is_none() || r.capability == capability))
            .count()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
