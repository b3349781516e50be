//! Immutable consent records and the append-only ledger that stores them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use crate::model::{CaptureKind, SessionId};
use crate::storage::{read_jsonl, JsonlWriter, StorageError};

/// A stored user choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Granted,
    Denied,
}

/// One consent decision. Never mutated; a later record supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub kind: CaptureKind,
    pub decision: Decision,
    /// Version of the consent agreement shown to the user
    pub consent_version: String,
    /// Host application version at decision time
    pub app_version: String,
    pub decided_at: DateTime<Utc>,
}

/// Append-only store of consent records for all sessions.
#[derive(Debug)]
pub struct ConsentLedger {
    records: Vec<ConsentRecord>,
    writer: JsonlWriter,
}

impl ConsentLedger {
    /// Opens the ledger at `path`, replaying existing records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let records: Vec<ConsentRecord> = read_jsonl(path.as_ref())?;
        debug!("Loaded {} consent records from {}", records.len(), path.as_ref().display());
        let writer = JsonlWriter::open(path)?;
        Ok(Self { records, writer })
    }

    /// Persists `record`; it becomes visible only once it is on disk.
    pub fn append(&mut self, record: ConsentRecord) -> Result<(), StorageError> {
        self.writer.append(&record)?;
        self.records.push(record);
        Ok(())
    }

    /// Most recent record for a session and capability
    pub fn latest(&self, session_id: SessionId, kind: CaptureKind) -> Option<&ConsentRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.session_id == session_id && r.kind == kind)
    }

    /// All records of a session in write order
    pub fn history(&self, session_id: SessionId) -> Vec<ConsentRecord> {
        self.records
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(session_id: SessionId, kind: CaptureKind, decision: Decision) -> ConsentRecord {
        ConsentRecord {
            id: Uuid::new_v4(),
            session_id,
            kind,
            decision,
            consent_version: "v1".to_string(),
            app_version: "1.0.0".to_string(),
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn test_latest_record_supersedes_earlier() {
        let dir = tempdir().unwrap();
        let session = SessionId::new();
        let mut ledger = ConsentLedger::open(dir.path().join("consent.jsonl")).unwrap();

        ledger.append(record(session, CaptureKind::Location, Decision::Granted)).unwrap();
        ledger.append(record(session, CaptureKind::Location, Decision::Denied)).unwrap();

        let latest = ledger.latest(session, CaptureKind::Location).unwrap();
        assert_eq!(latest.decision, Decision::Denied);
        assert_eq!(ledger.history(session).len(), 2);
    }

    #[test]
    fn test_records_are_scoped_by_session() {
        let dir = tempdir().unwrap();
        let mut ledger = ConsentLedger::open(dir.path().join("consent.jsonl")).unwrap();
        let a = SessionId::new();
        let b = SessionId::new();

        ledger.append(record(a, CaptureKind::CameraFrame, Decision::Granted)).unwrap();

        assert!(ledger.latest(a, CaptureKind::CameraFrame).is_some());
        assert!(ledger.latest(b, CaptureKind::CameraFrame).is_none());
        assert!(ledger.latest(a, CaptureKind::Location).is_none());
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consent.jsonl");
        let session = SessionId::new();
        let written = record(session, CaptureKind::Location, Decision::Granted);

        {
            let mut ledger = ConsentLedger::open(&path).unwrap();
            ledger.append(written.clone()).unwrap();
        }

        let ledger = ConsentLedger::open(&path).unwrap();
        assert_eq!(ledger.latest(session, CaptureKind::Location), Some(&written));
    }

    #[test]
    fn test_decision_after_torn_write_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consent.jsonl");
        let session = SessionId::new();
        {
            let mut ledger = ConsentLedger::open(&path).unwrap();
            ledger.append(record(session, CaptureKind::Location, Decision::Granted)).unwrap();
        }
        let mut contents = std::fs::read(&path).unwrap();
        contents.extend_from_slice(b"{\"id\":\"");
        std::fs::write(&path, contents).unwrap();

        let revoked = record(session, CaptureKind::Location, Decision::Denied);
        {
            let mut ledger = ConsentLedger::open(&path).unwrap();
            ledger.append(revoked.clone()).unwrap();
        }

        let ledger = ConsentLedger::open(&path).unwrap();
        assert_eq!(ledger.latest(session, CaptureKind::Location), Some(&revoked));
        assert_eq!(ledger.history(session).len(), 2);
    }
}
