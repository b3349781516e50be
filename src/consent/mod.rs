//! # Consent Module
//!
//! Per-capability consent tracking.
//!
//! This module handles:
//! - Reading the current decision for a capability without suspending
//! - Prompting the user through a host-supplied [`ConsentPrompter`]
//! - Coalescing concurrent prompts for the same capability
//! - Persisting immutable [`ConsentRecord`]s to an append-only ledger
//! - Minting the [`ConsentGrant`] that capture calls and events require

pub mod gate;
pub mod prompt;
pub mod record;

pub use gate::{ConsentGate, RepromptPolicy};
pub use prompt::{ConsentPrompter, ConsentRequest};
pub use record::{ConsentLedger, ConsentRecord, Decision};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CaptureKind, SessionId};

/// Current consent state for a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Granted,
    Denied,
    Undetermined,
}

/// Result of a consent request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentDecision {
    Granted,
    Denied,
    /// The prompt was closed without a choice; nothing is recorded
    Dismissed,
}

impl From<Decision> for ConsentDecision {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Granted => ConsentDecision::Granted,
            Decision::Denied => ConsentDecision::Denied,
        }
    }
}

/// Proof that consent for one capability was granted.
///
/// Only [`ConsentGate::authorize`] creates these.
#[derive(Debug, Clone)]
pub struct ConsentGrant {
    kind: CaptureKind,
    session_id: SessionId,
    consent_version: String,
    record_id: Uuid,
}

impl ConsentGrant {
    pub(crate) fn new(record: &ConsentRecord) -> Self {
        Self {
            kind: record.kind,
            session_id: record.session_id,
            consent_version: record.consent_version.clone(),
            record_id: record.id,
        }
    }

    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn consent_version(&self) -> &str {
        &self.consent_version
    }

    /// Id of the consent record this grant was derived from
    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    #[cfg(test)]
    pub(crate) fn for_tests(kind: CaptureKind) -> Self {
        Self {
            kind,
            session_id: SessionId::new(),
            consent_version: "test-v1".to_string(),
            record_id: Uuid::new_v4(),
        }
    }
}
