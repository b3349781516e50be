//! # Consent Gate
//!
//! Enforces that nothing is captured without an explicit, current consent
//! decision for that capability.
//!
//! A decision counts only if it was recorded for the current session under
//! the current consent agreement version. Denials are cached; whether they
//! can be asked again is governed by [`RepromptPolicy`].

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use super::prompt::{ConsentPrompter, ConsentRequest};
use super::record::{ConsentLedger, ConsentRecord, Decision};
use super::{ConsentDecision, ConsentGrant, ConsentState};
use crate::config::ConsentConfig;
use crate::error::ConsentError;
use crate::model::{CaptureKind, SessionId};

/// When a previously denied capability may be asked for again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepromptPolicy {
    /// A denial stands for the whole session
    Never,
    /// A denial recorded under an older app version may be asked again once
    OncePerAppVersion,
}

/// Per-capability consent tracking for one session.
pub struct ConsentGate {
    session_id: SessionId,
    consent_version: String,
    app_version: String,
    policy: RepromptPolicy,
    prompter: Arc<dyn ConsentPrompter>,
    ledger: Mutex<ConsentLedger>,
    /// Held while a prompt is on screen; one prompt at a time
    prompt_lock: tokio::sync::Mutex<()>,
    /// Outcome of the last completed prompt per capability, tagged with a sequence number
    completed_prompts: Mutex<HashMap<CaptureKind, (u64, ConsentDecision)>>,
    prompt_seq: AtomicU64,
}

impl std::fmt::Debug for ConsentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentGate")
            .field("session_id", &self.session_id)
            .field("consent_version", &self.consent_version)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ConsentGate {
    pub fn new(
        session_id: SessionId,
        config: &ConsentConfig,
        ledger: ConsentLedger,
        prompter: Arc<dyn ConsentPrompter>,
    ) -> Self {
        Self {
            session_id,
            consent_version: config.consent_version.clone(),
            app_version: config.app_version.clone(),
            policy: config.reprompt_policy,
            prompter,
            ledger: Mutex::new(ledger),
            prompt_lock: tokio::sync::Mutex::new(()),
            completed_prompts: Mutex::new(HashMap::new()),
            prompt_seq: AtomicU64::new(0),
        }
    }

    /// Last stored decision for `kind`. Never suspends.
    pub fn current_consent(&self, kind: CaptureKind) -> ConsentState {
        match self.current_record(kind) {
            Some(record) if record.decision == Decision::Granted => ConsentState::Granted,
            Some(_) => ConsentState::Denied,
            None => ConsentState::Undetermined,
        }
    }

    /// Asks the user for consent to `kind`, unless a cached decision applies.
    ///
    /// Concurrent requests for the same capability share one prompt: callers
    /// that queued behind it receive its outcome.
    ///
    /// # Errors
    ///
    /// Returns error if the prompter fails or the decision cannot be persisted.
    pub async fn request_consent(&self, kind: CaptureKind) -> Result<ConsentDecision, ConsentError> {
        if let Some(decision) = self.cached_decision(kind) {
            return Ok(decision.into());
        }

        let seen = self.last_prompt(kind).map(|(seq, _)| seq);
        let _prompt = self.prompt_lock.lock().await;

        if let Some((seq, outcome)) = self.last_prompt(kind) {
            if Some(seq) != seen {
                debug!("Coalesced {} consent request into completed prompt", kind);
                return Ok(outcome);
            }
        }
        if let Some(decision) = self.cached_decision(kind) {
            return Ok(decision.into());
        }

        let request = ConsentRequest {
            kind,
            consent_version: self.consent_version.clone(),
            previously_denied: matches!(
                self.current_record(kind),
                Some(ConsentRecord { decision: Decision::Denied, .. })
            ),
        };

        info!("Prompting for {} consent (agreement {})", kind, self.consent_version);
        let outcome = self.prompter.prompt(&request).await?;

        match outcome {
            ConsentDecision::Granted => {
                self.record(kind, Decision::Granted)?;
            }
            ConsentDecision::Denied => {
                self.record(kind, Decision::Denied)?;
            }
            ConsentDecision::Dismissed => {
                debug!("{} consent prompt dismissed", kind);
            }
        }

        let seq = self.prompt_seq.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.completed_prompts).insert(kind, (seq, outcome));

        Ok(outcome)
    }

    /// Records a decision made outside a prompt, e.g. a settings toggle.
    ///
    /// The new record supersedes the previous one.
    pub fn set_decision(&self, kind: CaptureKind, decision: Decision) -> Result<ConsentRecord, ConsentError> {
        self.record(kind, decision)
    }

    /// Mints a grant for `kind` if consent is currently granted.
    ///
    /// # Errors
    ///
    /// [`ConsentError::Denied`] or [`ConsentError::Undetermined`].
    pub fn authorize(&self, kind: CaptureKind) -> Result<ConsentGrant, ConsentError> {
        match self.current_record(kind) {
            Some(record) if record.decision == Decision::Granted => Ok(ConsentGrant::new(&record)),
            Some(_) => Err(ConsentError::Denied(kind)),
            None => Err(ConsentError::Undetermined(kind)),
        }
    }

    /// Id of the record currently in force for `kind`
    pub fn current_record_id(&self, kind: CaptureKind) -> Option<Uuid> {
        self.current_record(kind).map(|r| r.id)
    }

    /// Consent history for this session
    pub fn records(&self) -> Vec<ConsentRecord> {
        lock(&self.ledger).history(self.session_id)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn current_record(&self, kind: CaptureKind) -> Option<ConsentRecord> {
        lock(&self.ledger)
            .latest(self.session_id, kind)
            .filter(|r| r.consent_version == self.consent_version)
            .cloned()
    }

    fn cached_decision(&self, kind: CaptureKind) -> Option<Decision> {
        let record = self.current_record(kind)?;
        match (record.decision, self.policy) {
            (Decision::Granted, _) => Some(Decision::Granted),
            (Decision::Denied, RepromptPolicy::Never) => Some(Decision::Denied),
            (Decision::Denied, RepromptPolicy::OncePerAppVersion) => {
                (record.app_version == self.app_version).then_some(Decision::Denied)
            }
        }
    }

    fn last_prompt(&self, kind: CaptureKind) -> Option<(u64, ConsentDecision)> {
        lock(&self.completed_prompts).get(&kind).copied()
    }

    fn record(&self, kind: CaptureKind, decision: Decision) -> Result<ConsentRecord, ConsentError> {
        let record = ConsentRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            kind,
            decision,
            consent_version: self.consent_version.clone(),
            app_version: self.app_version.clone(),
            decided_at: Utc::now(),
        };

        lock(&self.ledger)
            .append(record.clone())
            .map_err(|e| ConsentError::Ledger(e.to_string()))?;

        info!("Recorded {:?} for {} (session {})", decision, kind, self.session_id);
        Ok(record)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::prompt::mocks::ScriptedPrompter;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn consent_config(policy: RepromptPolicy) -> ConsentConfig {
        ConsentConfig {
            consent_version: "2024-01".to_string(),
            app_version: "1.2.0".to_string(),
            reprompt_policy: policy,
        }
    }

    fn gate_with(
        dir: &TempDir,
        session: SessionId,
        config: &ConsentConfig,
        prompter: &ScriptedPrompter,
    ) -> ConsentGate {
        let ledger = ConsentLedger::open(dir.path().join("consent.jsonl")).unwrap();
        ConsentGate::new(session, config, ledger, Arc::new(prompter.clone()))
    }

    #[test]
    fn test_initially_undetermined() {
        let dir = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[]);
        let gate = gate_with(&dir, SessionId::new(), &consent_config(RepromptPolicy::Never), &prompter);

        assert_eq!(gate.current_consent(CaptureKind::Location), ConsentState::Undetermined);
        assert!(matches!(
            gate.authorize(CaptureKind::Location),
            Err(ConsentError::Undetermined(CaptureKind::Location))
        ));
    }

    #[tokio::test]
    async fn test_granted_prompt_is_recorded() {
        let dir = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[ConsentDecision::Granted]);
        let gate = gate_with(&dir, SessionId::new(), &consent_config(RepromptPolicy::Never), &prompter);

        let decision = gate.request_consent(CaptureKind::Location).await.unwrap();
        assert_eq!(decision, ConsentDecision::Granted);
        assert_eq!(gate.current_consent(CaptureKind::Location), ConsentState::Granted);
        assert_eq!(gate.current_consent(CaptureKind::CameraFrame), ConsentState::Undetermined);

        let grant = gate.authorize(CaptureKind::Location).unwrap();
        assert_eq!(grant.kind(), CaptureKind::Location);
        assert_eq!(grant.consent_version(), "2024-01");
        assert_eq!(gate.records().len(), 1);

        // Already granted, no second prompt
        gate.request_consent(CaptureKind::Location).await.unwrap();
        assert_eq!(prompter.prompt_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_is_cached_within_session() {
        let dir = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[ConsentDecision::Denied, ConsentDecision::Granted]);
        let gate = gate_with(&dir, SessionId::new(), &consent_config(RepromptPolicy::OncePerAppVersion), &prompter);

        assert_eq!(gate.request_consent(CaptureKind::CameraFrame).await.unwrap(), ConsentDecision::Denied);
        assert_eq!(gate.request_consent(CaptureKind::CameraFrame).await.unwrap(), ConsentDecision::Denied);
        assert_eq!(prompter.prompt_count(), 1);
        assert!(matches!(
            gate.authorize(CaptureKind::CameraFrame),
            Err(ConsentError::Denied(CaptureKind::CameraFrame))
        ));
    }

    #[tokio::test]
    async fn test_once_per_app_version_reprompts_after_upgrade() {
        let dir = tempdir().unwrap();
        let session = SessionId::new();
        let mut old = consent_config(RepromptPolicy::OncePerAppVersion);
        old.app_version = "1.1.0".to_string();

        let first = ScriptedPrompter::new(&[ConsentDecision::Denied]);
        {
            let gate = gate_with(&dir, session, &old, &first);
            gate.request_consent(CaptureKind::Location).await.unwrap();
        }

        let second = ScriptedPrompter::new(&[ConsentDecision::Granted]);
        let gate = gate_with(&dir, session, &consent_config(RepromptPolicy::OncePerAppVersion), &second);
        assert_eq!(gate.current_consent(CaptureKind::Location), ConsentState::Denied);

        let decision = gate.request_consent(CaptureKind::Location).await.unwrap();
        assert_eq!(decision, ConsentDecision::Granted);
        assert_eq!(second.prompt_count(), 1);
    }

    #[tokio::test]
    async fn test_never_policy_keeps_denial_across_upgrade() {
        let dir = tempdir().unwrap();
        let session = SessionId::new();
        let mut old = consent_config(RepromptPolicy::Never);
        old.app_version = "1.1.0".to_string();

        let first = ScriptedPrompter::new(&[ConsentDecision::Denied]);
        {
            let gate = gate_with(&dir, session, &old, &first);
            gate.request_consent(CaptureKind::Location).await.unwrap();
        }

        let second = ScriptedPrompter::new(&[ConsentDecision::Granted]);
        let gate = gate_with(&dir, session, &consent_config(RepromptPolicy::Never), &second);
        assert_eq!(gate.request_consent(CaptureKind::Location).await.unwrap(), ConsentDecision::Denied);
        assert_eq!(second.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_consent_version_change_resets_to_undetermined() {
        let dir = tempdir().unwrap();
        let session = SessionId::new();
        let prompter = ScriptedPrompter::new(&[ConsentDecision::Granted]);
        {
            let gate = gate_with(&dir, session, &consent_config(RepromptPolicy::Never), &prompter);
            gate.request_consent(CaptureKind::Location).await.unwrap();
        }

        let mut updated = consent_config(RepromptPolicy::Never);
        updated.consent_version = "2024-06".to_string();
        let gate = gate_with(&dir, session, &updated, &prompter);
        assert_eq!(gate.current_consent(CaptureKind::Location), ConsentState::Undetermined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_prompt() {
        let dir = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[ConsentDecision::Granted, ConsentDecision::Denied])
            .with_delay(Duration::from_millis(500));
        let gate = gate_with(&dir, SessionId::new(), &consent_config(RepromptPolicy::Never), &prompter);

        let (a, b, c) = tokio::join!(
            gate.request_consent(CaptureKind::Location),
            gate.request_consent(CaptureKind::Location),
            gate.request_consent(CaptureKind::Location),
        );

        assert_eq!(a.unwrap(), ConsentDecision::Granted);
        assert_eq!(b.unwrap(), ConsentDecision::Granted);
        assert_eq!(c.unwrap(), ConsentDecision::Granted);
        assert_eq!(prompter.prompt_count(), 1);
        assert_eq!(gate.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_dismissal_is_shared() {
        let dir = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[ConsentDecision::Dismissed, ConsentDecision::Granted])
            .with_delay(Duration::from_millis(200));
        let gate = gate_with(&dir, SessionId::new(), &consent_config(RepromptPolicy::Never), &prompter);

        let (a, b) = tokio::join!(
            gate.request_consent(CaptureKind::CameraFrame),
            gate.request_consent(CaptureKind::CameraFrame),
        );

        assert_eq!(a.unwrap(), ConsentDecision::Dismissed);
        assert_eq!(b.unwrap(), ConsentDecision::Dismissed);
        assert_eq!(prompter.prompt_count(), 1);
        assert_eq!(gate.current_consent(CaptureKind::CameraFrame), ConsentState::Undetermined);
        assert!(gate.records().is_empty());
    }

    #[tokio::test]
    async fn test_set_decision_revokes_grant() {
        let dir = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[ConsentDecision::Granted]);
        let gate = gate_with(&dir, SessionId::new(), &consent_config(RepromptPolicy::Never), &prompter);

        gate.request_consent(CaptureKind::Location).await.unwrap();
        let granted_id = gate.current_record_id(CaptureKind::Location);

        gate.set_decision(CaptureKind::Location, Decision::Denied).unwrap();
        assert_eq!(gate.current_consent(CaptureKind::Location), ConsentState::Denied);
        assert_ne!(gate.current_record_id(CaptureKind::Location), granted_id);
        assert_eq!(gate.records().len(), 2);
    }

    #[tokio::test]
    async fn test_prompt_failure_records_nothing() {
        let dir = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[]);
        let gate = gate_with(&dir, SessionId::new(), &consent_config(RepromptPolicy::Never), &prompter);

        let result = gate.request_consent(CaptureKind::Location).await;
        assert!(matches!(result, Err(ConsentError::PromptUnavailable(_))));
        assert_eq!(gate.current_consent(CaptureKind::Location), ConsentState::Undetermined);
    }
}
