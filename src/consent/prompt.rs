//! Trait abstraction for the host's consent prompt.

use async_trait::async_trait;

use super::ConsentDecision;
use crate::error::ConsentError;
use crate::model::CaptureKind;

/// What the host is asked to explain to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRequest {
    pub kind: CaptureKind,
    pub consent_version: String,
    /// The user denied this capability before under an older app version
    pub previously_denied: bool,
}

/// Host-side consent UI.
///
/// Implementations suspend until the user answers. Returning
/// [`ConsentDecision::Dismissed`] leaves the capability undetermined.
#[async_trait]
pub trait ConsentPrompter: Send + Sync {
    async fn prompt(&self, request: &ConsentRequest) -> Result<ConsentDecision, ConsentError>;
}
