//! # Error Types
//!
//! Error taxonomy for the capture pipeline using `thiserror`.
//!
//! Each concern has its own enum so callers can match on exactly the failures
//! a component can produce. [`PipelineError`] wraps them at the public
//! boundary of [`crate::pipeline::PipelineContext`].

use thiserror::Error;

use crate::model::{CaptureKind, EventId};
use crate::storage::StorageError;

/// Consent failures. These halt the pipeline for a capability and are never
/// turned into a forced retry.
#[derive(Debug, Error)]
pub enum ConsentError {
    /// The user denied the capability
    #[error("consent denied for {0}")]
    Denied(CaptureKind),

    /// No current decision exists for the capability
    #[error("consent undetermined for {0}")]
    Undetermined(CaptureKind),

    /// The host could not show a prompt
    #[error("consent prompt unavailable: {0}")]
    PromptUnavailable(String),

    /// The consent ledger could not be read or written
    #[error("consent ledger error: {0}")]
    Ledger(String),
}

/// Device capture failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The platform does not expose the API at all
    #[error("capture API unsupported")]
    Unsupported,

    /// The OS or user refused the device permission
    #[error("device permission denied")]
    PermissionDenied,

    /// The attempt exceeded its deadline
    #[error("capture timed out after {0} ms")]
    Timeout(u64),

    /// The device is busy or missing
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The capability requires a secure transport
    #[error("capture requires a secure context")]
    InsecureContext,

    /// The pipeline was stopped while the capture was outstanding
    #[error("capture cancelled")]
    Cancelled,

    /// Any other platform failure
    #[error("platform error: {0}")]
    Platform(String),
}

impl CaptureError {
    /// Terminal errors stop a capability until its consent state changes.
    /// Everything else may be retried by the next scheduled tick.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureError::Unsupported | CaptureError::PermissionDenied | CaptureError::InsecureContext
        )
    }
}

/// Local event buffer failures.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Capacity reached and nothing evictable
    #[error("event buffer full ({capacity} entries, none evictable)")]
    Full { capacity: usize },

    /// An event with the same id is already buffered
    #[error("event {0} already buffered")]
    Duplicate(EventId),

    /// No buffered event with this id
    #[error("event {0} not found in buffer")]
    NotFound(EventId),

    /// The journal contains an unreadable record before its tail
    #[error("corrupt journal at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for BufferError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Corrupt { line, reason, .. } => BufferError::Corrupt { line, reason },
            StorageError::Serde(e) => BufferError::Serde(e),
            StorageError::Io(e) => BufferError::Io(e),
        }
    }
}

/// Transport-level failures reported by an [`crate::delivery::IngestTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request did not complete in time
    #[error("ingestion request timed out")]
    Timeout,

    /// Connection or protocol failure before a status was received
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint rejected the whole batch with a status code
    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    /// The response body could not be parsed
    #[error("invalid ingestion response: {0}")]
    InvalidResponse(String),
}

/// Delivery worker failures.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Another drain cycle holds the drain lock
    #[error("a drain cycle is already in progress")]
    DrainInProgress,

    /// Buffer state transitions failed
    #[error("buffer error during delivery: {0}")]
    Buffer(#[from] BufferError),
}

/// Scheduler failures.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// `start` called while the timer is armed
    #[error("schedule already running")]
    AlreadyRunning,

    /// The interval must be positive
    #[error("schedule interval must be greater than zero")]
    ZeroInterval,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML parsing errors
    #[error("Configuration error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its valid range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Consent(#[from] ConsentError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Session state could not be loaded or stored
    #[error("session store error: {0}")]
    Session(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the pipeline
pub type Result<T> = std::result::Result<T, PipelineError>;
