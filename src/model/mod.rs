//! # Data Model
//!
//! Identifiers, capture kinds and the [`CaptureEvent`] record that flows from
//! the capture adapter through the buffer to the ingestion endpoint.

pub mod event;

pub use event::{CameraFrame, CaptureEvent, DeliveryState, Facing, Location, Payload};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque event identifier, also used as the idempotency key on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Idempotency key as sent on the wire
    #[must_use]
    pub fn as_key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Groups events and consent records of one browsing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Capability a consent decision and a capture event refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    Location,
    CameraFrame,
}

impl CaptureKind {
    /// All capabilities in capture order
    pub const ALL: [CaptureKind; 2] = [CaptureKind::Location, CaptureKind::CameraFrame];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Location => "location",
            CaptureKind::CameraFrame => "camera_frame",
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
