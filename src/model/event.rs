//! Capture event record and its payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CaptureKind, EventId, SessionId};
use crate::consent::ConsentGrant;
use crate::error::ConsentError;

/// Camera facing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    Front,
    Back,
}

impl std::fmt::Display for Facing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Facing::Front => f.write_str("front"),
            Facing::Back => f.write_str("back"),
        }
    }
}

/// A single position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

/// A single encoded camera frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub facing: Facing,
    #[serde(with = "base64_bytes")]
    pub image_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// Kind-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Location(Location),
    CameraFrame(CameraFrame),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> CaptureKind {
        match self {
            Payload::Location(_) => CaptureKind::Location,
            Payload::CameraFrame(_) => CaptureKind::CameraFrame,
        }
    }
}

/// Delivery progress of a buffered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    Failed { reason: String },
}

impl DeliveryState {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, DeliveryState::Pending)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, DeliveryState::Failed { .. })
    }
}

/// One consented observation.
///
/// The only constructor takes a [`ConsentGrant`], which only the consent
/// gate can mint, so an event cannot exist for a capability whose consent was
/// not granted at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    id: EventId,
    session_id: SessionId,
    consent_version: String,
    created_at: DateTime<Utc>,
    payload: Payload,
    delivery_state: DeliveryState,
}

impl CaptureEvent {
    /// Builds a pending event from a fresh capture.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Undetermined`] if the grant covers a different
    /// capability than the payload.
    pub fn new(grant: &ConsentGrant, payload: Payload) -> Result<Self, ConsentError> {
        if grant.kind() != payload.kind() {
            return Err(ConsentError::Undetermined(payload.kind()));
        }

        Ok(Self {
            id: EventId::new(),
            session_id: grant.session_id(),
            consent_version: grant.consent_version().to_string(),
            created_at: Utc::now(),
            payload,
            delivery_state: DeliveryState::Pending,
        })
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn kind(&self) -> CaptureKind {
        self.payload.kind()
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn consent_version(&self) -> &str {
        &self.consent_version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn delivery_state(&self) -> &DeliveryState {
        &self.delivery_state
    }

    pub(crate) fn set_delivery_state(&mut self, state: DeliveryState) {
        self.delivery_state = state;
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location_payload() -> Payload {
        Payload::Location(Location {
            latitude: 28.613_939_123_456_78,
            longitude: 77.209_021_987_654_32,
            accuracy_meters: 12.5,
            altitude: Some(216.1),
            heading: None,
            speed_mps: Some(0.1 + 0.2),
            captured_at: Utc::now(),
        })
    }

    #[test]
    fn test_new_event_is_pending() {
        let grant = ConsentGrant::for_tests(CaptureKind::Location);
        let event = CaptureEvent::new(&grant, location_payload()).unwrap();

        assert_eq!(event.kind(), CaptureKind::Location);
        assert_eq!(event.delivery_state(), &DeliveryState::Pending);
        assert_eq!(event.consent_version(), grant.consent_version());
        assert_eq!(event.session_id(), grant.session_id());
    }

    #[test]
    fn test_grant_for_other_kind_rejected() {
        let grant = ConsentGrant::for_tests(CaptureKind::CameraFrame);
        let result = CaptureEvent::new(&grant, location_payload());
        assert!(matches!(result, Err(ConsentError::Undetermined(CaptureKind::Location))));
    }

    #[test]
    fn test_serde_preserves_floats_and_bytes() {
        let grant = ConsentGrant::for_tests(CaptureKind::CameraFrame);
        let frame = Payload::CameraFrame(CameraFrame {
            facing: Facing::Back,
            image_bytes: (0..=255).collect(),
            width: 640,
            height: 480,
            captured_at: Utc::now(),
        });
        let mut event = CaptureEvent::new(&grant, frame).unwrap();
        event.set_delivery_state(DeliveryState::Failed { reason: "HTTP 400".into() });

        let json = serde_json::to_string(&event).unwrap();
        let restored: CaptureEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, event);

        let grant = ConsentGrant::for_tests(CaptureKind::Location);
        let event = CaptureEvent::new(&grant, location_payload()).unwrap();
        let restored: CaptureEvent =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        match (restored.payload(), event.payload()) {
            (Payload::Location(a), Payload::Location(b)) => {
                assert_eq!(a.latitude.to_bits(), b.latitude.to_bits());
                assert_eq!(a.longitude.to_bits(), b.longitude.to_bits());
                assert_eq!(a.speed_mps.map(f64::to_bits), b.speed_mps.map(f64::to_bits));
            }
            _ => panic!("payload kind changed"),
        }
    }

    #[test]
    fn test_image_bytes_encoded_as_base64() {
        let grant = ConsentGrant::for_tests(CaptureKind::CameraFrame);
        let frame = Payload::CameraFrame(CameraFrame {
            facing: Facing::Front,
            image_bytes: vec![0xff, 0xd8, 0xff],
            width: 1,
            height: 1,
            captured_at: Utc::now(),
        });
        let event = CaptureEvent::new(&grant, frame).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["image_bytes"], "/9j/");
        assert_eq!(json["payload"]["kind"], "camera_frame");
    }
}
