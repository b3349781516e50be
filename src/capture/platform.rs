//! Trait abstraction for platform device APIs to enable testing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::error::CaptureError;
use crate::model::Facing;

/// Failures reported by a platform device API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("API not supported")]
    NotSupported,
    #[error("permission denied")]
    PermissionDenied,
    #[error("platform timeout")]
    Timeout,
    #[error("device busy: {0}")]
    Busy(String),
    #[error("insecure context")]
    InsecureContext,
    #[error("{0}")]
    Other(String),
}

impl From<PlatformError> for CaptureError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NotSupported => CaptureError::Unsupported,
            PlatformError::PermissionDenied => CaptureError::PermissionDenied,
            PlatformError::Timeout => CaptureError::Timeout(0),
            PlatformError::Busy(msg) => CaptureError::DeviceUnavailable(msg),
            PlatformError::InsecureContext => CaptureError::InsecureContext,
            PlatformError::Other(msg) => CaptureError::Platform(msg),
        }
    }
}

/// Single-shot position query options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix the platform may return; zero forces a fresh one
    pub maximum_age: Duration,
}

/// Raw position fix from the platform
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Geolocation-style position source
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Whether the API exists on this platform
    fn is_supported(&self) -> bool;

    /// Whether the host is served over a secure transport
    fn is_secure_context(&self) -> bool {
        true
    }

    async fn current_position(&self, options: &PositionOptions) -> Result<Position, PlatformError>;
}

/// An enumerated video input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInput {
    pub device_id: String,
    pub label: String,
}

/// Frame encoding options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameOptions {
    /// JPEG quality in 0.0..=1.0
    pub jpeg_quality: f32,
}

/// Encoded frame as produced by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Media-capture-style camera access
#[async_trait]
pub trait CameraSource: Send + Sync {
    fn is_supported(&self) -> bool;

    fn is_secure_context(&self) -> bool {
        true
    }

    async fn enumerate_video_inputs(&self) -> Result<Vec<VideoInput>, PlatformError>;

    /// Acquires a live stream from the camera facing `facing`
    async fn open_stream(&self, facing: Facing) -> Result<Box<dyn CameraStream>, PlatformError>;
}

/// A live camera stream. Must be released when no longer needed.
#[async_trait]
pub trait CameraStream: Send {
    async fn grab_frame(&mut self, options: &FrameOptions) -> Result<RawFrame, PlatformError>;

    /// Stops every track of the stream
    fn release(&mut self);
}
