//! # Device Capture Module
//!
//! Uniform access to the platform's location and camera APIs.
//!
//! This module handles:
//! - Single-attempt location fixes and camera frames (no internal retry)
//! - Mandatory per-call timeouts and cooperative cancellation
//! - Exclusive camera access: a second concurrent acquisition fails fast
//! - Releasing the camera stream on every exit path
//! - Mapping platform failures to [`CaptureError`]
//!
//! Every call requires a [`ConsentGrant`] for the matching capability.

pub mod camera;
pub mod platform;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CaptureConfig;
use crate::consent::ConsentGrant;
use crate::error::CaptureError;
use crate::model::{CameraFrame, CaptureKind, Facing, Location};
use camera::StreamGuard;
use platform::{CameraSource, FrameOptions, LocationSource, PositionOptions};

/// Wraps platform device APIs behind a typed capability interface.
pub struct DeviceCaptureAdapter {
    location: Arc<dyn LocationSource>,
    camera: Arc<dyn CameraSource>,
    /// One permit: only one camera stream may be live at a time
    camera_permit: Arc<Semaphore>,
    high_accuracy: bool,
    camera_timeout: Duration,
    jpeg_quality: f32,
}

impl std::fmt::Debug for DeviceCaptureAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCaptureAdapter")
            .field("high_accuracy", &self.high_accuracy)
            .field("camera_timeout", &self.camera_timeout)
            .finish_non_exhaustive()
    }
}

impl DeviceCaptureAdapter {
    pub fn new(
        location: Arc<dyn LocationSource>,
        camera: Arc<dyn CameraSource>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            location,
            camera,
            camera_permit: Arc::new(Semaphore::new(1)),
            high_accuracy: config.high_accuracy,
            camera_timeout: Duration::from_millis(config.camera_timeout_ms),
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Takes one position fix.
    ///
    /// # Arguments
    ///
    /// * `grant` - Location consent grant
    /// * `timeout` - Deadline for the whole attempt
    /// * `max_age` - Oldest cached fix the platform may return
    /// * `cancel` - Aborts the outstanding request when cancelled
    ///
    /// # Errors
    ///
    /// Any [`CaptureError`]; `Timeout` if the deadline passes, `Cancelled` if
    /// `cancel` fires first.
    pub async fn capture_location(
        &self,
        grant: &ConsentGrant,
        timeout: Duration,
        max_age: Duration,
        cancel: &CancellationToken,
    ) -> Result<Location, CaptureError> {
        check_grant(grant, CaptureKind::Location)?;

        if !self.location.is_supported() {
            return Err(CaptureError::Unsupported);
        }
        if !self.location.is_secure_context() {
            return Err(CaptureError::InsecureContext);
        }

        let options = PositionOptions {
            high_accuracy: self.high_accuracy,
            timeout,
            maximum_age: max_age,
        };

        let fix = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
            result = tokio::time::timeout(timeout, self.location.current_position(&options)) => {
                match result {
                    Ok(Ok(fix)) => fix,
                    Ok(Err(platform::PlatformError::Timeout)) | Err(_) => {
                        return Err(CaptureError::Timeout(millis(timeout)));
                    }
                    Ok(Err(e)) => return Err(e.into()),
                }
            }
        };

        debug!(
            "Location fix: lat={:.5} lng={:.5} accuracy={}m",
            fix.latitude, fix.longitude, fix.accuracy
        );

        Ok(Location {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_meters: fix.accuracy,
            altitude: fix.altitude,
            heading: fix.heading,
            speed_mps: fix.speed,
            captured_at: fix.timestamp,
        })
    }

    /// Acquires the camera, grabs one frame and releases the camera.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` immediately if another stream is live, otherwise
    /// any [`CaptureError`].
    pub async fn capture_camera_frame(
        &self,
        grant: &ConsentGrant,
        facing: Facing,
        cancel: &CancellationToken,
    ) -> Result<CameraFrame, CaptureError> {
        check_grant(grant, CaptureKind::CameraFrame)?;

        if !self.camera.is_supported() {
            return Err(CaptureError::Unsupported);
        }
        if !self.camera.is_secure_context() {
            return Err(CaptureError::InsecureContext);
        }

        let _permit = Arc::clone(&self.camera_permit)
            .try_acquire_owned()
            .map_err(|_| CaptureError::DeviceUnavailable("camera stream already active".to_string()))?;

        let options = FrameOptions {
            jpeg_quality: self.jpeg_quality,
        };

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
            result = tokio::time::timeout(self.camera_timeout, self.grab_one(facing, &options)) => {
                match result {
                    Ok(frame) => frame?,
                    Err(_) => {
                        warn!("{} camera capture timed out", facing);
                        return Err(CaptureError::Timeout(millis(self.camera_timeout)));
                    }
                }
            }
        };

        if raw.bytes.is_empty() || raw.width == 0 || raw.height == 0 {
            return Err(CaptureError::Platform("camera returned an empty frame".to_string()));
        }

        Ok(CameraFrame {
            facing,
            image_bytes: raw.bytes,
            width: raw.width,
            height: raw.height,
            captured_at: chrono::Utc::now(),
        })
    }

    /// Number of video input devices the platform reports
    pub async fn video_input_count(&self) -> Result<usize, CaptureError> {
        if !self.camera.is_supported() {
            return Err(CaptureError::Unsupported);
        }
        let inputs = self.camera.enumerate_video_inputs().await?;
        debug!("Found {} video input(s)", inputs.len());
        Ok(inputs.len())
    }

    async fn grab_one(&self, facing: Facing, options: &FrameOptions) -> Result<platform::RawFrame, CaptureError> {
        let stream = self.camera.open_stream(facing).await?;
        let mut guard = StreamGuard::new(stream, facing);
        let frame = guard.grab_frame(options).await?;
        guard.release();
        Ok(frame)
    }
}

fn check_grant(grant: &ConsentGrant, kind: CaptureKind) -> Result<(), CaptureError> {
    if grant.kind() == kind {
        Ok(())
    } else {
        Err(CaptureError::PermissionDenied)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use platform::mocks::{MockCamera, MockLocation};
    use platform::PlatformError;

    fn adapter(location: MockLocation, camera: MockCamera) -> DeviceCaptureAdapter {
        DeviceCaptureAdapter::new(Arc::new(location), Arc::new(camera), &Config::default().capture)
    }

    fn location_grant() -> ConsentGrant {
        ConsentGrant::for_tests(CaptureKind::Location)
    }

    fn camera_grant() -> ConsentGrant {
        ConsentGrant::for_tests(CaptureKind::CameraFrame)
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_capture_location_success() {
        let adapter = adapter(MockLocation::new(), MockCamera::new(1));
        let token = CancellationToken::new();

        let location = adapter
            .capture_location(&location_grant(), SECOND, Duration::ZERO, &token)
            .await
            .unwrap();

        assert_eq!(location.latitude, 52.520_008);
        assert_eq!(location.accuracy_meters, 8.0);
        assert_eq!(location.speed_mps, Some(1.4));
    }

    #[tokio::test]
    async fn test_wrong_grant_is_permission_denied() {
        let location = MockLocation::new();
        let adapter = adapter(location.clone(), MockCamera::new(1));
        let token = CancellationToken::new();

        let result = adapter
            .capture_location(&camera_grant(), SECOND, Duration::ZERO, &token)
            .await;
        assert_eq!(result, Err(CaptureError::PermissionDenied));
        assert_eq!(location.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_and_insecure() {
        let mut location = MockLocation::new();
        location.supported = false;
        let token = CancellationToken::new();
        let result = adapter(location, MockCamera::new(1))
            .capture_location(&location_grant(), SECOND, Duration::ZERO, &token)
            .await;
        assert_eq!(result, Err(CaptureError::Unsupported));

        let mut location = MockLocation::new();
        location.secure = false;
        let result = adapter(location, MockCamera::new(1))
            .capture_location(&location_grant(), SECOND, Duration::ZERO, &token)
            .await;
        assert_eq!(result, Err(CaptureError::InsecureContext));
    }

    #[tokio::test]
    async fn test_platform_permission_denied_maps() {
        let adapter = adapter(MockLocation::failing(PlatformError::PermissionDenied), MockCamera::new(1));
        let token = CancellationToken::new();
        let result = adapter
            .capture_location(&location_grant(), SECOND, Duration::ZERO, &token)
            .await;
        assert_eq!(result, Err(CaptureError::PermissionDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_timeout_is_enforced() {
        let slow = MockLocation::new().with_delay(Duration::from_secs(60));
        let adapter = adapter(slow, MockCamera::new(1));
        let token = CancellationToken::new();

        let result = adapter
            .capture_location(&location_grant(), Duration::from_millis(1500), Duration::ZERO, &token)
            .await;
        assert_eq!(result, Err(CaptureError::Timeout(1500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_location_request() {
        let slow = MockLocation::new().with_delay(Duration::from_secs(10));
        let adapter = adapter(slow, MockCamera::new(1));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = adapter
            .capture_location(&location_grant(), Duration::from_secs(30), Duration::ZERO, &token)
            .await;
        assert_eq!(result, Err(CaptureError::Cancelled));
    }

    #[tokio::test]
    async fn test_camera_frame_releases_stream() {
        let camera = MockCamera::new(2);
        let adapter = adapter(MockLocation::new(), camera.clone());
        let token = CancellationToken::new();

        let frame = adapter
            .capture_camera_frame(&camera_grant(), Facing::Back, &token)
            .await
            .unwrap();

        assert_eq!(frame.facing, Facing::Back);
        assert_eq!(frame.image_bytes, vec![0xB0; 16]);
        assert_eq!(camera.opened(), 1);
        assert_eq!(camera.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_released_on_timeout() {
        let camera = MockCamera::new(1).with_grab_delay(Duration::from_secs(120));
        let adapter = adapter(MockLocation::new(), camera.clone());
        let token = CancellationToken::new();

        let result = adapter
            .capture_camera_frame(&camera_grant(), Facing::Front, &token)
            .await;

        assert!(matches!(result, Err(CaptureError::Timeout(_))));
        assert_eq!(camera.opened(), 1);
        assert_eq!(camera.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_camera_request_fails_fast() {
        let camera = MockCamera::new(1).with_grab_delay(Duration::from_millis(500));
        let adapter = adapter(MockLocation::new(), camera.clone());
        let token = CancellationToken::new();
        let grant = camera_grant();

        let (first, second) = tokio::join!(
            adapter.capture_camera_frame(&grant, Facing::Front, &token),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                adapter.capture_camera_frame(&grant, Facing::Front, &token).await
            },
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(camera.opened(), 1);
        assert_eq!(camera.max_active(), 1);
    }

    #[tokio::test]
    async fn test_camera_permission_denied_releases_permit() {
        let camera = MockCamera::new(1);
        camera.deny.store(true, std::sync::atomic::Ordering::SeqCst);
        let adapter = adapter(MockLocation::new(), camera.clone());
        let token = CancellationToken::new();

        let result = adapter.capture_camera_frame(&camera_grant(), Facing::Front, &token).await;
        assert_eq!(result, Err(CaptureError::PermissionDenied));

        camera.deny.store(false, std::sync::atomic::Ordering::SeqCst);
        let result = adapter.capture_camera_frame(&camera_grant(), Facing::Front, &token).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_video_input_count() {
        let adapter = adapter(MockLocation::new(), MockCamera::new(3));
        assert_eq!(adapter.video_input_count().await.unwrap(), 3);
    }
}
