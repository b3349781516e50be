//! Scoped camera stream acquisition.

use tracing::debug;

use super::platform::{CameraStream, FrameOptions, PlatformError, RawFrame};
use crate::model::Facing;

/// Owns a live camera stream and releases it when dropped.
///
/// Dropping covers every exit path: a successful grab, an error, a timeout,
/// and cancellation of the enclosing future.
pub struct StreamGuard {
    stream: Option<Box<dyn CameraStream>>,
    facing: Facing,
}

impl StreamGuard {
    pub fn new(stream: Box<dyn CameraStream>, facing: Facing) -> Self {
        debug!("Acquired {} camera stream", facing);
        Self {
            stream: Some(stream),
            facing,
        }
    }

    pub async fn grab_frame(&mut self, options: &FrameOptions) -> Result<RawFrame, PlatformError> {
        match self.stream.as_mut() {
            Some(stream) => stream.grab_frame(options).await,
            None => Err(PlatformError::Other("stream already released".to_string())),
        }
    }

    /// Releases the stream now instead of at drop
    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.release();
            debug!("Released {} camera stream", self.facing);
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.release();
    }
}
