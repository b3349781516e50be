//! Simulated device platform for headless hosts and demos.
//!
//! Reports a fixed position with small random drift and produces synthetic
//! RGB gradient frames.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;

use super::platform::{
    CameraSource, CameraStream, FrameOptions, LocationSource, PlatformError, Position, PositionOptions,
    RawFrame, VideoInput,
};
use crate::model::Facing;

/// Position source centred on a configured coordinate
#[derive(Debug, Clone)]
pub struct SimulatedLocation {
    latitude: f64,
    longitude: f64,
    latency: Duration,
}

impl SimulatedLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            latency: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl LocationSource for SimulatedLocation {
    fn is_supported(&self) -> bool {
        true
    }

    async fn current_position(&self, options: &PositionOptions) -> Result<Position, PlatformError> {
        tokio::time::sleep(self.latency).await;

        let mut rng = rand::thread_rng();
        let accuracy = if options.high_accuracy { 5.0 } else { 50.0 };
        Ok(Position {
            latitude: self.latitude + rng.gen_range(-0.0005..0.0005),
            longitude: self.longitude + rng.gen_range(-0.0005..0.0005),
            accuracy,
            altitude: None,
            heading: None,
            speed: Some(0.0),
            timestamp: Utc::now(),
        })
    }
}

/// Camera source with a configurable number of inputs
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    inputs: usize,
    width: u32,
    height: u32,
}

impl SimulatedCamera {
    pub fn new(inputs: usize) -> Self {
        Self {
            inputs,
            width: 32,
            height: 24,
        }
    }
}

#[async_trait]
impl CameraSource for SimulatedCamera {
    fn is_supported(&self) -> bool {
        self.inputs > 0
    }

    async fn enumerate_video_inputs(&self) -> Result<Vec<VideoInput>, PlatformError> {
        Ok((0..self.inputs)
            .map(|i| VideoInput {
                device_id: format!("simulated-{}", i),
                label: format!("Simulated camera {}", i),
            })
            .collect())
    }

    async fn open_stream(&self, facing: Facing) -> Result<Box<dyn CameraStream>, PlatformError> {
        if facing == Facing::Back && self.inputs < 2 {
            return Err(PlatformError::Busy("no back camera".to_string()));
        }
        Ok(Box::new(SimulatedStream {
            width: self.width,
            height: self.height,
            live: true,
        }))
    }
}

struct SimulatedStream {
    width: u32,
    height: u32,
    live: bool,
}

#[async_trait]
impl CameraStream for SimulatedStream {
    async fn grab_frame(&mut self, _options: &FrameOptions) -> Result<RawFrame, PlatformError> {
        if !self.live {
            return Err(PlatformError::Other("stream stopped".to_string()));
        }
        let mut bytes = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                bytes.push((x * 255 / self.width) as u8);
                bytes.push((y * 255 / self.height) as u8);
                bytes.push(128);
            }
        }
        Ok(RawFrame {
            bytes,
            width: self.width,
            height: self.height,
        })
    }

    fn release(&mut self) {
        self.live = false;
    }
}
