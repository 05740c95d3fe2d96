use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

// --- Data structures for frame information ---

/// One still image as returned by a camera.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: DynamicImage) -> Self {
        Frame {
            image,
            captured_at: Utc::now(),
        }
    }
}

/// Identity of the device that produced a frame; stored in every session's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraMetadata {
    pub name: String,
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
}

/// Requested device reconfiguration. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraParams {
    pub name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub exposure_us: Option<u32>,
    pub gain: Option<f32>,
}

impl CameraParams {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.exposure_us.is_none()
            && self.gain.is_none()
    }
}

/// Encoded JPEG preview frames are published here while a stream runs.
pub type StreamSink = Arc<watch::Sender<Option<Arc<Vec<u8>>>>>;

// --- The CameraSource Trait ---

#[async_trait]
pub trait CameraSource: Send + Sync {
    fn get_type(&self) -> String; // e.g., "rpi-camera", "simulated-camera"

    fn metadata(&self) -> CameraMetadata;

    /// Captures a single still image.
    async fn snap(&self) -> Result<Frame>;

    /// Applies the requested parameters and returns a human-readable change log,
    /// one `field: old > new` line per changed value.
    async fn set_params(&mut self, params: &CameraParams) -> Result<String>;

    /// Starts pushing preview frames into `sink` until `stop_stream` is called.
    async fn start_stream(&self, sink: StreamSink) -> Result<()>;

    async fn stop_stream(&self) -> Result<()>;
}
