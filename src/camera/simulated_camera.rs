use crate::core::capture_source::{CameraMetadata, CameraParams, CameraSource, Frame, StreamSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use log::{debug, info};
use rand::Rng;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const DEFAULT_SIZE: u32 = 64;
const DEFAULT_EXPOSURE_US: u32 = 10_000;
const NOISE_AMPLITUDE: f32 = 8.0;

/// Stand-in device used when no real camera is attached. Produces a noisy
/// radial pattern whose brightness follows exposure and gain.
pub struct SimulatedCamera {
    name: String,
    width: u32,
    height: u32,
    exposure_us: u32,
    gain: f32,
    preview_interval: Duration,
    snaps_taken: AtomicU64,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedCamera {
    pub fn new(preview_fps: u32) -> Self {
        SimulatedCamera {
            name: "parappa cam".to_string(),
            width: DEFAULT_SIZE,
            height: DEFAULT_SIZE,
            exposure_us: DEFAULT_EXPOSURE_US,
            gain: 1.0,
            preview_interval: Duration::from_millis(1000 / u64::from(preview_fps.max(1))),
            snaps_taken: AtomicU64::new(0),
            stream_task: Mutex::new(None),
        }
    }

    pub fn snaps_taken(&self) -> u64 {
        self.snaps_taken.load(Ordering::Relaxed)
    }

    fn render(width: u32, height: u32, brightness: f32) -> GrayImage {
        let mut rng = rand::thread_rng();
        let cx = width as f32 / 2.0;
        let cy = height as f32 / 2.0;
        let max_dist = (cx * cx + cy * cy).sqrt().max(1.0);
        GrayImage::from_fn(width, height, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let base = 1.0 - (dx * dx + dy * dy).sqrt() / max_dist;
            let level = (base * 180.0 + 20.0) * brightness + rng.gen_range(-NOISE_AMPLITUDE..NOISE_AMPLITUDE);
            Luma([level.clamp(0.0, 255.0) as u8])
        })
    }

    fn brightness(&self) -> f32 {
        (self.exposure_us as f32 / DEFAULT_EXPOSURE_US as f32) * self.gain
    }
}

pub(crate) fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Jpeg)
        .context("Failed to encode preview frame as JPEG")?;
    Ok(buffer.into_inner())
}

#[async_trait]
impl CameraSource for SimulatedCamera {
    fn get_type(&self) -> String {
        "simulated-camera".to_string()
    }

    fn metadata(&self) -> CameraMetadata {
        CameraMetadata {
            name: self.name.clone(),
            pixel_format: "L8".to_string(),
            width: self.width,
            height: self.height,
        }
    }

    async fn snap(&self) -> Result<Frame> {
        let image = Self::render(self.width, self.height, self.brightness());
        let taken = self.snaps_taken.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Sim [{}]: Rendered snap #{} ({}x{}).", self.name, taken, self.width, self.height);
        Ok(Frame::new(DynamicImage::ImageLuma8(image)))
    }

    async fn set_params(&mut self, params: &CameraParams) -> Result<String> {
        let mut changes = Vec::new();
        if let Some(name) = &params.name {
            changes.push(format!("name: {} > {}", self.name, name));
            self.name = name.clone();
        }
        if let Some(width) = params.width {
            changes.push(format!("width: {} > {}", self.width, width));
            self.width = width;
        }
        if let Some(height) = params.height {
            changes.push(format!("height: {} > {}", self.height, height));
            self.height = height;
        }
        if let Some(exposure) = params.exposure_us {
            changes.push(format!("exposure: {} > {}", self.exposure_us, exposure));
            self.exposure_us = exposure;
        }
        if let Some(gain) = params.gain {
            changes.push(format!("gain: {} > {}", self.gain, gain));
            self.gain = gain;
        }
        Ok(changes.join("\n"))
    }

    async fn start_stream(&self, sink: StreamSink) -> Result<()> {
        let mut slot = self
            .stream_task
            .lock()
            .map_err(|_| anyhow::anyhow!("stream state poisoned"))?;
        if let Some(task) = slot.take() {
            task.abort();
        }

        let (width, height, brightness) = (self.width, self.height, self.brightness());
        let interval = self.preview_interval;
        info!("▶️ Sim [{}]: Starting preview stream every {:?}.", self.name, interval);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if sink.is_closed() {
                    debug!("Sim: preview sink closed, stopping stream.");
                    break;
                }
                let frame = DynamicImage::ImageLuma8(Self::render(width, height, brightness));
                match encode_jpeg(&frame) {
                    Ok(jpeg) => {
                        sink.send_replace(Some(Arc::new(jpeg)));
                    }
                    Err(e) => debug!("Sim: dropping preview frame: {:#}", e),
                }
            }
        }));
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        let task = self
            .stream_task
            .lock()
            .map_err(|_| anyhow::anyhow!("stream state poisoned"))?
            .take();
        if let Some(task) = task {
            task.abort();
            info!("⏹️ Sim [{}]: Preview stream stopped.", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;

    #[tokio::test]
    async fn snap_matches_metadata_shape() {
        let camera = SimulatedCamera::new(10);
        let frame = camera.snap().await.unwrap();
        let meta = camera.metadata();
        assert_eq!(frame.image.width(), meta.width);
        assert_eq!(frame.image.height(), meta.height);
        assert_eq!(camera.snaps_taken(), 1);
    }

    #[tokio::test]
    async fn set_params_reports_changes() {
        let mut camera = SimulatedCamera::new(10);
        let log = camera
            .set_params(&CameraParams {
                name: Some("bench".into()),
                exposure_us: Some(20_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(log, "name: parappa cam > bench\nexposure: 10000 > 20000");
        assert_eq!(camera.metadata().name, "bench");
    }

    #[tokio::test]
    async fn stream_publishes_jpeg_frames() {
        let camera = SimulatedCamera::new(50);
        let (tx, mut rx) = watch::channel(None);
        camera.start_stream(Arc::new(tx)).await.unwrap();
        rx.changed().await.unwrap();
        let frame = rx.borrow().clone().unwrap();
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        camera.stop_stream().await.unwrap();
    }
}
