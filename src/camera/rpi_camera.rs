use crate::core::capture_source::{CameraMetadata, CameraParams, CameraSource, Frame, StreamSink};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::task::{self, JoinHandle};

// Still images from the main stream are scaled down from the sensor's full
// resolution; the preview stream uses the low-resolution output.
const DEFAULT_STILL_SIZE: (u32, u32) = (2704, 2026);
const PREVIEW_SIZE: (u32, u32) = (1332, 990);
const DEFAULT_EXPOSURE_US: u32 = 10_000;

/// Raspberry Pi camera module driven through the `rpicam-apps` command-line tools.
pub struct RpiCamera {
    name: String,
    tool_prefix: String,
    width: u32,
    height: u32,
    exposure_us: u32,
    gain: f32,
    preview_fps: u32,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpiCamera {
    /// Looks for a usable camera, trying the current and the legacy tool names.
    /// Returns `None` when no camera is attached or the tools are missing.
    pub fn probe(preview_fps: u32) -> Option<Self> {
        for prefix in ["rpicam", "libcamera"] {
            let tool = format!("{}-still", prefix);
            debug!("🔎 Probing for Raspberry Pi camera with '{} --list-cameras'", tool);
            let output = match Command::new(&tool)
                .arg("--list-cameras")
                .stdin(Stdio::null())
                .output()
            {
                Ok(output) => output,
                Err(e) => {
                    debug!("  '{}' is not available: {}", tool, e);
                    continue;
                }
            };
            let listing = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if output.status.success() && has_camera(&listing) {
                info!("📷 Raspberry Pi camera found via '{}'.", tool);
                return Some(RpiCamera {
                    name: "libcamera raspberry pi cam".to_string(),
                    tool_prefix: prefix.to_string(),
                    width: DEFAULT_STILL_SIZE.0,
                    height: DEFAULT_STILL_SIZE.1,
                    exposure_us: DEFAULT_EXPOSURE_US,
                    gain: 1.0,
                    preview_fps,
                    stream_task: Mutex::new(None),
                });
            }
            debug!("  '{}' reported no cameras.", tool);
        }
        None
    }

    fn still_args(&self) -> Vec<String> {
        vec![
            "--nopreview".into(),
            "--immediate".into(),
            "--encoding".into(),
            "png".into(),
            "--width".into(),
            self.width.to_string(),
            "--height".into(),
            self.height.to_string(),
            "--shutter".into(),
            self.exposure_us.to_string(),
            "--gain".into(),
            self.gain.to_string(),
            "--output".into(),
            "-".into(),
        ]
    }
}

fn has_camera(listing: &str) -> bool {
    listing.contains("Available cameras") && !listing.contains("No cameras available")
}

#[async_trait]
impl CameraSource for RpiCamera {
    fn get_type(&self) -> String {
        "rpi-camera".to_string()
    }

    fn metadata(&self) -> CameraMetadata {
        CameraMetadata {
            name: self.name.clone(),
            pixel_format: "RGB8".to_string(),
            width: self.width,
            height: self.height,
        }
    }

    async fn snap(&self) -> Result<Frame> {
        let tool = format!("{}-still", self.tool_prefix);
        let args = self.still_args();
        let name = self.name.clone();

        task::spawn_blocking(move || -> Result<Frame> {
            let capture_start = Instant::now();
            let output = Command::new(&tool)
                .args(&args)
                .stdin(Stdio::null())
                .output()
                .with_context(|| format!("RPi [{}]: Failed to launch '{}'", name, tool))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                error!("RPi [{}]: '{}' failed: {}", name, tool, stderr.trim());
                bail!("RPi [{}]: '{}' exited with {}", name, tool, output.status);
            }
            let image = image::load_from_memory(&output.stdout)
                .with_context(|| format!("RPi [{}]: Failed to decode still image", name))?;
            debug!(
                "RPi [{}]: Captured {}x{} still in {:?}",
                name,
                image.width(),
                image.height(),
                capture_start.elapsed()
            );
            Ok(Frame::new(image))
        })
        .await
        .map_err(|e| anyhow!("RPi capture task failed: {}", e))?
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
        let tool = format!("{}-vid", self.tool_prefix);
        let mut child = tokio::process::Command::new(&tool)
            .args([
                "--nopreview",
                "--timeout",
                "0",
                "--codec",
                "mjpeg",
                "--width",
                &PREVIEW_SIZE.0.to_string(),
                "--height",
                &PREVIEW_SIZE.1.to_string(),
                "--framerate",
                &self.preview_fps.to_string(),
                "--output",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("RPi [{}]: Failed to launch '{}'", self.name, tool))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("RPi [{}]: '{}' has no stdout", self.name, tool))?;

        let name = self.name.clone();
        let worker = tokio::spawn(async move {
            // The child is owned here so aborting the task kills the encoder.
            let _child = child;
            let mut splitter = MjpegSplitter::default();
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => {
                        warn!("RPi [{}]: preview encoder closed its output.", name);
                        break;
                    }
                    Ok(n) => {
                        for jpeg in splitter.push(&chunk[..n]) {
                            sink.send_replace(Some(Arc::new(jpeg)));
                        }
                        if sink.is_closed() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("RPi [{}]: preview read failed: {}", name, e);
                        break;
                    }
                }
            }
        });

        let mut slot = self
            .stream_task
            .lock()
            .map_err(|_| anyhow!("stream state poisoned"))?;
        if let Some(previous) = slot.replace(worker) {
            previous.abort();
        }
        info!("▶️ RPi [{}]: Preview stream started.", self.name);
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        let task = self
            .stream_task
            .lock()
            .map_err(|_| anyhow!("stream state poisoned"))?
            .take();
        if let Some(task) = task {
            task.abort();
            info!("⏹️ RPi [{}]: Preview stream stopped.", self.name);
        }
        Ok(())
    }
}

/// Cuts a concatenated MJPEG byte stream into individual JPEG images.
#[derive(Default)]
pub(crate) struct MjpegSplitter {
    buf: Vec<u8>,
}

impl MjpegSplitter {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            let Some(start) = find_marker(&self.buf, 0, 0xD8) else {
                self.buf.clear();
                break;
            };
            let Some(end) = find_marker(&self.buf, start + 2, 0xD9) else {
                self.buf.drain(..start);
                break;
            };
            frames.push(self.buf[start..end + 2].to_vec());
            self.buf.drain(..end + 2);
        }
        frames
    }
}

fn find_marker(buf: &[u8], from: usize, marker: u8) -> Option<usize> {
    if buf.len() < 2 || from >= buf.len() - 1 {
        return None;
    }
    (from..buf.len() - 1).find(|&i| buf[i] == 0xFF && buf[i + 1] == marker)
}
