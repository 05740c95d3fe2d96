use crate::errors::AppError;
use crate::timelapse::frame_store::{FRAMES_DIR, FRAME_EXTENSION};
use async_trait::async_trait;
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tokio::task;

/// Assembles a session's numbered frames into one video file.
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn encode(&self, session_dir: &Path, output: &Path, fps: u32) -> Result<(), AppError>;
}

pub struct FfmpegEncoder {
    binary: String,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    pub fn with_binary(binary: &str) -> Self {
        FfmpegEncoder {
            binary: binary.to_string(),
        }
    }

    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn args(session_dir: &Path, output: &Path, fps: u32) -> Vec<String> {
        let pattern = session_dir
            .join(FRAMES_DIR)
            .join(format!("%06d.{}", FRAME_EXTENSION));
        vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-framerate".into(),
            fps.to_string(),
            "-i".into(),
            pattern.to_string_lossy().into_owned(),
            // libx264 with yuv420p needs even dimensions.
            "-vf".into(),
            "pad=ceil(iw/2)*2:ceil(ih/2)*2".into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            output.to_string_lossy().into_owned(),
        ]
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    async fn encode(&self, session_dir: &Path, output: &Path, fps: u32) -> Result<(), AppError> {
        let binary = self.binary.clone();
        let args = Self::args(session_dir, output, fps);
        let output: PathBuf = output.to_path_buf();

        task::spawn_blocking(move || -> Result<(), AppError> {
            let start = Instant::now();
            debug!("🎬 Running {} {}", binary, args.join(" "));
            let result = Command::new(&binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .map_err(|e| AppError::EncodeFailure(format!("failed to launch '{}': {}", binary, e)))?;

            if !result.status.success() {
                let stderr = String::from_utf8_lossy(&result.stderr);
                error!("[ENCODE] {} failed: {}", binary, stderr.trim());
                if output.exists() {
                    let _ = std::fs::remove_file(&output);
                }
                return Err(AppError::EncodeFailure(format!(
                    "{} exited with {}: {}",
                    binary,
                    result.status,
                    stderr.trim()
                )));
            }
            info!("🎞️ Encoded '{}' in {:?}", output.display(), start.elapsed());
            Ok(())
        })
        .await
        .map_err(|e| AppError::EncodeFailure(format!("encoder task failed: {}", e)))?
    }
}
