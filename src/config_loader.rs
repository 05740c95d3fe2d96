use serde::Deserialize;
use std::fs;
use std::path::Path;
use crate::app_config::{ApplicationConfig, NotifyConfig, TimelapseConfig, UploadBackend, UploadConfig};
use crate::camera_config::CameraConfig;
use anyhow::{Result, Context, bail};
use log::{debug, info};
use std::time::Instant;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MasterConfig {
    #[serde(rename = "application")]
    pub app_settings: ApplicationConfig,
    pub camera: CameraConfig,
    pub timelapse: TimelapseConfig,
    pub upload: UploadConfig,
    pub notify: NotifyConfig,
}

pub fn load_config(path: &str) -> Result<MasterConfig> {
    debug!("📄 Attempting to load config from: {}", path);
    let start_time = Instant::now();

    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file '{}'. 📖", path))?;
    debug!("Read config file in {:?}", start_time.elapsed());

    let config = parse_config(&config_str)
        .with_context(|| format!("Failed to load configuration from '{}'", path))?;

    info!("✅ Successfully loaded and validated configuration from '{}' in {:?}", path, start_time.elapsed());
    Ok(config)
}

/// Parses and validates a YAML document. Empty documents yield the defaults.
pub fn parse_config(config_str: &str) -> Result<MasterConfig> {
    let parse_start_time = Instant::now();
    let config: MasterConfig = if config_str.trim().is_empty() {
        MasterConfig::default()
    } else {
        serde_yaml::from_str(config_str).context("Failed to parse YAML configuration. 💔")?
    };
    debug!("Parsed YAML in {:?}", parse_start_time.elapsed());

    validate_master_config(&config).context("Master configuration validation failed 👎")?;
    Ok(config)
}

fn validate_master_config(config: &MasterConfig) -> Result<()> {
    debug!("🕵️ Validating master configuration...");
    let validation_start_time = Instant::now();

    let root = &config.timelapse.root_directory;
    if root.is_empty() {
        bail!("❌ timelapse.root_directory cannot be empty.");
    }
    let root_path = Path::new(root);
    if root_path.exists() && !root_path.is_dir() {
        bail!("❌ Timelapse root '{}' exists but is not a directory.", root);
    }
    if config.app_settings.snapshot_directory.is_empty() {
        bail!("❌ application.snapshot_directory cannot be empty.");
    }
    if config.timelapse.poll_quantum_ms == 0 || config.timelapse.poll_quantum_ms > 500 {
        bail!(
            "❌ timelapse.poll_quantum_ms must be between 1 and 500, got {}.",
            config.timelapse.poll_quantum_ms
        );
    }
    if config.timelapse.video_fps == 0 {
        bail!("❌ timelapse.video_fps must be positive.");
    }
    if config.timelapse.video_extension.is_empty() {
        bail!("❌ timelapse.video_extension cannot be empty.");
    }
    if config.timelapse.max_count == 0 {
        bail!("❌ timelapse.max_count must be positive.");
    }
    if config.upload.backend != UploadBackend::Disabled && config.upload.folder_id.is_empty() {
        bail!("❌ upload.folder_id is required when the upload backend is enabled.");
    }
    if config.camera.preview_fps == 0 {
        bail!("❌ camera.preview_fps must be positive.");
    }
    if let (Some(w), Some(h)) = (config.camera.width, config.camera.height) {
        if w == 0 || h == 0 {
            bail!("❌ camera resolution {}x{} is invalid.", w, h);
        }
    }

    info!("👍 Master configuration validated successfully in {:?}.", validation_start_time.elapsed());
    Ok(())
}
