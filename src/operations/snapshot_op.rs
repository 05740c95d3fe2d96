use crate::common::file_utils::{generate_timestamped_filename, write_durable};
use crate::config_loader::MasterConfig;
use crate::core::camera_manager::CameraManager;
use crate::operations::op_helper;
use anyhow::{Context, Result};
use clap::ArgMatches;
use image::ImageFormat;
use log::{debug, info};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Captures one frame and returns it PNG-encoded.
pub async fn snap_png(camera_manager: &CameraManager) -> Result<Vec<u8>> {
    let frame = camera_manager.snap().await.context("Camera failed to take a snapshot")?;
    let encode_start = Instant::now();
    let mut buffer = Cursor::new(Vec::new());
    frame
        .image
        .write_to(&mut buffer, ImageFormat::Png)
        .context("Failed to encode snapshot as PNG")?;
    debug!("Encoded snapshot as PNG in {:?}", encode_start.elapsed());
    Ok(buffer.into_inner())
}

/// Takes a snapshot and writes it to `path`.
pub async fn snap_to_file(camera_manager: &CameraManager, path: &Path) -> Result<()> {
    let png = snap_png(camera_manager).await?;
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_durable(&target, &png))
        .await
        .context("Snapshot write task failed")?
        .with_context(|| format!("Failed to write snapshot to '{}'", path.display()))?;
    Ok(())
}

pub fn default_snapshot_name(master_config: &MasterConfig, camera_name: &str) -> String {
    generate_timestamped_filename(
        camera_name,
        &master_config.app_settings.filename_timestamp_format,
        "png",
    )
}

pub async fn handle_snap_cli(
    master_config: &MasterConfig,
    camera_manager: &CameraManager,
    args: &ArgMatches,
) -> Result<PathBuf> {
    let op_start_time = Instant::now();
    let camera_name = camera_manager.metadata().await.name;
    info!("📸 Taking a snapshot with '{}'.", camera_name);

    let path = op_helper::determine_output_file(
        args,
        "output",
        &master_config.app_settings.snapshot_directory,
        &default_snapshot_name(master_config, &camera_name),
    )?;
    snap_to_file(camera_manager, &path).await?;

    info!("✅ Snapshot saved to '{}' in {:?}.", path.display(), op_start_time.elapsed());
    Ok(path)
}
