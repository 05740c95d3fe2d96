use crate::common::file_utils::ensure_output_directory;
use crate::config_loader::MasterConfig;
use crate::core::camera_manager::CameraManager;
use crate::core::capture_source::CameraParams;
use crate::operations::snapshot_op;
use anyhow::{bail, Result};
use clap::ArgMatches;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub fn params_from_args(args: &ArgMatches) -> CameraParams {
    CameraParams {
        name: args.get_one::<String>("name").cloned(),
        width: args.get_one::<u32>("width").copied(),
        height: args.get_one::<u32>("height").copied(),
        exposure_us: args.get_one::<u32>("exposure").copied(),
        gain: args.get_one::<f32>("gain").copied(),
    }
}

pub async fn handle_camera_set_cli(
    master_config: &MasterConfig,
    camera_manager: &CameraManager,
    args: &ArgMatches,
) -> Result<String> {
    let op_start_time = Instant::now();
    let params = params_from_args(args);
    if params.is_empty() {
        bail!("Nothing to change. Pass at least one of --name, --width, --height, --exposure, --gain.");
    }
    debug!("Requested camera parameters: {:?}", params);

    let changes = camera_manager.set_params(&params).await?;
    if changes.is_empty() {
        println!("No camera settings changed.");
    } else {
        println!("{}", changes);
    }

    if args.get_flag("snap") {
        let camera_name = camera_manager.metadata().await.name;
        let path = new_snapshot_path(master_config, &camera_name)?;
        snapshot_op::snap_to_file(camera_manager, &path).await?;
        info!("📸 Snapshot with the new settings saved to '{}'.", path.display());
    }

    info!("🔧 Camera settings applied in {:?}.", op_start_time.elapsed());
    Ok(changes)
}

fn new_snapshot_path(master_config: &MasterConfig, camera_name: &str) -> Result<PathBuf> {
    let dir = ensure_output_directory(Path::new(&master_config.app_settings.snapshot_directory))?;
    Ok(dir.join(snapshot_op::default_snapshot_name(master_config, camera_name)))
}
