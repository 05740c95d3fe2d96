use anyhow::{bail, Context, Result};
use camlapse::cli::{self, DEFAULT_CONFIG_PATH};
use camlapse::common::logging_setup;
use camlapse::config_loader::{self, MasterConfig};
use camlapse::core::camera_manager::CameraManager;
use camlapse::operations;
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    let main_start_time = Instant::now();
    // Parse CLI arguments early for potential use in logging or config path
    let matches = cli::build_cli().get_matches();

    let explicit_config = matches.get_one::<String>("config").map(|s| s.as_str());
    let config_path = explicit_config.unwrap_or(DEFAULT_CONFIG_PATH);

    let config_load_start_time = Instant::now();
    let master_config = if explicit_config.is_none() && !Path::new(config_path).exists() {
        logging_setup::initialize_logging(None, &matches);
        warn!("⚠️ No configuration at '{}', running with defaults.", config_path);
        MasterConfig::default()
    } else {
        match config_loader::load_config(config_path) {
            Ok(cfg) => {
                logging_setup::initialize_logging(Some(&cfg), &matches);
                info!(
                    "✅ Configuration loaded from: {} in {:?}",
                    config_path,
                    config_load_start_time.elapsed()
                );
                cfg
            }
            Err(e) => {
                logging_setup::initialize_logging(None, &matches);
                error!("❌ Failed to load configuration from '{}': {:#}. Exiting.", config_path, e);
                return Err(e.context(format!("Failed to load configuration from '{}'", config_path)));
            }
        }
    };

    let Some((operation_name, sub_matches)) = matches.subcommand() else {
        info!("🤔 No subcommand provided. Try 'camlapse console' or 'camlapse --help'.");
        return Ok(());
    };

    debug!("Initializing CameraManager...");
    let cm_init_start_time = Instant::now();
    let camera_manager = Arc::new(
        CameraManager::from_config(&master_config.camera)
            .await
            .context("Failed to initialize CameraManager")?,
    );
    debug!("✅ CameraManager initialized in {:?}.", cm_init_start_time.elapsed());

    debug!("🎬 Dispatching to subcommand: {}", operation_name);
    let op_start_time = Instant::now();
    let op_result: Result<()> = match operation_name {
        "snap" => operations::snapshot_op::handle_snap_cli(&master_config, &camera_manager, sub_matches)
            .await
            .map(|_| ()),
        "timelapse" => {
            operations::timelapse_op::handle_timelapse_cli(&master_config, Arc::clone(&camera_manager), sub_matches).await
        }
        "list" => operations::archive_op::handle_list_cli(&master_config, Arc::clone(&camera_manager), sub_matches).await,
        "delete" => operations::archive_op::handle_delete_cli(&master_config, Arc::clone(&camera_manager), sub_matches).await,
        "rename" => operations::archive_op::handle_rename_cli(&master_config, Arc::clone(&camera_manager), sub_matches).await,
        "export" => operations::archive_op::handle_export_cli(&master_config, Arc::clone(&camera_manager), sub_matches)
            .await
            .map(|_| ()),
        "recover" => operations::archive_op::handle_recover_cli(&master_config, Arc::clone(&camera_manager), sub_matches)
            .await
            .map(|_| ()),
        "camera-set" => operations::camera_control_op::handle_camera_set_cli(&master_config, &camera_manager, sub_matches)
            .await
            .map(|_| ()),
        "console" => operations::console_op::handle_console_cli(&master_config, Arc::clone(&camera_manager), sub_matches).await,
        other => bail!("Subcommand '{}' not implemented.", other),
    };

    if let Err(e) = op_result {
        error!("❌ Operation '{}' failed after {:?}: {:#}", operation_name, op_start_time.elapsed(), e);
        return Err(e);
    }
    info!("✅ Operation '{}' completed successfully in {:?}.", operation_name, op_start_time.elapsed());
    info!("🏁 camlapse finished in {:?}.", main_start_time.elapsed());
    Ok(())
}
