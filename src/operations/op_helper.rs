use crate::common::file_utils::ensure_output_directory;
use crate::config_loader::MasterConfig;
use crate::core::camera_manager::CameraManager;
use crate::notify::{FanoutNotifier, LogNotifier, Notifier, WebhookNotifier};
use crate::timelapse::clock::SystemClock;
use crate::timelapse::registry::finalization_from_config;
use crate::timelapse::{RegistrySettings, TimelapseRegistry};
use anyhow::{Context, Result};
use clap::ArgMatches;
use log::{debug, info};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Log output plus the webhook, when one is configured. `extra` targets are
/// appended, e.g. the console's own channel.
pub fn build_notifier(master_config: &MasterConfig, extra: Vec<Arc<dyn Notifier>>) -> Result<Arc<dyn Notifier>> {
    let mut targets: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &master_config.notify.webhook_url {
        let webhook = WebhookNotifier::new(url).context("Failed to build webhook notifier")?;
        debug!("Webhook notifications enabled.");
        targets.push(Arc::new(webhook));
    }
    targets.extend(extra);
    Ok(Arc::new(FanoutNotifier::new(targets)))
}

/// Opens the timelapse registry with the real clock and the configured
/// post-capture pipeline. Interrupted sessions are recovered here.
pub fn open_registry(
    master_config: &MasterConfig,
    camera_manager: Arc<CameraManager>,
    notifier: Arc<dyn Notifier>,
) -> Result<Arc<TimelapseRegistry>> {
    let open_start = Instant::now();
    let finalizer = finalization_from_config(master_config, notifier)
        .context("Failed to set up timelapse finalization")?;
    let registry = TimelapseRegistry::open(
        RegistrySettings::from_config(master_config),
        camera_manager,
        Arc::new(SystemClock::new()),
        Arc::new(finalizer),
    )
    .with_context(|| {
        format!(
            "Failed to open timelapse root '{}'",
            master_config.timelapse.root_directory
        )
    })?;
    debug!("Timelapse registry opened in {:?}.", open_start.elapsed());
    Ok(registry)
}

/// Resolves an optional output path argument, falling back to `default_dir/default_name`.
pub fn determine_output_file(args: &ArgMatches, key: &str, default_dir: &str, default_name: &str) -> Result<PathBuf> {
    match args.get_one::<String>(key) {
        Some(path) => {
            let path = PathBuf::from(path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                ensure_output_directory(parent)?;
            }
            Ok(path)
        }
        None => {
            let dir = ensure_output_directory(&PathBuf::from(default_dir))?;
            Ok(dir.join(default_name))
        }
    }
}

/// Asks a yes/no question on the terminal. Anything but `y`/`yes` is a no.
pub async fn prompt_confirmation(question: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || -> Result<bool> {
        print!("{} [y/N] ", question);
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(is_yes(&answer))
    })
    .await
    .context("Confirmation prompt failed")?
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

pub fn log_recovered(registry: &TimelapseRegistry) {
    for recovered in registry.recovered() {
        info!("♻️ Recovered interrupted session: {:?}", recovered);
    }
}
