use crate::common::file_utils::write_durable;
use crate::config_loader::MasterConfig;
use crate::core::camera_manager::CameraManager;
use crate::operations::op_helper;
use crate::timelapse::confirm::Proposal;
use crate::timelapse::registry::{ConfirmOutcome, Page};
use crate::timelapse::TimelapseRegistry;
use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use log::{debug, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

fn open(master_config: &MasterConfig, camera_manager: Arc<CameraManager>) -> Result<Arc<TimelapseRegistry>> {
    let notifier = op_helper::build_notifier(master_config, Vec::new())?;
    let registry = op_helper::open_registry(master_config, camera_manager, notifier)?;
    op_helper::log_recovered(&registry);
    Ok(registry)
}

/// Renders one page of names, 1-based for display.
pub fn format_page(page: &Page) -> String {
    if page.items.is_empty() {
        return format!("No timelapses on page {}/{}.", page.page + 1, page.total_pages);
    }
    let mut out = format!("Timelapses (page {}/{}):", page.page + 1, page.total_pages);
    for name in &page.items {
        out.push_str("\n  - ");
        out.push_str(name);
    }
    out
}

pub async fn handle_list_cli(
    master_config: &MasterConfig,
    camera_manager: Arc<CameraManager>,
    args: &ArgMatches,
) -> Result<()> {
    let registry = open(master_config, camera_manager)?;
    if let Some(query) = args.get_one::<String>("find") {
        let matches = registry.autocomplete(query);
        if matches.is_empty() {
            println!("No timelapse matches '{}'.", query);
        }
        for name in matches {
            println!("{}", name);
        }
        return Ok(());
    }

    let page = args.get_one::<usize>("page").copied().unwrap_or(1);
    if page == 0 {
        bail!("Pages start at 1.");
    }
    let listing = registry.list_page(page - 1).context("Failed to list timelapses")?;
    println!("{}", format_page(&listing));
    Ok(())
}

/// Resolves a proposal on the terminal unless `--yes` was given.
async fn resolve(registry: &TimelapseRegistry, proposal: Proposal, question: String, args: &ArgMatches) -> Result<ConfirmOutcome> {
    let accepted = if args.get_flag("yes") {
        debug!("Proposal #{} confirmed by --yes.", proposal.token);
        true
    } else {
        op_helper::prompt_confirmation(format!(
            "{} (expires in {}s)",
            question,
            proposal.expires_in.as_secs()
        ))
        .await?
    };
    Ok(registry.confirm(proposal.token, accepted).await?)
}

pub async fn handle_delete_cli(
    master_config: &MasterConfig,
    camera_manager: Arc<CameraManager>,
    args: &ArgMatches,
) -> Result<()> {
    let name = args.get_one::<String>("name").context("Missing timelapse name")?;
    let registry = open(master_config, camera_manager)?;
    let proposal = registry.propose_delete(name)?;
    match resolve(&registry, proposal, format!("Delete timelapse '{}'?", name), args).await? {
        ConfirmOutcome::Deleted(name) => info!("🗑️ Timelapse '{}' deleted.", name),
        ConfirmOutcome::Declined => info!("Delete canceled; '{}' was kept.", name),
        other => warn!("Unexpected confirmation outcome: {:?}", other),
    }
    Ok(())
}

pub async fn handle_rename_cli(
    master_config: &MasterConfig,
    camera_manager: Arc<CameraManager>,
    args: &ArgMatches,
) -> Result<()> {
    let name = args.get_one::<String>("name").context("Missing timelapse name")?;
    let new_name = args.get_one::<String>("new_name").context("Missing new name")?;
    let registry = open(master_config, camera_manager)?;
    let proposal = registry.propose_rename(name, new_name)?;
    let question = format!("Rename timelapse '{}' to '{}'?", name, new_name);
    match resolve(&registry, proposal, question, args).await? {
        ConfirmOutcome::Renamed { from, to } => info!("✏️ Timelapse '{}' is now '{}'.", from, to),
        ConfirmOutcome::Declined => info!("Rename canceled; '{}' keeps its name.", name),
        other => warn!("Unexpected confirmation outcome: {:?}", other),
    }
    Ok(())
}

pub async fn handle_export_cli(
    master_config: &MasterConfig,
    camera_manager: Arc<CameraManager>,
    args: &ArgMatches,
) -> Result<PathBuf> {
    let op_start_time = Instant::now();
    let name = args.get_one::<String>("name").context("Missing timelapse name")?;
    let registry = open(master_config, camera_manager)?;
    let bytes = registry
        .archive_bytes(name)
        .await
        .with_context(|| format!("Failed to archive '{}'", name))?;

    let output = op_helper::determine_output_file(args, "output", ".", &format!("{}.zip", name))?;
    let target = output.clone();
    let size = bytes.len();
    tokio::task::spawn_blocking(move || write_durable(&target, &bytes))
        .await
        .context("Export write task failed")??;
    info!(
        "📦 Exported '{}' ({} bytes) to '{}' in {:?}.",
        name,
        size,
        output.display(),
        op_start_time.elapsed()
    );
    Ok(output)
}

/// Opening the registry already relocates interrupted sessions; this lists
/// everything that has ended up in `incomplete/`.
pub async fn handle_recover_cli(
    master_config: &MasterConfig,
    camera_manager: Arc<CameraManager>,
    _args: &ArgMatches,
) -> Result<Vec<String>> {
    let registry = open(master_config, camera_manager)?;
    if registry.recovered().is_empty() {
        info!("No interrupted timelapses found in '{}'.", registry.paths().active.display());
    }

    let mut incomplete = Vec::new();
    for entry in fs::read_dir(&registry.paths().incomplete).context("Failed to read incomplete directory")? {
        let entry = entry?;
        incomplete.push(entry.file_name().to_string_lossy().into_owned());
    }
    incomplete.sort();
    for name in &incomplete {
        println!("{}", registry.paths().incomplete.join(name).display());
    }
    Ok(incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated_camera::SimulatedCamera;

    fn config_in(dir: &std::path::Path) -> MasterConfig {
        let mut config = MasterConfig::default();
        config.timelapse.root_directory = dir.join("timelapses").to_string_lossy().into_owned();
        config.timelapse.encode_video = false;
        config
    }

    fn camera() -> Arc<CameraManager> {
        Arc::new(CameraManager::with_source(Box::new(SimulatedCamera::new(10))))
    }

    fn sub(argv: &[&str]) -> ArgMatches {
        let matches = crate::cli::build_cli().get_matches_from(argv.iter().copied());
        let (_, sub) = matches.subcommand().unwrap();
        sub.clone()
    }

    #[test]
    fn pages_are_shown_one_based() {
        let page = Page {
            items: vec!["a".into(), "b".into()],
            page: 0,
            total_pages: 2,
        };
        assert_eq!(format_page(&page), "Timelapses (page 1/2):\n  - a\n  - b");
        let empty = Page {
            items: Vec::new(),
            page: 3,
            total_pages: 1,
        };
        assert_eq!(format_page(&empty), "No timelapses on page 4/1.");
    }

    #[tokio::test]
    async fn delete_with_yes_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let finished = dir.path().join("timelapses/finished/t1");
        fs::create_dir_all(&finished).unwrap();

        handle_delete_cli(&config, camera(), &sub(&["camlapse", "delete", "t1", "--yes"]))
            .await
            .unwrap();
        assert!(!finished.exists());
    }

    #[tokio::test]
    async fn rename_of_missing_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let result = handle_rename_cli(&config, camera(), &sub(&["camlapse", "rename", "nope", "other", "-y"])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn recover_lists_interrupted_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        fs::create_dir_all(dir.path().join("timelapses/active/t9/frames")).unwrap();

        let names = handle_recover_cli(&config, camera(), &sub(&["camlapse", "recover"])).await.unwrap();
        assert_eq!(names, vec!["t9".to_string()]);
        assert!(!dir.path().join("timelapses/active/t9").exists());
    }

    #[tokio::test]
    async fn export_writes_zip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let finished = dir.path().join("timelapses/finished/t1");
        fs::create_dir_all(&finished).unwrap();
        fs::write(finished.join("metadata.json"), b"{}").unwrap();
        let out = dir.path().join("out/t1.zip");

        let path = handle_export_cli(
            &config,
            camera(),
            &sub(&["camlapse", "export", "t1", "-o", out.to_str().unwrap()]),
        )
        .await
        .unwrap();
        assert_eq!(path, out);
        assert!(fs::read(&out).unwrap().starts_with(b"PK"));
    }
}
