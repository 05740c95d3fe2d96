use crate::common::timestamp_utils::format_eta;
use crate::config_loader::MasterConfig;
use crate::core::camera_manager::CameraManager;
use crate::errors::AppError;
use crate::operations::op_helper;
use crate::timelapse::finalize::{FinalizeReport, StageResult};
use crate::timelapse::scheduler::Schedule;
use crate::timelapse::{SessionHandle, SessionOutcome, TimelapseRegistry};
use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reads a timepoints file: offsets in seconds, separated by commas or newlines.
pub async fn load_timepoints(path: &str) -> Result<Schedule> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read timepoints file '{}'", path))?;
    Schedule::parse_timepoints(&text).with_context(|| format!("Invalid timepoints in '{}'", path))
}

pub async fn handle_timelapse_cli(
    master_config: &MasterConfig,
    camera_manager: Arc<CameraManager>,
    args: &ArgMatches,
) -> Result<()> {
    let op_start_time = Instant::now();
    let name = args
        .get_one::<String>("name")
        .context("Missing timelapse name")?
        .clone();
    let report_every = Duration::from_secs(args.get_one::<u64>("report-every").copied().unwrap_or(10).max(1));

    let notifier = op_helper::build_notifier(master_config, Vec::new())?;
    let registry = op_helper::open_registry(master_config, camera_manager, notifier)?;
    op_helper::log_recovered(&registry);

    let started = match args.get_one::<String>("timepoints") {
        Some(path) => {
            let schedule = load_timepoints(path).await?;
            registry.start_with_schedule(&name, schedule).await
        }
        None => {
            let interval = *args.get_one::<f64>("interval").context("Missing --interval")?;
            let count = *args.get_one::<u32>("count").context("Missing --count")?;
            registry.start(&name, interval, count).await
        }
    };
    let handle = match started {
        Ok(handle) => handle,
        Err(e) if e.is_rejection() => bail!("Failed to start. {}", e),
        Err(e) => return Err(e).context("Failed to start timelapse"),
    };
    info!("⏳ Timelapse '{}' has started. ETA: {}. Press Ctrl-C to cancel.", name, format_eta(handle.eta()));

    let outcome = supervise(&registry, handle, report_every).await;
    match outcome {
        SessionOutcome::Completed(report) => {
            log_report(&report);
            info!("✅ Timelapse '{}' done in {:?}.", name, op_start_time.elapsed());
            Ok(())
        }
        SessionOutcome::Canceled => {
            warn!("🛑 Timelapse '{}' was canceled after {:?}; its frames were discarded.", name, op_start_time.elapsed());
            Ok(())
        }
        SessionOutcome::Failed(reason) => {
            error!("❌ Timelapse '{}' failed after {:?}: {}", name, op_start_time.elapsed(), reason);
            bail!("Timelapse '{}' failed: {}", name, reason)
        }
    }
}

/// Waits for the session while logging progress; Ctrl-C requests cancellation.
async fn supervise(registry: &TimelapseRegistry, handle: SessionHandle, report_every: Duration) -> SessionOutcome {
    let wait = handle.wait();
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(report_every);
    ticker.tick().await;

    loop {
        tokio::select! {
            outcome = &mut wait => return outcome,
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) if registry.cancel() => info!("🛑 Canceling timelapse, waiting for the capture loop to stop..."),
                    Ok(()) => info!("Nothing left to cancel; waiting for finalization to finish."),
                    Err(e) => {
                        error!("Failed to listen for Ctrl-C: {}", e);
                        return (&mut wait).await;
                    }
                }
            }
            _ = ticker.tick() => {
                match registry.progress() {
                    Ok(snapshot) => info!("📈 {}", snapshot),
                    Err(AppError::NoActiveSession) => debug!("Capture finished; finalizing..."),
                    Err(e) => warn!("Progress unavailable: {}", e),
                }
            }
        }
    }
}

fn stage_line<T>(label: &str, stage: &StageResult<T>) -> String {
    match stage {
        StageResult::Done(_) => format!("{}: done", label),
        StageResult::Skipped(why) => format!("{}: skipped ({})", label, why),
        StageResult::Failed(why) => format!("{}: FAILED ({})", label, why),
    }
}

pub fn log_report(report: &FinalizeReport) {
    info!("🗂️ '{}': {} frames in '{}'", report.name, report.frames, report.session_dir.display());
    info!("  -> {}", stage_line("video", &report.video));
    info!("  -> {}", stage_line("archive", &report.archive));
    info!("  -> {}", stage_line("upload", &report.upload));
    if !report.notified {
        warn!("  -> completion notice could not be delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn timepoints_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tp.csv");
        std::fs::write(&path, "0, 30, 10\n").unwrap();
        let schedule = load_timepoints(path.to_str().unwrap()).await.unwrap();
        assert_eq!(schedule.count(), 3);
        assert_eq!(schedule.total_span(), Duration::from_secs(30));

        std::fs::write(&path, "0, later").unwrap();
        assert!(load_timepoints(path.to_str().unwrap()).await.is_err());
    }

    #[test]
    fn stage_lines_explain_skips_and_failures() {
        let report = FinalizeReport {
            name: "t1".into(),
            session_dir: PathBuf::from("finished/t1"),
            frames: 3,
            video: StageResult::Failed("ffmpeg exited with 1".into()),
            archive: StageResult::Done(PathBuf::from("t1.zip")),
            upload: StageResult::Skipped("video encoding failed".into()),
            notified: true,
        };
        assert_eq!(stage_line("video", &report.video), "video: FAILED (ffmpeg exited with 1)");
        assert_eq!(stage_line("upload", &report.upload), "upload: skipped (video encoding failed)");
        assert_eq!(stage_line("archive", &report.archive), "archive: done");
    }
}
