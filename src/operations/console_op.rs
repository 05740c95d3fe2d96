use crate::camera::preview::PreviewHub;
use crate::common::file_utils::{ensure_output_directory, write_durable};
use crate::common::timestamp_utils::format_eta;
use crate::config_loader::MasterConfig;
use crate::core::camera_manager::CameraManager;
use crate::core::capture_source::CameraParams;
use crate::notify::{ChannelNotifier, Notification};
use crate::operations::{archive_op, op_helper, snapshot_op, timelapse_op};
use crate::timelapse::confirm::ConfirmBroker;
use crate::timelapse::registry::ConfirmOutcome;
use crate::timelapse::{SessionHandle, SessionOutcome, TimelapseRegistry};
use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PREVIEW_TIMEOUT: Duration = Duration::from_secs(5);

const HELP: &str = "\
commands:
  snap [FILE]                      take a still image
  start SECONDS COUNT NAME         start a timelapse
  start-timepoints FILE NAME       start a timelapse at the offsets listed in FILE
  cancel                           ask to cancel the running timelapse
  progress                         show progress of the running timelapse
  list [PAGE]                      list finished timelapses
  find QUERY                       search finished timelapses by name
  delete NAME                      ask to delete a finished timelapse
  rename NAME NEW_NAME             ask to rename a finished timelapse
  yes TOKEN | no TOKEN             answer a pending question
  export NAME FILE                 write a finished timelapse as a zip
  camera KEY=VALUE...              change camera settings (name, width, height, exposure, gain)
  preview FILE                     save one live preview frame as JPEG
  help                             show this text
  quit                             leave the console";

/// Answers to `yes`/`no`. Cancel questions are asked by the console itself,
/// delete and rename questions by the registry, so their tokens are kept apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Cancel(u64),
    Manage(u64),
}

impl Token {
    fn parse(raw: &str) -> Result<Self> {
        let (cancel, digits) = match raw.strip_prefix('c') {
            Some(rest) => (true, rest),
            None => (false, raw.trim_start_matches('#')),
        };
        let value = digits
            .parse::<u64>()
            .with_context(|| format!("'{}' is not a question token", raw))?;
        Ok(if cancel { Token::Cancel(value) } else { Token::Manage(value) })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Snap(Option<String>),
    Start { interval: f64, count: u32, name: String },
    StartTimepoints { file: String, name: String },
    Cancel,
    Progress,
    List(usize),
    Find(String),
    Delete(String),
    Rename { from: String, to: String },
    Answer { token: Token, accepted: bool },
    Export { name: String, file: String },
    Camera(CameraParams),
    Preview(String),
    Help,
    Quit,
}

fn expect_args<'a>(words: &[&'a str], count: usize, usage: &str) -> Result<Vec<&'a str>> {
    if words.len() != count {
        bail!("usage: {}", usage);
    }
    Ok(words.to_vec())
}

fn parse_camera_params(pairs: &[&str]) -> Result<CameraParams> {
    let mut params = CameraParams::default();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got '{}'", pair))?;
        match key {
            "name" => params.name = Some(value.to_string()),
            "width" => params.width = Some(value.parse().context("width must be a whole number")?),
            "height" => params.height = Some(value.parse().context("height must be a whole number")?),
            "exposure" => params.exposure_us = Some(value.parse().context("exposure must be in microseconds")?),
            "gain" => params.gain = Some(value.parse().context("gain must be a number")?),
            other => bail!("unknown camera setting '{}'", other),
        }
    }
    if params.is_empty() {
        bail!("usage: camera KEY=VALUE...");
    }
    Ok(params)
}

impl ConsoleCommand {
    /// Parses one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&head, rest)) = words.split_first() else {
            return Ok(None);
        };
        let command = match head.to_lowercase().as_str() {
            "snap" => match rest {
                [] => ConsoleCommand::Snap(None),
                [file] => ConsoleCommand::Snap(Some(file.to_string())),
                _ => bail!("usage: snap [FILE]"),
            },
            "start" => {
                let args = expect_args(rest, 3, "start SECONDS COUNT NAME")?;
                ConsoleCommand::Start {
                    interval: args[0].parse().context("interval must be a number of seconds")?,
                    count: args[1].parse().context("count must be a whole number")?,
                    name: args[2].to_string(),
                }
            }
            "start-timepoints" => {
                let args = expect_args(rest, 2, "start-timepoints FILE NAME")?;
                ConsoleCommand::StartTimepoints {
                    file: args[0].to_string(),
                    name: args[1].to_string(),
                }
            }
            "cancel" => ConsoleCommand::Cancel,
            "progress" => ConsoleCommand::Progress,
            "list" => match rest {
                [] => ConsoleCommand::List(1),
                [page] => {
                    let page: usize = page.parse().context("page must be a whole number")?;
                    if page == 0 {
                        bail!("pages start at 1");
                    }
                    ConsoleCommand::List(page)
                }
                _ => bail!("usage: list [PAGE]"),
            },
            "find" => ConsoleCommand::Find(rest.join(" ")),
            "delete" => ConsoleCommand::Delete(expect_args(rest, 1, "delete NAME")?[0].to_string()),
            "rename" => {
                let args = expect_args(rest, 2, "rename NAME NEW_NAME")?;
                ConsoleCommand::Rename {
                    from: args[0].to_string(),
                    to: args[1].to_string(),
                }
            }
            "yes" | "no" => ConsoleCommand::Answer {
                token: Token::parse(expect_args(rest, 1, "yes TOKEN | no TOKEN")?[0])?,
                accepted: head.eq_ignore_ascii_case("yes"),
            },
            "export" => {
                let args = expect_args(rest, 2, "export NAME FILE")?;
                ConsoleCommand::Export {
                    name: args[0].to_string(),
                    file: args[1].to_string(),
                }
            }
            "camera" => ConsoleCommand::Camera(parse_camera_params(rest)?),
            "preview" => ConsoleCommand::Preview(expect_args(rest, 1, "preview FILE")?[0].to_string()),
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => bail!("unknown command '{}', try 'help'", other),
        };
        Ok(Some(command))
    }
}

pub enum Reply {
    Text(String),
    Quit,
}

/// Interactive front end over one registry and one preview hub.
pub struct Console {
    master_config: MasterConfig,
    registry: Arc<TimelapseRegistry>,
    preview: PreviewHub,
    cancels: ConfirmBroker<String>,
    /// Outcome reporters of the sessions started here, awaited on shutdown.
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

impl Console {
    pub fn new(master_config: MasterConfig, registry: Arc<TimelapseRegistry>) -> Self {
        let preview = PreviewHub::new(Arc::clone(registry.camera()));
        let cancels = ConfirmBroker::new(Duration::from_secs(master_config.timelapse.confirm_timeout_secs));
        Console {
            master_config,
            registry,
            preview,
            cancels,
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, handle: SessionHandle) {
        let reporter = tokio::spawn(async move { report_outcome(handle.wait().await) });
        let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.retain(|task| !task.is_finished());
        sessions.push(reporter);
    }

    /// Cancels a running capture, then waits for every session started from
    /// this console to finish finalizing and deliver its notification.
    pub async fn shutdown(&self) {
        if self.registry.cancel() {
            warn!("🛑 Console closed while a timelapse was running; it has been canceled.");
        }
        let pending: Vec<JoinHandle<()>> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.drain(..).collect()
        };
        if self.registry.is_busy() {
            info!("⏳ Waiting for the last timelapse to finish finalizing...");
        }
        for task in pending {
            if let Err(e) = task.await {
                error!("❌ Timelapse reporter ended abnormally: {}", e);
            }
        }
        while self.registry.is_busy() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn camera(&self) -> &CameraManager {
        self.registry.camera()
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Result<Reply> {
        let text = match command {
            ConsoleCommand::Snap(file) => {
                let path = match file {
                    Some(file) => PathBuf::from(file),
                    None => {
                        let camera_name = self.camera().metadata().await.name;
                        let dir = ensure_output_directory(Path::new(&self.master_config.app_settings.snapshot_directory))?;
                        dir.join(snapshot_op::default_snapshot_name(&self.master_config, &camera_name))
                    }
                };
                snapshot_op::snap_to_file(self.camera(), &path).await?;
                format!("📸 Saved '{}'.", path.display())
            }
            ConsoleCommand::Start { interval, count, name } => {
                let handle = self.registry.start(&name, interval, count).await?;
                let eta = handle.eta();
                self.track(handle);
                format!("⏳ Timelapse '{}' has started. ETA: {}", name, format_eta(eta))
            }
            ConsoleCommand::StartTimepoints { file, name } => {
                let schedule = timelapse_op::load_timepoints(&file).await?;
                let handle = self.registry.start_with_schedule(&name, schedule).await?;
                let eta = handle.eta();
                self.track(handle);
                format!("⏳ Timelapse '{}' has started. ETA: {}", name, format_eta(eta))
            }
            ConsoleCommand::Cancel => {
                let name = self.registry.active_name().context("There is no active timelapse.")?;
                let proposal = self.cancels.propose(name.clone());
                format!(
                    "Cancel timelapse '{}'? Its frames will be discarded. Answer 'yes c{}' or 'no c{}' within {}s.",
                    name,
                    proposal.token,
                    proposal.token,
                    proposal.expires_in.as_secs()
                )
            }
            ConsoleCommand::Progress => self.registry.progress()?.to_string(),
            ConsoleCommand::List(page) => archive_op::format_page(&self.registry.list_page(page.saturating_sub(1))?),
            ConsoleCommand::Find(query) => {
                let found = self.registry.autocomplete(&query);
                if found.is_empty() {
                    format!("No timelapse matches '{}'.", query)
                } else {
                    found.join("\n")
                }
            }
            ConsoleCommand::Delete(name) => {
                let proposal = self.registry.propose_delete(&name)?;
                format!(
                    "Delete timelapse '{}'? Answer 'yes {}' or 'no {}' within {}s.",
                    name,
                    proposal.token,
                    proposal.token,
                    proposal.expires_in.as_secs()
                )
            }
            ConsoleCommand::Rename { from, to } => {
                let proposal = self.registry.propose_rename(&from, &to)?;
                format!(
                    "Rename timelapse '{}' to '{}'? Answer 'yes {}' or 'no {}' within {}s.",
                    from,
                    to,
                    proposal.token,
                    proposal.token,
                    proposal.expires_in.as_secs()
                )
            }
            ConsoleCommand::Answer { token: Token::Cancel(token), accepted } => {
                match self.cancels.confirm(token, accepted)? {
                    None => "Cancel aborted; the timelapse keeps running.".to_string(),
                    Some(name) => {
                        let still_running = self.registry.active_name().as_deref() == Some(name.as_str());
                        if still_running && self.registry.cancel() {
                            format!("🛑 Canceling timelapse '{}'.", name)
                        } else {
                            format!("Timelapse '{}' is no longer running.", name)
                        }
                    }
                }
            }
            ConsoleCommand::Answer { token: Token::Manage(token), accepted } => {
                match self.registry.confirm(token, accepted).await? {
                    ConfirmOutcome::Declined => "Canceled; nothing was changed.".to_string(),
                    ConfirmOutcome::Deleted(name) => format!("🗑️ Deleted '{}'.", name),
                    ConfirmOutcome::Renamed { from, to } => format!("✏️ Renamed '{}' to '{}'.", from, to),
                }
            }
            ConsoleCommand::Export { name, file } => {
                let bytes = self.registry.archive_bytes(&name).await?;
                let path = PathBuf::from(file);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    ensure_output_directory(parent)?;
                }
                let size = bytes.len();
                let target = path.clone();
                tokio::task::spawn_blocking(move || write_durable(&target, &bytes))
                    .await
                    .context("Export write task failed")??;
                format!("📦 Wrote '{}' ({} bytes).", path.display(), size)
            }
            ConsoleCommand::Camera(params) => {
                let changes = self.camera().set_params(&params).await?;
                if changes.is_empty() {
                    "No camera settings changed.".to_string()
                } else {
                    changes
                }
            }
            ConsoleCommand::Preview(file) => {
                let jpeg = self.preview_frame().await?;
                let path = PathBuf::from(file);
                let target = path.clone();
                let size = jpeg.len();
                tokio::task::spawn_blocking(move || write_durable(&target, &jpeg))
                    .await
                    .context("Preview write task failed")??;
                format!("👀 Preview frame ({} bytes) saved to '{}'.", size, path.display())
            }
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => return Ok(Reply::Quit),
        };
        Ok(Reply::Text(text))
    }

    /// Joins the shared preview stream just long enough to grab one frame.
    async fn preview_frame(&self) -> Result<Vec<u8>> {
        let mut receiver = self.preview.subscribe().await?;
        let waited = tokio::time::timeout(PREVIEW_TIMEOUT, async {
            loop {
                let latest = receiver.borrow_and_update().clone();
                if let Some(frame) = latest {
                    return Some(frame);
                }
                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;
        self.preview.unsubscribe(receiver).await?;
        let frame = match waited {
            Ok(Some(frame)) => frame,
            Ok(None) => bail!("Preview stream closed before a frame arrived"),
            Err(_) => bail!("No preview frame arrived within {:?}", PREVIEW_TIMEOUT),
        };
        Ok(frame.as_ref().clone())
    }
}

fn report_outcome(outcome: SessionOutcome) {
    match outcome {
        SessionOutcome::Completed(report) => timelapse_op::log_report(&report),
        SessionOutcome::Canceled => info!("🛑 Timelapse canceled."),
        SessionOutcome::Failed(reason) => error!("❌ Timelapse failed: {}", reason),
    }
}

fn print_notification(notification: &Notification) {
    println!("\n🔔 {}", notification);
    if let Some(path) = notification.attachment() {
        println!("   attached: {}", path.display());
    }
}

pub async fn handle_console_cli(
    master_config: &MasterConfig,
    camera_manager: Arc<CameraManager>,
    _args: &ArgMatches,
) -> Result<()> {
    let op_start_time = Instant::now();
    let (channel, mut notifications) = ChannelNotifier::new();
    let notifier = op_helper::build_notifier(master_config, vec![Arc::new(channel)])?;
    let registry = op_helper::open_registry(master_config, camera_manager, notifier)?;
    op_helper::log_recovered(&registry);
    let console = Console::new(master_config.clone(), Arc::clone(&registry));

    let (line_tx, mut line_rx) = mpsc::channel::<String>(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    break;
                }
            }
        }
    });

    println!("camlapse console. Type 'help' for commands.");
    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else {
                    debug!("Console input closed.");
                    break;
                };
                let command = match ConsoleCommand::parse(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{:#}", e);
                        continue;
                    }
                };
                match console.execute(command).await {
                    Ok(Reply::Text(text)) => println!("{}", text),
                    Ok(Reply::Quit) => break,
                    Err(e) => println!("❌ {:#}", e),
                }
            }
            Some(notification) = notifications.recv() => print_notification(&notification),
        }
    }

    console.shutdown().await;
    while let Ok(notification) = notifications.try_recv() {
        print_notification(&notification);
    }
    info!("👋 Console session ended after {:?}.", op_start_time.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated_camera::SimulatedCamera;
    use crate::errors::AppError;
    use crate::timelapse::clock::SystemClock;
    use crate::timelapse::encoder::VideoEncoder;
    use crate::timelapse::finalize::{FinalizationPipeline, FinalizeSettings};
    use crate::timelapse::RegistrySettings;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct SlowEncoder {
        started: AtomicBool,
    }

    #[async_trait]
    impl VideoEncoder for SlowEncoder {
        async fn encode(&self, _session_dir: &Path, output: &Path, _fps: u32) -> std::result::Result<(), AppError> {
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            fs::write(output, b"video")?;
            Ok(())
        }
    }

    #[test]
    fn parses_start_and_answers() {
        assert_eq!(
            ConsoleCommand::parse("start 1.5 20 sunset").unwrap(),
            Some(ConsoleCommand::Start {
                interval: 1.5,
                count: 20,
                name: "sunset".into()
            })
        );
        assert_eq!(
            ConsoleCommand::parse("yes c3").unwrap(),
            Some(ConsoleCommand::Answer {
                token: Token::Cancel(3),
                accepted: true
            })
        );
        assert_eq!(
            ConsoleCommand::parse("NO 7").unwrap(),
            Some(ConsoleCommand::Answer {
                token: Token::Manage(7),
                accepted: false
            })
        );
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("list").unwrap(), Some(ConsoleCommand::List(1)));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(ConsoleCommand::parse("start 1 sunset").is_err());
        assert!(ConsoleCommand::parse("start soon 3 sunset").is_err());
        assert!(ConsoleCommand::parse("list 0").is_err());
        assert!(ConsoleCommand::parse("yes maybe").is_err());
        assert!(ConsoleCommand::parse("camera").is_err());
        assert!(ConsoleCommand::parse("camera iso=100").is_err());
        assert!(ConsoleCommand::parse("dance").is_err());
    }

    #[test]
    fn parses_camera_settings() {
        let parsed = ConsoleCommand::parse("camera width=640 gain=1.5").unwrap();
        assert_eq!(
            parsed,
            Some(ConsoleCommand::Camera(CameraParams {
                width: Some(640),
                gain: Some(1.5),
                ..CameraParams::default()
            }))
        );
    }

    fn console_in(dir: &Path) -> Console {
        let mut config = MasterConfig::default();
        config.timelapse.root_directory = dir.join("timelapses").to_string_lossy().into_owned();
        config.timelapse.encode_video = false;
        config.app_settings.snapshot_directory = dir.join("snaps").to_string_lossy().into_owned();
        let camera = Arc::new(CameraManager::with_source(Box::new(SimulatedCamera::new(20))));
        let notifier = op_helper::build_notifier(&config, Vec::new()).unwrap();
        let registry = op_helper::open_registry(&config, camera, notifier).unwrap();
        Console::new(config, registry)
    }

    async fn run(console: &Console, line: &str) -> Result<String> {
        let command = ConsoleCommand::parse(line)?.unwrap();
        match console.execute(command).await? {
            Reply::Text(text) => Ok(text),
            Reply::Quit => Ok("<quit>".to_string()),
        }
    }

    fn token_after(text: &str, marker: &str) -> String {
        let start = text.find(marker).unwrap() + marker.len();
        text[start..].split(|c: char| c == '\'' || c.is_whitespace()).next().unwrap().to_string()
    }

    #[tokio::test]
    async fn cancel_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let console = console_in(dir.path());
        assert!(run(&console, "cancel").await.is_err());

        run(&console, "start 60 3 t1").await.unwrap();
        let question = run(&console, "cancel").await.unwrap();
        let token = token_after(&question, "'yes ");

        let declined = run(&console, &format!("no {}", token)).await.unwrap();
        assert!(declined.contains("keeps running"));
        assert_eq!(console.registry.active_name().as_deref(), Some("t1"));

        let question = run(&console, "cancel").await.unwrap();
        let token = token_after(&question, "'yes ");
        let accepted = run(&console, &format!("yes {}", token)).await.unwrap();
        assert!(accepted.contains("Canceling"));

        for _ in 0..200 {
            if console.registry.active_name().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(console.registry.active_name().is_none());
        assert!(!dir.path().join("timelapses/active/t1").exists());
    }

    #[tokio::test]
    async fn delete_waits_for_yes() {
        let dir = tempfile::tempdir().unwrap();
        let console = console_in(dir.path());
        let finished = dir.path().join("timelapses/finished/t1");
        fs::create_dir_all(&finished).unwrap();

        let question = run(&console, "delete t1").await.unwrap();
        let token = token_after(&question, "'yes ");
        assert!(finished.exists());
        run(&console, &format!("yes {}", token)).await.unwrap();
        assert!(!finished.exists());
        assert!(run(&console, &format!("yes {}", token)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_waits_for_finalization_to_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MasterConfig::default();
        config.timelapse.root_directory = dir.path().join("timelapses").to_string_lossy().into_owned();
        let encoder = Arc::new(SlowEncoder::default());
        let (channel, mut notifications) = ChannelNotifier::new();
        let finalizer = FinalizationPipeline::new(
            Some(encoder.clone() as Arc<dyn VideoEncoder>),
            None,
            Arc::new(channel),
            FinalizeSettings {
                encode_video: true,
                video_fps: 24,
                video_extension: "mp4".into(),
                attachment_limit: 1024,
                folder_id: String::new(),
                folder_link: None,
            },
        );
        let registry = TimelapseRegistry::open(
            RegistrySettings::from_config(&config),
            Arc::new(CameraManager::with_source(Box::new(SimulatedCamera::new(20)))),
            Arc::new(SystemClock::new()),
            Arc::new(finalizer),
        )
        .unwrap();
        let console = Console::new(config, registry);

        run(&console, "start 0 1 t1").await.unwrap();
        while !encoder.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(console.registry.active_name().is_none());
        assert!(console.registry.is_busy());

        console.shutdown().await;
        assert!(!console.registry.is_busy());
        let mut finished = false;
        while let Ok(notification) = notifications.try_recv() {
            finished |= matches!(notification, Notification::Finished { .. });
        }
        assert!(finished);
        assert!(!dir.path().join("timelapses/t1.zip.part").exists());
    }

    #[tokio::test]
    async fn snap_preview_and_quit() {
        let dir = tempfile::tempdir().unwrap();
        let console = console_in(dir.path());
        let out = dir.path().join("one.png");
        run(&console, &format!("snap {}", out.display())).await.unwrap();
        assert!(out.is_file());

        let preview = dir.path().join("preview.jpg");
        run(&console, &format!("preview {}", preview.display())).await.unwrap();
        assert!(fs::read(&preview).unwrap().starts_with(&[0xFF, 0xD8]));
        assert_eq!(console.preview.client_count().await, 0);

        assert_eq!(run(&console, "quit").await.unwrap(), "<quit>");
    }
}
