use crate::app_config::IncompletePolicy;
use crate::common::file_utils::{ensure_output_directory, move_into_unique, validate_session_name};
use crate::config_loader::MasterConfig;
use crate::core::camera_manager::{CameraManager, CaptureLease};
use crate::errors::AppError;
use crate::notify::{Notification, Notifier};
use crate::timelapse::archive;
use crate::timelapse::clock::Clock;
use crate::timelapse::confirm::{ConfirmBroker, Proposal};
use crate::timelapse::encoder::{FfmpegEncoder, VideoEncoder};
use crate::timelapse::finalize::{FinalizationPipeline, FinalizeSettings};
use crate::timelapse::frame_store::{FrameStore, SessionMetadata, FRAMES_DIR};
use crate::timelapse::scheduler::{CaptureOutcome, CaptureScheduler, Schedule};
use crate::timelapse::session::{ProgressSnapshot, SessionHandle, SessionOutcome, SessionState};
use crate::upload;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task;

pub const PAGE_SIZE: usize = 10;
pub const AUTOCOMPLETE_LIMIT: usize = 25;

/// On-disk areas under the timelapse root.
#[derive(Debug, Clone)]
pub struct TimelapsePaths {
    pub root: PathBuf,
    pub active: PathBuf,
    pub finished: PathBuf,
    pub incomplete: PathBuf,
}

impl TimelapsePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        TimelapsePaths {
            active: root.join("active"),
            finished: root.join("finished"),
            incomplete: root.join("incomplete"),
            root,
        }
    }

    fn ensure(&self) -> Result<(), AppError> {
        for dir in [&self.root, &self.active, &self.finished, &self.incomplete] {
            ensure_output_directory(dir)?;
        }
        Ok(())
    }

    /// Whether `name` is taken by any session directory, in any state.
    fn is_taken(&self, name: &str) -> bool {
        [&self.active, &self.finished, &self.incomplete]
            .iter()
            .any(|area| area.join(name).exists())
    }
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub root: PathBuf,
    pub poll_quantum: Duration,
    pub incomplete_policy: IncompletePolicy,
    pub confirm_timeout: Duration,
    pub max_count: u32,
}

impl RegistrySettings {
    pub fn from_config(config: &MasterConfig) -> Self {
        let timelapse = &config.timelapse;
        RegistrySettings {
            root: PathBuf::from(&timelapse.root_directory),
            poll_quantum: Duration::from_millis(timelapse.poll_quantum_ms),
            incomplete_policy: timelapse.incomplete_policy,
            confirm_timeout: Duration::from_secs(timelapse.confirm_timeout_secs),
            max_count: timelapse.max_count,
        }
    }
}

/// Builds the post-capture pipeline described by the config.
pub fn finalization_from_config(
    config: &MasterConfig,
    notifier: Arc<dyn Notifier>,
) -> anyhow::Result<FinalizationPipeline> {
    let encoder: Option<Arc<dyn VideoEncoder>> = if config.timelapse.encode_video {
        let ffmpeg = FfmpegEncoder::new();
        if !ffmpeg.is_available() {
            warn!("⚠️ ffmpeg was not found; video encoding will fail until it is installed.");
        }
        Some(Arc::new(ffmpeg))
    } else {
        None
    };
    let uploader = upload::from_config(&config.upload)?;
    let settings = FinalizeSettings {
        encode_video: config.timelapse.encode_video,
        video_fps: config.timelapse.video_fps,
        video_extension: config.timelapse.video_extension.clone(),
        attachment_limit: config.notify.attachment_limit(),
        folder_id: config.upload.folder_id.clone(),
        folder_link: config.upload.folder_link(),
    };
    Ok(FinalizationPipeline::new(encoder, uploader, notifier, settings))
}

/// Mutation parked behind a confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManageAction {
    Delete { name: String },
    Rename { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Declined,
    Deleted(String),
    Renamed { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<String>,
    /// Zero-based.
    pub page: usize,
    pub total_pages: usize,
}

/// What startup recovery did with one interrupted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovered {
    Relocated { name: String, to: PathBuf },
    Deleted { name: String },
}

/// Process-wide owner of the timelapse sessions: admits at most one running
/// session and manages the finished ones on disk.
pub struct TimelapseRegistry {
    paths: TimelapsePaths,
    settings: RegistrySettings,
    camera: Arc<CameraManager>,
    clock: Arc<dyn Clock>,
    finalizer: Arc<FinalizationPipeline>,
    active: Mutex<Option<Arc<SessionState>>>,
    finalizing: Mutex<HashSet<String>>,
    confirmations: ConfirmBroker<ManageAction>,
    recovered: Vec<Recovered>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TimelapseRegistry {
    /// Prepares the directory layout and deals with sessions left in
    /// `active/` by an unclean shutdown before anything can be admitted.
    pub fn open(
        settings: RegistrySettings,
        camera: Arc<CameraManager>,
        clock: Arc<dyn Clock>,
        finalizer: Arc<FinalizationPipeline>,
    ) -> Result<Arc<Self>, AppError> {
        let open_start = Instant::now();
        let paths = TimelapsePaths::new(&settings.root);
        paths.ensure()?;
        let recovered = recover_interrupted(&paths, settings.incomplete_policy)?;
        info!(
            "✅ Timelapse registry ready at '{}' ({} interrupted session(s) recovered) in {:?}.",
            paths.root.display(),
            recovered.len(),
            open_start.elapsed()
        );

        Ok(Arc::new(TimelapseRegistry {
            confirmations: ConfirmBroker::new(settings.confirm_timeout),
            paths,
            settings,
            camera,
            clock,
            finalizer,
            active: Mutex::new(None),
            finalizing: Mutex::new(HashSet::new()),
            recovered,
        }))
    }

    pub fn paths(&self) -> &TimelapsePaths {
        &self.paths
    }

    pub fn camera(&self) -> &Arc<CameraManager> {
        &self.camera
    }

    /// Sessions found interrupted when the registry was opened.
    pub fn recovered(&self) -> &[Recovered] {
        &self.recovered
    }

    pub fn active_name(&self) -> Option<String> {
        lock(&self.active).as_ref().map(|state| state.name().to_string())
    }

    /// Whether a session is capturing or still being finalized.
    pub fn is_busy(&self) -> bool {
        lock(&self.active).is_some() || !lock(&self.finalizing).is_empty()
    }

    /// Starts `count` frames `interval_secs` apart.
    pub async fn start(self: &Arc<Self>, name: &str, interval_secs: f64, count: u32) -> Result<SessionHandle, AppError> {
        if !interval_secs.is_finite() || interval_secs < 0.0 {
            return Err(AppError::InvalidRequest(format!(
                "interval must be a non-negative number of seconds, got {}",
                interval_secs
            )));
        }
        let interval = Duration::try_from_secs_f64(interval_secs)
            .map_err(|e| AppError::InvalidRequest(format!("interval {} is out of range: {}", interval_secs, e)))?;
        self.start_with_schedule(name, Schedule::every(interval, count)).await
    }

    pub async fn start_with_schedule(self: &Arc<Self>, name: &str, schedule: Schedule) -> Result<SessionHandle, AppError> {
        validate_session_name(name)?;
        let count = schedule.count();
        if count == 0 {
            return Err(AppError::InvalidRequest("count must be at least 1".to_string()));
        }
        if count > self.settings.max_count {
            return Err(AppError::InvalidRequest(format!(
                "count {} exceeds the limit of {}",
                count, self.settings.max_count
            )));
        }
        if schedule.checked_span().is_none() {
            return Err(AppError::InvalidRequest(format!(
                "{} frames at that interval would not finish in any representable time",
                count
            )));
        }

        let (state, lease, dir) = {
            let mut slot = lock(&self.active);
            if slot.is_some() {
                return Err(AppError::AlreadyActive);
            }
            if self.paths.is_taken(name) || lock(&self.finalizing).contains(name) {
                return Err(AppError::NameExists(name.to_string()));
            }
            let lease = self.camera.try_lease().ok_or(AppError::AlreadyActive)?;
            let dir = self.paths.active.join(name);
            fs::create_dir(&dir).map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => AppError::NameExists(name.to_string()),
                _ => AppError::Io(format!("failed to create '{}': {}", dir.display(), e)),
            })?;
            if let Err(e) = fs::create_dir(dir.join(FRAMES_DIR)) {
                let _ = fs::remove_dir_all(&dir);
                return Err(e.into());
            }
            let state = Arc::new(SessionState::new(name.to_string(), schedule, self.clock.wall_clock()));
            *slot = Some(Arc::clone(&state));
            (state, lease, dir)
        };

        // Read under the lease so a concurrent set_params cannot change it.
        let camera_metadata = self.camera.metadata().await;
        let metadata = SessionMetadata::new(name, state.start_time(), state.schedule(), camera_metadata);
        let store = match FrameStore::create(dir.clone(), metadata).await {
            Ok(store) => store,
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                self.release(&state, lease);
                return Err(e);
            }
        };

        info!(
            "🎬 Timelapse '{}' started: {} frames, ETA {}.",
            name,
            count,
            crate::common::timestamp_utils::format_eta(state.total_span())
        );
        let registry = Arc::clone(self);
        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move { registry.drive_session(task_state, store, lease).await });
        Ok(SessionHandle::new(state, task))
    }

    /// Clears the active slot if it still holds `state`.
    fn release(&self, state: &Arc<SessionState>, lease: CaptureLease) {
        drop(lease);
        let mut slot = lock(&self.active);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, state)) {
            *slot = None;
        }
    }

    async fn drive_session(self: Arc<Self>, state: Arc<SessionState>, store: FrameStore, lease: CaptureLease) -> SessionOutcome {
        let name = state.name().to_string();
        let session_dir = store.dir().to_path_buf();
        let scheduler = CaptureScheduler::new(
            Arc::clone(&state),
            Arc::clone(&self.camera),
            store,
            Arc::clone(&self.clock),
            self.settings.poll_quantum,
        );
        let outcome = match tokio::spawn(scheduler.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                state.deactivate();
                let _ = fs::remove_dir_all(&session_dir);
                CaptureOutcome::Failed(AppError::Unexpected(format!("capture task ended abnormally: {}", e)))
            }
        };

        match outcome {
            CaptureOutcome::Completed => {
                let frames = state.snapshot().captured;
                let moved = {
                    let source = session_dir.clone();
                    let finished = self.paths.finished.clone();
                    task::spawn_blocking(move || move_into_unique(&source, &finished)).await
                };
                let finished_dir = match moved {
                    Ok(Ok(dir)) => dir,
                    Ok(Err(e)) => return self.fail_after_capture(&state, lease, e.to_string()).await,
                    Err(e) => return self.fail_after_capture(&state, lease, e.to_string()).await,
                };
                lock(&self.finalizing).insert(name.clone());
                self.release(&state, lease);

                let report = Arc::clone(&self.finalizer)
                    .run_guarded(name.clone(), finished_dir, self.paths.root.clone(), frames)
                    .await;
                lock(&self.finalizing).remove(&name);
                match report {
                    Ok(report) => SessionOutcome::Completed(report),
                    Err(reason) => SessionOutcome::Failed(reason),
                }
            }
            CaptureOutcome::Canceled => {
                self.release(&state, lease);
                self.finalizer.deliver(Notification::Canceled { name }).await;
                SessionOutcome::Canceled
            }
            CaptureOutcome::Failed(e) => {
                self.release(&state, lease);
                let reason = e.to_string();
                self.finalizer
                    .deliver(Notification::Failed {
                        name,
                        reason: reason.clone(),
                    })
                    .await;
                SessionOutcome::Failed(reason)
            }
        }
    }

    async fn fail_after_capture(&self, state: &Arc<SessionState>, lease: CaptureLease, reason: String) -> SessionOutcome {
        let reason = format!("could not move captured frames to finished: {}", reason);
        error!("❌ Timelapse '{}': {}", state.name(), reason);
        self.release(state, lease);
        self.finalizer
            .deliver(Notification::Failed {
                name: state.name().to_string(),
                reason: reason.clone(),
            })
            .await;
        SessionOutcome::Failed(reason)
    }

    /// Asks the running session to stop. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(state) => {
                let was_active = state.deactivate();
                if was_active {
                    info!("🛑 Cancel requested for timelapse '{}'.", state.name());
                }
                was_active
            }
            None => false,
        }
    }

    pub fn progress(&self) -> Result<ProgressSnapshot, AppError> {
        lock(&self.active)
            .as_ref()
            .map(|state| state.snapshot())
            .ok_or(AppError::NoActiveSession)
    }

    /// Finished sessions, sorted by name.
    pub fn list(&self) -> Result<Vec<String>, AppError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.paths.finished)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn list_page(&self, page: usize) -> Result<Page, AppError> {
        let names = self.list()?;
        let total_pages = names.len().div_ceil(PAGE_SIZE).max(1);
        let items = names.into_iter().skip(page * PAGE_SIZE).take(PAGE_SIZE).collect();
        Ok(Page {
            items,
            page,
            total_pages,
        })
    }

    /// Finished session names containing `query`, ignoring case.
    pub fn autocomplete(&self, query: &str) -> Vec<String> {
        let needle = query.to_lowercase();
        match self.list() {
            Ok(names) => names
                .into_iter()
                .filter(|name| name.to_lowercase().contains(&needle))
                .take(AUTOCOMPLETE_LIMIT)
                .collect(),
            Err(e) => {
                debug!("Autocomplete listing failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Zips a finished session in memory.
    pub async fn archive_bytes(&self, name: &str) -> Result<Vec<u8>, AppError> {
        let dir = self.finished_dir(name)?;
        archive::archive_to_bytes(dir).await
    }

    fn finished_dir(&self, name: &str) -> Result<PathBuf, AppError> {
        validate_session_name(name)?;
        let dir = self.paths.finished.join(name);
        if !dir.is_dir() {
            return Err(AppError::NotFound(format!("no finished timelapse named '{}'", name)));
        }
        Ok(dir)
    }

    fn ensure_manageable(&self, name: &str) -> Result<PathBuf, AppError> {
        if self.active_name().as_deref() == Some(name) {
            return Err(AppError::InvalidRequest(format!("'{}' is still running", name)));
        }
        if lock(&self.finalizing).contains(name) {
            return Err(AppError::InvalidRequest(format!("'{}' is still being finalized", name)));
        }
        self.finished_dir(name)
    }

    fn ensure_free(&self, name: &str) -> Result<(), AppError> {
        validate_session_name(name)?;
        if self.paths.is_taken(name)
            || self.active_name().as_deref() == Some(name)
            || lock(&self.finalizing).contains(name)
        {
            return Err(AppError::NameExists(name.to_string()));
        }
        Ok(())
    }

    pub fn propose_delete(&self, name: &str) -> Result<Proposal, AppError> {
        self.ensure_manageable(name)?;
        Ok(self.confirmations.propose(ManageAction::Delete { name: name.to_string() }))
    }

    pub fn propose_rename(&self, name: &str, new_name: &str) -> Result<Proposal, AppError> {
        self.ensure_manageable(name)?;
        self.ensure_free(new_name)?;
        Ok(self.confirmations.propose(ManageAction::Rename {
            from: name.to_string(),
            to: new_name.to_string(),
        }))
    }

    /// Answers a pending delete or rename. Nothing changes on disk unless
    /// `accepted` is true and the proposal has not lapsed.
    pub async fn confirm(&self, token: u64, accepted: bool) -> Result<ConfirmOutcome, AppError> {
        let Some(action) = self.confirmations.confirm(token, accepted)? else {
            return Ok(ConfirmOutcome::Declined);
        };

        match action {
            ManageAction::Delete { name } => {
                let dir = self.ensure_manageable(&name)?;
                let stale_archive = self.paths.root.join(format!("{}.zip", name));
                task::spawn_blocking(move || -> io::Result<()> {
                    fs::remove_dir_all(&dir)?;
                    if stale_archive.is_file() {
                        fs::remove_file(&stale_archive)?;
                    }
                    Ok(())
                })
                .await
                .map_err(|e| AppError::Unexpected(format!("delete task failed: {}", e)))??;
                info!("🗑️ Deleted timelapse '{}'.", name);
                Ok(ConfirmOutcome::Deleted(name))
            }
            ManageAction::Rename { from, to } => {
                let source = self.ensure_manageable(&from)?;
                self.ensure_free(&to)?;
                let target = self.paths.finished.join(&to);
                rename_no_clobber(&source, &target).await?;
                let old_archive = self.paths.root.join(format!("{}.zip", from));
                if old_archive.is_file() {
                    let new_archive = self.paths.root.join(format!("{}.zip", to));
                    rename_no_clobber(&old_archive, &new_archive).await?;
                    debug!("Moved leftover archive to '{}'.", new_archive.display());
                }
                info!("✏️ Renamed timelapse '{}' to '{}'.", from, to);
                Ok(ConfirmOutcome::Renamed { from, to })
            }
        }
    }
}

async fn rename_no_clobber(source: &Path, target: &Path) -> Result<(), AppError> {
    let (source, target) = (source.to_path_buf(), target.to_path_buf());
    task::spawn_blocking(move || -> Result<(), AppError> {
        if target.exists() {
            return Err(AppError::NameExists(
                target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ));
        }
        fs::rename(&source, &target)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Unexpected(format!("rename task failed: {}", e)))?
}

/// Moves (or deletes) every directory left in `active/`.
fn recover_interrupted(paths: &TimelapsePaths, policy: IncompletePolicy) -> Result<Vec<Recovered>, AppError> {
    let mut recovered = Vec::new();
    for entry in fs::read_dir(&paths.active)? {
        let entry = entry?;
        let source = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        match policy {
            IncompletePolicy::Relocate => {
                let to = move_into_unique(&source, &paths.incomplete)?;
                warn!("⚠️ Interrupted timelapse '{}' moved to '{}'.", name, to.display());
                recovered.push(Recovered::Relocated { name, to });
            }
            IncompletePolicy::Delete => {
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(&source)?;
                } else {
                    fs::remove_file(&source)?;
                }
                warn!("⚠️ Interrupted timelapse '{}' deleted.", name);
                recovered.push(Recovered::Deleted { name });
            }
        }
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated_camera::SimulatedCamera;
    use crate::notify::ChannelNotifier;
    use crate::timelapse::clock::ManualClock;

    fn registry(root: &Path, policy: IncompletePolicy) -> Arc<TimelapseRegistry> {
        let (notifier, _rx) = ChannelNotifier::new();
        let settings = FinalizeSettings {
            encode_video: false,
            video_fps: 24,
            video_extension: "mp4".into(),
            attachment_limit: 1024,
            folder_id: String::new(),
            folder_link: None,
        };
        let finalizer = FinalizationPipeline::new(None, None, Arc::new(notifier), settings);
        TimelapseRegistry::open(
            RegistrySettings {
                root: root.to_path_buf(),
                poll_quantum: Duration::from_millis(100),
                incomplete_policy: policy,
                confirm_timeout: Duration::from_secs(180),
                max_count: 1000,
            },
            Arc::new(CameraManager::with_source(Box::new(SimulatedCamera::new(10)))),
            Arc::new(ManualClock::new()),
            Arc::new(finalizer),
        )
        .unwrap()
    }

    #[test]
    fn leftover_active_sessions_are_relocated() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("active/t1/frames")).unwrap();
        fs::create_dir_all(root.path().join("incomplete/t1")).unwrap();

        let registry = registry(root.path(), IncompletePolicy::Relocate);

        assert_eq!(fs::read_dir(root.path().join("active")).unwrap().count(), 0);
        match &registry.recovered()[0] {
            Recovered::Relocated { name, to } => {
                assert_eq!(name, "t1");
                assert!(to.join("frames").is_dir());
                assert_ne!(to, &root.path().join("incomplete/t1"));
            }
            other => panic!("unexpected recovery {:?}", other),
        }
    }

    #[test]
    fn leftover_active_sessions_can_be_deleted() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("active/t1/frames")).unwrap();
        let registry = registry(root.path(), IncompletePolicy::Delete);
        assert_eq!(registry.recovered(), &[Recovered::Deleted { name: "t1".into() }]);
        assert!(!root.path().join("incomplete/t1").exists());
    }

    #[tokio::test]
    async fn start_validates_request() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), IncompletePolicy::Relocate);
        assert!(matches!(registry.start("a/b", 1.0, 3).await, Err(AppError::InvalidName { .. })));
        assert!(matches!(registry.start("t1", -1.0, 3).await, Err(AppError::InvalidRequest(_))));
        assert!(matches!(registry.start("t1", 1.0, 0).await, Err(AppError::InvalidRequest(_))));
        assert!(matches!(registry.start("t1", 1.0, 1001).await, Err(AppError::InvalidRequest(_))));
        assert!(matches!(registry.start("big", 1e19, 3).await, Err(AppError::InvalidRequest(_))));
        assert_eq!(fs::read_dir(root.path().join("active")).unwrap().count(), 0);
        assert!(registry.active_name().is_none());
        assert!(matches!(registry.progress(), Err(AppError::NoActiveSession)));
    }

    #[tokio::test]
    async fn name_taken_by_finished_or_incomplete_session() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), IncompletePolicy::Relocate);
        fs::create_dir_all(root.path().join("finished/done")).unwrap();
        fs::create_dir_all(root.path().join("incomplete/broken")).unwrap();
        assert!(matches!(registry.start("done", 1.0, 1).await, Err(AppError::NameExists(_))));
        assert!(matches!(registry.start("broken", 1.0, 1).await, Err(AppError::NameExists(_))));
    }

    #[tokio::test]
    async fn listing_pages_and_autocomplete() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), IncompletePolicy::Relocate);
        for i in 0..30 {
            fs::create_dir_all(root.path().join(format!("finished/Plant-{:02}", i))).unwrap();
        }
        fs::create_dir_all(root.path().join("finished/sunset")).unwrap();
        fs::write(root.path().join("finished/stray.txt"), b"").unwrap();

        let first = registry.list_page(0).unwrap();
        assert_eq!(first.items.len(), PAGE_SIZE);
        assert_eq!(first.items[0], "Plant-00");
        assert_eq!(first.total_pages, 4);
        assert_eq!(registry.list_page(3).unwrap().items, vec!["sunset"]);
        assert!(registry.list_page(9).unwrap().items.is_empty());

        assert_eq!(registry.autocomplete("plant").len(), AUTOCOMPLETE_LIMIT);
        assert_eq!(registry.autocomplete("SUN"), vec!["sunset"]);
    }

    #[tokio::test]
    async fn rename_requires_confirmation() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), IncompletePolicy::Relocate);
        fs::create_dir_all(root.path().join("finished/t1/frames")).unwrap();
        fs::create_dir_all(root.path().join("finished/t2")).unwrap();

        assert!(matches!(registry.propose_rename("t1", "t2"), Err(AppError::NameExists(_))));
        assert!(matches!(registry.propose_rename("nope", "t3"), Err(AppError::NotFound(_))));

        let declined = registry.propose_rename("t1", "t3").unwrap();
        assert_eq!(registry.confirm(declined.token, false).await.unwrap(), ConfirmOutcome::Declined);
        assert!(root.path().join("finished/t1").exists());

        let accepted = registry.propose_rename("t1", "t3").unwrap();
        assert_eq!(
            registry.confirm(accepted.token, true).await.unwrap(),
            ConfirmOutcome::Renamed {
                from: "t1".into(),
                to: "t3".into()
            }
        );
        assert!(!root.path().join("finished/t1").exists());
        assert!(root.path().join("finished/t3/frames").is_dir());
    }

    #[tokio::test]
    async fn rename_carries_leftover_archive() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), IncompletePolicy::Relocate);
        fs::create_dir_all(root.path().join("finished/t1")).unwrap();
        fs::write(root.path().join("t1.zip"), b"PK").unwrap();

        let proposal = registry.propose_rename("t1", "t2").unwrap();
        registry.confirm(proposal.token, true).await.unwrap();
        assert!(!root.path().join("t1.zip").exists());
        assert_eq!(fs::read(root.path().join("t2.zip")).unwrap(), b"PK");
    }

    #[tokio::test]
    async fn running_session_records_camera_and_blocks_changes() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), IncompletePolicy::Relocate);
        let handle = registry.start("t1", 1e6, 2).await.unwrap();
        let recorded = crate::timelapse::frame_store::read_metadata(&root.path().join("active/t1")).unwrap();
        assert_eq!(recorded.camera, registry.camera().metadata().await);
        let params = crate::core::capture_source::CameraParams {
            width: Some(32),
            ..Default::default()
        };
        assert!(registry.camera().set_params(&params).await.is_err());
        assert!(registry.is_busy());
        assert!(registry.cancel());
        assert!(matches!(handle.wait().await, SessionOutcome::Canceled));
        assert!(!registry.is_busy());
    }

    #[tokio::test]
    async fn archive_bytes_of_missing_session_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), IncompletePolicy::Relocate);
        assert!(matches!(registry.archive_bytes("ghost").await, Err(AppError::NotFound(_))));
    }
}
