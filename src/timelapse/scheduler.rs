use crate::core::camera_manager::CameraManager;
use crate::errors::AppError;
use crate::timelapse::clock::Clock;
use crate::timelapse::frame_store::FrameStore;
use crate::timelapse::session::SessionState;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;

/// Upper bound on the polling quantum; keeps cancellation latency sub-second.
pub const MAX_POLL_QUANTUM: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStep {
    /// The frame's deadline has been reached.
    Fire,
    Sleep(Duration),
}

/// Decides whether to capture now or sleep, never sleeping past the deadline
/// or longer than one quantum.
pub fn next_wait(elapsed: Duration, deadline: Duration, quantum: Duration) -> WaitStep {
    if elapsed >= deadline {
        WaitStep::Fire
    } else {
        WaitStep::Sleep((deadline - elapsed).min(quantum))
    }
}

/// When each frame of a session is due, as offsets from the session start.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// `count` frames, `interval` apart, the first one immediately.
    Every { interval: Duration, count: u32 },
    /// Explicit offsets, sorted ascending.
    Timepoints(Vec<Duration>),
}

impl Schedule {
    pub fn every(interval: Duration, count: u32) -> Self {
        Schedule::Every { interval, count }
    }

    pub fn timepoints(mut points: Vec<Duration>) -> Self {
        points.sort();
        Schedule::Timepoints(points)
    }

    /// Parses a list of offsets in seconds separated by commas or whitespace,
    /// e.g. the contents of a one-line CSV file.
    pub fn parse_timepoints(text: &str) -> Result<Self, AppError> {
        let mut points = Vec::new();
        for token in text.split(|c: char| c == ',' || c.is_whitespace()).filter(|t| !t.is_empty()) {
            let secs: f64 = token
                .parse()
                .map_err(|_| AppError::InvalidRequest(format!("'{}' is not a number of seconds", token)))?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(AppError::InvalidRequest(format!(
                    "timepoint {} must be a non-negative number of seconds",
                    token
                )));
            }
            let point = Duration::try_from_secs_f64(secs)
                .map_err(|e| AppError::InvalidRequest(format!("timepoint {} is out of range: {}", token, e)))?;
            points.push(point);
        }
        if points.is_empty() {
            return Err(AppError::InvalidRequest("no timepoints given".to_string()));
        }
        Ok(Self::timepoints(points))
    }

    pub fn count(&self) -> u32 {
        match self {
            Schedule::Every { count, .. } => *count,
            Schedule::Timepoints(points) => u32::try_from(points.len()).unwrap_or(u32::MAX),
        }
    }

    /// Nominal start offset of frame `index`.
    pub fn deadline(&self, index: u32) -> Duration {
        match self {
            Schedule::Every { interval, .. } => interval.saturating_mul(index),
            Schedule::Timepoints(points) => points
                .get(index as usize)
                .or(points.last())
                .copied()
                .unwrap_or_default(),
        }
    }

    pub fn total_span(&self) -> Duration {
        self.deadline(self.count().saturating_sub(1))
    }

    /// Like `total_span`, but `None` when the last deadline does not fit in a `Duration`.
    pub fn checked_span(&self) -> Option<Duration> {
        match self {
            Schedule::Every { interval, count } => interval.checked_mul(count.saturating_sub(1)),
            Schedule::Timepoints(_) => Some(self.total_span()),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Every { interval, .. } => Some(*interval),
            Schedule::Timepoints(_) => None,
        }
    }
}

/// How the capture loop ended.
#[derive(Debug)]
pub enum CaptureOutcome {
    Completed,
    Canceled,
    Failed(AppError),
}

#[derive(Debug)]
enum Phase {
    Waiting { index: u32 },
    Capturing { index: u32 },
    Done(CaptureOutcome),
}

/// Drives one session's frame-by-frame timing loop.
pub struct CaptureScheduler {
    state: Arc<SessionState>,
    camera: Arc<CameraManager>,
    store: FrameStore,
    clock: Arc<dyn Clock>,
    quantum: Duration,
}

impl CaptureScheduler {
    pub fn new(
        state: Arc<SessionState>,
        camera: Arc<CameraManager>,
        store: FrameStore,
        clock: Arc<dyn Clock>,
        quantum: Duration,
    ) -> Self {
        CaptureScheduler {
            state,
            camera,
            store,
            clock,
            quantum: quantum.clamp(Duration::from_millis(1), MAX_POLL_QUANTUM),
        }
    }

    /// Runs until every frame is stored, the session is canceled, or a
    /// capture fails. A canceled or failed session's directory is removed
    /// before this returns.
    pub async fn run(mut self) -> CaptureOutcome {
        let name = self.state.name().to_string();
        let target = self.state.target_count();
        let schedule = self.state.schedule().clone();
        let origin = self.clock.now();
        let run_start = Instant::now();
        info!(
            "⏱️ Timelapse '{}': capturing {} frames over {:?}.",
            name,
            target,
            schedule.total_span()
        );

        let mut phase = Phase::Waiting { index: 0 };
        let outcome = loop {
            phase = match phase {
                Phase::Waiting { index } => {
                    if !self.state.is_active() {
                        Phase::Done(CaptureOutcome::Canceled)
                    } else if index >= target {
                        Phase::Done(CaptureOutcome::Completed)
                    } else {
                        let elapsed = self.clock.now().saturating_sub(origin);
                        self.state.update_eta(elapsed);
                        match next_wait(elapsed, schedule.deadline(index), self.quantum) {
                            WaitStep::Fire => Phase::Capturing { index },
                            WaitStep::Sleep(step) => {
                                self.clock.sleep(step).await;
                                Phase::Waiting { index }
                            }
                        }
                    }
                }
                Phase::Capturing { index } => {
                    self.state.begin_frame(index);
                    let offset = self.clock.now().saturating_sub(origin);
                    match self.capture(index, offset).await {
                        Ok(()) => {
                            self.state.frame_stored(index);
                            debug!(
                                "Timelapse '{}': frame {}/{} stored at +{:.3}s.",
                                name,
                                index + 1,
                                target,
                                offset.as_secs_f64()
                            );
                            Phase::Waiting { index: index + 1 }
                        }
                        Err(e) => Phase::Done(CaptureOutcome::Failed(e)),
                    }
                }
                Phase::Done(outcome) => break outcome,
            };
        };

        self.state.deactivate();
        match &outcome {
            CaptureOutcome::Completed => {
                self.state.update_eta(self.state.total_span());
                info!(
                    "✅ Timelapse '{}': all {} frames captured in {:?}.",
                    name,
                    target,
                    run_start.elapsed()
                );
            }
            CaptureOutcome::Canceled => {
                info!("🛑 Timelapse '{}' canceled, discarding partial data.", name);
                discard(self.store.dir().to_path_buf()).await;
            }
            CaptureOutcome::Failed(e) => {
                error!("❌ Timelapse '{}' failed: {}", name, e);
                discard(self.store.dir().to_path_buf()).await;
            }
        }
        outcome
    }

    async fn capture(&mut self, index: u32, offset: Duration) -> Result<(), AppError> {
        let frame = self
            .camera
            .snap()
            .await
            .map_err(|e| AppError::CaptureFailure(format!("frame {}: {:#}", index, e)))?;
        self.store.write(index, frame, offset.as_secs_f64()).await
    }
}

async fn discard(dir: PathBuf) {
    let shown = dir.display().to_string();
    match task::spawn_blocking(move || std::fs::remove_dir_all(&dir)).await {
        Ok(Ok(())) => debug!("🗑️ Removed '{}'.", shown),
        Ok(Err(e)) => warn!("⚠️ Failed to remove '{}': {}", shown, e),
        Err(e) => warn!("⚠️ Cleanup task for '{}' failed: {}", shown, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated_camera::SimulatedCamera;
    use crate::core::capture_source::{CameraMetadata, CameraParams, CameraSource, Frame, StreamSink};
    use crate::timelapse::clock::ManualClock;
    use crate::timelapse::frame_store::{count_frames, read_metadata, SessionMetadata, FRAMES_DIR};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Wraps the simulated camera and fires a hook on a chosen snap.
    struct HookedCamera {
        inner: SimulatedCamera,
        snaps: AtomicU32,
        on_snap: u32,
        hook: Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>,
    }

    #[async_trait]
    impl CameraSource for HookedCamera {
        fn get_type(&self) -> String {
            "hooked".into()
        }
        fn metadata(&self) -> CameraMetadata {
            self.inner.metadata()
        }
        async fn snap(&self) -> anyhow::Result<Frame> {
            if self.snaps.fetch_add(1, Ordering::SeqCst) == self.on_snap {
                (self.hook)()?;
            }
            self.inner.snap().await
        }
        async fn set_params(&mut self, params: &CameraParams) -> anyhow::Result<String> {
            self.inner.set_params(params).await
        }
        async fn start_stream(&self, sink: StreamSink) -> anyhow::Result<()> {
            self.inner.start_stream(sink).await
        }
        async fn stop_stream(&self) -> anyhow::Result<()> {
            self.inner.stop_stream().await
        }
    }

    fn hooked(on_snap: u32, hook: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static) -> Arc<CameraManager> {
        Arc::new(CameraManager::with_source(Box::new(HookedCamera {
            inner: SimulatedCamera::new(10),
            snaps: AtomicU32::new(0),
            on_snap,
            hook: Box::new(hook),
        })))
    }

    async fn scheduler(
        root: &Path,
        state: Arc<SessionState>,
        camera: Arc<CameraManager>,
    ) -> CaptureScheduler {
        let dir = root.join(state.name());
        std::fs::create_dir_all(dir.join(FRAMES_DIR)).unwrap();
        let metadata = SessionMetadata::new(state.name(), Utc::now(), state.schedule(), camera.metadata().await);
        let store = FrameStore::create(dir, metadata).await.unwrap();
        CaptureScheduler::new(
            state,
            camera,
            store,
            Arc::new(ManualClock::new()),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn wait_never_overshoots_deadline() {
        let quantum = Duration::from_millis(100);
        assert_eq!(
            next_wait(Duration::from_millis(950), Duration::from_secs(1), quantum),
            WaitStep::Sleep(Duration::from_millis(50))
        );
        assert_eq!(
            next_wait(Duration::ZERO, Duration::from_secs(5), quantum),
            WaitStep::Sleep(quantum)
        );
        assert_eq!(next_wait(Duration::from_secs(2), Duration::from_secs(1), quantum), WaitStep::Fire);
    }

    #[test]
    fn timepoints_are_sorted_and_validated() {
        let schedule = Schedule::parse_timepoints("5, 0,2.5\n10").unwrap();
        assert_eq!(schedule.count(), 4);
        assert_eq!(schedule.deadline(1), Duration::from_secs(2) + Duration::from_millis(500));
        assert_eq!(schedule.total_span(), Duration::from_secs(10));
        assert!(schedule.interval().is_none());

        assert!(Schedule::parse_timepoints("").is_err());
        assert!(Schedule::parse_timepoints("1, -2").is_err());
        assert!(Schedule::parse_timepoints("1, soon").is_err());
        assert!(matches!(
            Schedule::parse_timepoints("0, 1e30"),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn oversized_interval_span_is_detected() {
        let schedule = Schedule::every(Duration::from_secs(u64::MAX / 2), 4);
        assert_eq!(schedule.checked_span(), None);
        assert_eq!(schedule.deadline(3), Duration::MAX);
        assert_eq!(
            Schedule::every(Duration::from_secs(2), 4).checked_span(),
            Some(Duration::from_secs(6))
        );
    }

    #[tokio::test]
    async fn follows_explicit_timepoints() {
        let root = tempfile::tempdir().unwrap();
        let schedule = Schedule::parse_timepoints("0,0.5,4").unwrap();
        let state = Arc::new(SessionState::new("tp".into(), schedule, Utc::now()));
        let camera = Arc::new(CameraManager::with_source(Box::new(SimulatedCamera::new(10))));
        let outcome = scheduler(root.path(), state, camera).await.run().await;

        assert!(matches!(outcome, CaptureOutcome::Completed));
        let metadata = read_metadata(&root.path().join("tp")).unwrap();
        assert_eq!(metadata.timestamps, vec![0.0, 0.5, 4.0]);
    }

    #[tokio::test]
    async fn captures_on_schedule() {
        let root = tempfile::tempdir().unwrap();
        let state = Arc::new(SessionState::new("t1".into(), Schedule::every(Duration::from_secs(1), 3), Utc::now()));
        let camera = Arc::new(CameraManager::with_source(Box::new(SimulatedCamera::new(10))));
        let outcome = scheduler(root.path(), state.clone(), camera).await.run().await;

        assert!(matches!(outcome, CaptureOutcome::Completed));
        let dir = root.path().join("t1");
        let metadata = read_metadata(&dir).unwrap();
        assert_eq!(count_frames(&dir).unwrap(), 3);
        assert_eq!(metadata.snaps, 3);
        assert_eq!(metadata.timestamps, vec![0.0, 1.0, 2.0]);
        assert!(!state.is_active());
        assert_eq!(state.snapshot().progress, 2);
        assert_eq!(state.snapshot().captured, 3);
    }

    #[tokio::test]
    async fn cancellation_discards_directory() {
        let root = tempfile::tempdir().unwrap();
        let state = Arc::new(SessionState::new("t1".into(), Schedule::every(Duration::from_secs(30), 10), Utc::now()));
        let flag = state.clone();
        let camera = hooked(2, move || {
            flag.deactivate();
            Ok(())
        });
        let outcome = scheduler(root.path(), state.clone(), camera).await.run().await;

        assert!(matches!(outcome, CaptureOutcome::Canceled));
        assert!(!root.path().join("t1").exists());
        // The in-flight capture still completed before the flag was observed.
        assert_eq!(state.snapshot().captured, 3);
    }

    #[tokio::test]
    async fn capture_error_fails_session() {
        let root = tempfile::tempdir().unwrap();
        let state = Arc::new(SessionState::new("t1".into(), Schedule::every(Duration::from_secs(1), 5), Utc::now()));
        let camera = hooked(1, || anyhow::bail!("sensor timeout"));
        let outcome = scheduler(root.path(), state.clone(), camera).await.run().await;

        match outcome {
            CaptureOutcome::Failed(AppError::CaptureFailure(msg)) => assert!(msg.contains("sensor timeout")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!root.path().join("t1").exists());
        assert!(!state.is_active());
        assert_eq!(state.snapshot().captured, 1);
    }

    #[tokio::test]
    async fn zero_interval_fires_back_to_back() {
        let root = tempfile::tempdir().unwrap();
        let state = Arc::new(SessionState::new("burst".into(), Schedule::every(Duration::ZERO, 4), Utc::now()));
        let camera = Arc::new(CameraManager::with_source(Box::new(SimulatedCamera::new(10))));
        let outcome = scheduler(root.path(), state, camera).await.run().await;

        assert!(matches!(outcome, CaptureOutcome::Completed));
        let metadata = read_metadata(&root.path().join("burst")).unwrap();
        assert_eq!(metadata.timestamps, vec![0.0; 4]);
    }
}
