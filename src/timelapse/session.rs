use crate::common::timestamp_utils::format_eta;
use crate::timelapse::finalize::FinalizeReport;
use crate::timelapse::scheduler::Schedule;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Live record of one timelapse. Written only by its capture task (and the
/// cancel flag); read lock-free by progress queries.
#[derive(Debug)]
pub struct SessionState {
    name: String,
    schedule: Schedule,
    start_time: DateTime<Utc>,
    progress: AtomicU32,
    captured: AtomicU32,
    eta_ms: AtomicU64,
    active: AtomicBool,
}

impl SessionState {
    pub fn new(name: String, schedule: Schedule, start_time: DateTime<Utc>) -> Self {
        let state = SessionState {
            name,
            schedule,
            start_time,
            progress: AtomicU32::new(0),
            captured: AtomicU32::new(0),
            eta_ms: AtomicU64::new(0),
            active: AtomicBool::new(true),
        };
        state.update_eta(Duration::ZERO);
        state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn target_count(&self) -> u32 {
        self.schedule.count()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Clears the active flag. Returns whether it was set.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Nominal offset of the last frame; the session's total wall-clock span.
    pub fn total_span(&self) -> Duration {
        self.schedule.total_span()
    }

    pub(crate) fn begin_frame(&self, index: u32) {
        let target = self.target_count();
        debug_assert!(index < target);
        self.progress.fetch_max(index.min(target), Ordering::SeqCst);
    }

    pub(crate) fn frame_stored(&self, index: u32) {
        let target = self.target_count();
        self.captured
            .fetch_max((index + 1).min(target), Ordering::SeqCst);
    }

    pub(crate) fn update_eta(&self, elapsed: Duration) {
        let remaining = self.total_span().saturating_sub(elapsed);
        self.eta_ms
            .store(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            name: self.name.clone(),
            progress: self.progress.load(Ordering::SeqCst),
            captured: self.captured.load(Ordering::SeqCst),
            target_count: self.target_count(),
            eta: Duration::from_millis(self.eta_ms.load(Ordering::SeqCst)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub name: String,
    /// Index of the most recently started frame.
    pub progress: u32,
    /// Frames durably stored so far.
    pub captured: u32,
    pub target_count: u32,
    pub eta: Duration,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} completed. ETA: {}",
            self.captured,
            self.target_count,
            format_eta(self.eta)
        )
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed(FinalizeReport),
    Canceled,
    Failed(String),
}

/// Returned to the requester when a session is admitted.
#[derive(Debug)]
pub struct SessionHandle {
    state: Arc<SessionState>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub(crate) fn new(state: Arc<SessionState>, task: JoinHandle<SessionOutcome>) -> Self {
        SessionHandle { state, task }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.state.snapshot()
    }

    /// Time left until the last frame is due.
    pub fn eta(&self) -> Duration {
        self.state.snapshot().eta
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the session, including its finalization, to end.
    pub async fn wait(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => SessionOutcome::Failed(format!("session task ended abnormally: {}", e)),
        }
    }
}
