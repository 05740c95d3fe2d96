use crate::common::file_utils::{write_atomic, write_new_durable};
use crate::core::capture_source::{CameraMetadata, Frame};
use crate::errors::AppError;
use crate::timelapse::scheduler::Schedule;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::task;

pub const METADATA_FILE: &str = "metadata.json";
pub const FRAMES_DIR: &str = "frames";
pub const FRAME_EXTENSION: &str = "png";

/// Contents of `metadata.json`. Describes exactly the frames on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub name: String,
    pub start_time: DateTime<Utc>,
    /// Seconds between frame start times, for evenly spaced sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
    /// Planned capture offsets in seconds, for sessions started from a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timepoints: Option<Vec<f64>>,
    pub target_count: u32,
    /// Capture offset of each stored frame, in seconds since `start_time`.
    pub timestamps: Vec<f64>,
    pub snaps: u32,
    pub camera: CameraMetadata,
    #[serde(default = "default_frame_format")]
    pub frame_format: String,
}

fn default_frame_format() -> String {
    FRAME_EXTENSION.to_string()
}

impl SessionMetadata {
    pub fn new(name: &str, start_time: DateTime<Utc>, schedule: &Schedule, camera: CameraMetadata) -> Self {
        let timepoints = match schedule {
            Schedule::Timepoints(points) => Some(points.iter().map(|p| p.as_secs_f64()).collect()),
            Schedule::Every { .. } => None,
        };
        SessionMetadata {
            name: name.to_string(),
            start_time,
            interval: schedule.interval().map(|i| i.as_secs_f64()),
            timepoints,
            target_count: schedule.count(),
            timestamps: Vec::new(),
            snaps: 0,
            camera,
            frame_format: default_frame_format(),
        }
    }
}

pub fn frame_file_name(index: u32) -> String {
    format!("{:06}.{}", index, FRAME_EXTENSION)
}

/// Incremental persistence for one session directory.
pub struct FrameStore {
    dir: PathBuf,
    metadata: SessionMetadata,
}

impl FrameStore {
    /// Takes over a freshly created session directory and writes the initial,
    /// frame-less metadata record.
    pub async fn create(dir: PathBuf, metadata: SessionMetadata) -> Result<Self, AppError> {
        let store = FrameStore { dir, metadata };
        let bytes = serde_json::to_vec_pretty(&store.metadata)?;
        let path = store.metadata_path();
        task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| AppError::Unexpected(format!("metadata write task failed: {}", e)))??;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn frame_path(&self, index: u32) -> PathBuf {
        self.dir.join(FRAMES_DIR).join(frame_file_name(index))
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Persists frame `index` and then the metadata that accounts for it.
    /// Both are on stable storage when this returns `Ok`; on error the
    /// in-memory record is left unchanged.
    pub async fn write(&mut self, index: u32, frame: Frame, offset_secs: f64) -> Result<(), AppError> {
        let expected = self.metadata.snaps;
        if index != expected {
            return Err(AppError::Unexpected(format!(
                "frame {} written out of order, expected {}",
                index, expected
            )));
        }

        let mut next = self.metadata.clone();
        next.timestamps.push(offset_secs);
        next.snaps += 1;
        let metadata_bytes = serde_json::to_vec_pretty(&next)?;
        let frame_path = self.frame_path(index);
        let metadata_path = self.metadata_path();

        task::spawn_blocking(move || -> Result<(), AppError> {
            let write_start = Instant::now();
            let mut encoded = Cursor::new(Vec::new());
            frame
                .image
                .write_to(&mut encoded, ImageFormat::Png)
                .map_err(|e| AppError::CaptureFailure(format!("failed to encode frame {}: {}", index, e)))?;
            write_new_durable(&frame_path, encoded.get_ref()).map_err(|e| {
                AppError::CaptureFailure(format!("failed to store '{}': {}", frame_path.display(), e))
            })?;
            write_atomic(&metadata_path, &metadata_bytes).map_err(|e| {
                AppError::CaptureFailure(format!("failed to update '{}': {}", metadata_path.display(), e))
            })?;
            debug!("💾 Stored frame {} in {:?}", index, write_start.elapsed());
            Ok(())
        })
        .await
        .map_err(|e| AppError::Unexpected(format!("frame write task failed: {}", e)))??;

        self.metadata = next;
        Ok(())
    }
}

pub fn read_metadata(dir: &Path) -> Result<SessionMetadata, AppError> {
    let path = dir.join(METADATA_FILE);
    let bytes = fs::read(&path).map_err(|e| AppError::Io(format!("failed to read '{}': {}", path.display(), e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Number of frame files in a session directory.
pub fn count_frames(dir: &Path) -> Result<usize, AppError> {
    let frames = dir.join(FRAMES_DIR);
    let mut count = 0;
    for entry in fs::read_dir(&frames)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == FRAME_EXTENSION) {
            count += 1;
        }
    }
    Ok(count)
}
