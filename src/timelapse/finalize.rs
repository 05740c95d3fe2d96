use crate::errors::AppError;
use crate::notify::{Notification, Notifier, Stage, VideoDelivery};
use crate::timelapse::archive;
use crate::timelapse::encoder::VideoEncoder;
use crate::upload::Uploader;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Result of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult<T> {
    Done(T),
    Skipped(String),
    Failed(String),
}

impl<T> StageResult<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, StageResult::Done(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageResult::Failed(_))
    }

    pub fn done(&self) -> Option<&T> {
        match self {
            StageResult::Done(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinalizeReport {
    pub name: String,
    pub session_dir: PathBuf,
    pub frames: u32,
    pub video: StageResult<PathBuf>,
    pub archive: StageResult<PathBuf>,
    pub upload: StageResult<()>,
    pub notified: bool,
}

#[derive(Debug, Clone)]
pub struct FinalizeSettings {
    pub encode_video: bool,
    pub video_fps: u32,
    pub video_extension: String,
    /// Videos up to this size are attached to the completion notice.
    pub attachment_limit: u64,
    pub folder_id: String,
    pub folder_link: Option<String>,
}

/// Encode, archive, upload and notify, in that order, after a session has
/// captured all of its frames. No stage deletes frames.
pub struct FinalizationPipeline {
    encoder: Option<Arc<dyn VideoEncoder>>,
    uploader: Option<Arc<dyn Uploader>>,
    notifier: Arc<dyn Notifier>,
    settings: FinalizeSettings,
}

impl FinalizationPipeline {
    pub fn new(
        encoder: Option<Arc<dyn VideoEncoder>>,
        uploader: Option<Arc<dyn Uploader>>,
        notifier: Arc<dyn Notifier>,
        settings: FinalizeSettings,
    ) -> Self {
        FinalizationPipeline {
            encoder,
            uploader,
            notifier,
            settings,
        }
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Runs the pipeline on its own task so that a panic in any stage is
    /// contained and reported as a session failure.
    pub async fn run_guarded(
        self: Arc<Self>,
        name: String,
        session_dir: PathBuf,
        archive_dir: PathBuf,
        frames: u32,
    ) -> Result<FinalizeReport, String> {
        let pipeline = Arc::clone(&self);
        let task_name = name.clone();
        let outcome =
            tokio::spawn(async move { pipeline.run(&task_name, &session_dir, &archive_dir, frames).await }).await;
        match outcome {
            Ok(report) => Ok(report),
            Err(e) => {
                let reason = format!("finalization aborted: {}", e);
                error!("❌ Timelapse '{}': {}", name, reason);
                self.deliver(Notification::Failed {
                    name,
                    reason: reason.clone(),
                })
                .await;
                Err(reason)
            }
        }
    }

    pub async fn run(&self, name: &str, session_dir: &Path, archive_dir: &Path, frames: u32) -> FinalizeReport {
        let start = Instant::now();
        info!("🏁 Finalizing timelapse '{}' ({} frames)...", name, frames);

        let video = self.encode_stage(session_dir).await;
        if let StageResult::Failed(reason) = &video {
            self.report_stage_failure(name, Stage::Encode, reason, session_dir).await;
        }

        let archive_path = archive_dir.join(format!("{}.zip", name));
        let archive = match archive::archive_to_file(session_dir.to_path_buf(), archive_path.clone()).await {
            Ok(size) => {
                debug!("Archive for '{}' is {} bytes.", name, size);
                StageResult::Done(archive_path)
            }
            Err(e) => StageResult::Failed(e.to_string()),
        };
        if let StageResult::Failed(reason) = &archive {
            self.report_stage_failure(name, Stage::Archive, reason, session_dir).await;
        }

        let upload = self.upload_stage(name, &video, &archive).await;
        if let StageResult::Failed(reason) = &upload {
            let retained = archive.done().cloned().unwrap_or_else(|| session_dir.to_path_buf());
            self.report_stage_failure(name, Stage::Upload, reason, &retained).await;
        }

        let video_delivery = self.delivery_for(&video, &upload).await;
        let folder_link = if upload.is_done() {
            self.settings.folder_link.clone()
        } else {
            None
        };
        let notified = self
            .deliver(Notification::Finished {
                name: name.to_string(),
                frames,
                video: video_delivery,
                folder_link,
                location: session_dir.to_path_buf(),
            })
            .await;

        info!("✅ Finalized timelapse '{}' in {:?}.", name, start.elapsed());
        FinalizeReport {
            name: name.to_string(),
            session_dir: session_dir.to_path_buf(),
            frames,
            video,
            archive,
            upload,
            notified,
        }
    }

    async fn encode_stage(&self, session_dir: &Path) -> StageResult<PathBuf> {
        let encoder = match &self.encoder {
            Some(encoder) if self.settings.encode_video => encoder,
            _ => return StageResult::Skipped("video encoding disabled".to_string()),
        };
        let output = session_dir.join(format!("timelapse.{}", self.settings.video_extension));
        match encoder.encode(session_dir, &output, self.settings.video_fps).await {
            Ok(()) => StageResult::Done(output),
            Err(e) => StageResult::Failed(e.to_string()),
        }
    }

    async fn upload_stage(
        &self,
        name: &str,
        video: &StageResult<PathBuf>,
        archive: &StageResult<PathBuf>,
    ) -> StageResult<()> {
        let Some(uploader) = &self.uploader else {
            return StageResult::Skipped("uploads disabled".to_string());
        };
        if video.is_failed() {
            return StageResult::Skipped("video encoding failed".to_string());
        }
        let Some(archive_path) = archive.done() else {
            return StageResult::Skipped("no archive to upload".to_string());
        };

        let data = match tokio::fs::read(archive_path).await {
            Ok(data) => data,
            Err(e) => return StageResult::Failed(AppError::from(e).to_string()),
        };
        match uploader
            .upload(&format!("{}.zip", name), &self.settings.folder_id, data)
            .await
        {
            Ok(()) => {
                if let Err(e) = tokio::fs::remove_file(archive_path).await {
                    warn!("⚠️ Uploaded archive '{}' could not be removed: {}", archive_path.display(), e);
                }
                StageResult::Done(())
            }
            Err(e) => StageResult::Failed(e.to_string()),
        }
    }

    async fn delivery_for(&self, video: &StageResult<PathBuf>, upload: &StageResult<()>) -> Option<VideoDelivery> {
        let path = video.done()?;
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("⚠️ Encoded video '{}' is unreadable: {}", path.display(), e);
                return None;
            }
        };
        if size <= self.settings.attachment_limit {
            return Some(VideoDelivery::Attached {
                path: path.clone(),
                size,
            });
        }
        match (&self.settings.folder_link, upload.is_done()) {
            (Some(link), true) => Some(VideoDelivery::Linked {
                link: link.clone(),
                size,
            }),
            _ => Some(VideoDelivery::LocalOnly {
                path: path.clone(),
                size,
            }),
        }
    }

    async fn report_stage_failure(&self, name: &str, stage: Stage, reason: &str, retained: &Path) {
        error!("❌ Timelapse '{}': {} failed: {}", name, stage, reason);
        self.deliver(Notification::StageFailed {
            name: name.to_string(),
            stage,
            reason: reason.to_string(),
            retained: retained.to_path_buf(),
        })
        .await;
    }

    /// Sends a notification; failures are logged, never propagated.
    pub async fn deliver(&self, notification: Notification) -> bool {
        match self.notifier.notify(notification).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to deliver notification: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct FakeEncoder {
        fail: bool,
        video_bytes: usize,
    }

    #[async_trait]
    impl VideoEncoder for FakeEncoder {
        async fn encode(&self, _session_dir: &Path, output: &Path, _fps: u32) -> Result<(), AppError> {
            if self.fail {
                return Err(AppError::EncodeFailure("ffmpeg exited with 1".into()));
            }
            fs::write(output, vec![0u8; self.video_bytes])?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        fail: bool,
        uploads: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        fn describe(&self) -> String {
            "recording".into()
        }

        async fn upload(&self, filename: &str, folder_id: &str, data: Vec<u8>) -> Result<(), AppError> {
            if self.fail {
                return Err(AppError::UploadFailure("connection reset".into()));
            }
            self.uploads
                .lock()
                .unwrap()
                .push((filename.to_string(), folder_id.to_string(), data.len()));
            Ok(())
        }
    }

    struct PanickingEncoder;

    #[async_trait]
    impl VideoEncoder for PanickingEncoder {
        async fn encode(&self, _session_dir: &Path, _output: &Path, _fps: u32) -> Result<(), AppError> {
            panic!("encoder bug");
        }
    }

    fn settings(limit: u64) -> FinalizeSettings {
        FinalizeSettings {
            encode_video: true,
            video_fps: 24,
            video_extension: "mp4".into(),
            attachment_limit: limit,
            folder_id: "folder123".into(),
            folder_link: Some("https://drive.google.com/drive/folders/folder123?usp=sharing".into()),
        }
    }

    fn session(root: &Path) -> PathBuf {
        let dir = root.join("finished").join("t1");
        fs::create_dir_all(dir.join("frames")).unwrap();
        fs::write(dir.join("metadata.json"), b"{}").unwrap();
        fs::write(dir.join("frames/000000.png"), b"png").unwrap();
        dir
    }

    fn pipeline(
        encoder: Arc<dyn VideoEncoder>,
        uploader: Arc<RecordingUploader>,
        limit: u64,
    ) -> (FinalizationPipeline, UnboundedReceiver<Notification>) {
        let (notifier, rx) = ChannelNotifier::new();
        let pipeline = FinalizationPipeline::new(Some(encoder), Some(uploader), Arc::new(notifier), settings(limit));
        (pipeline, rx)
    }

    #[tokio::test]
    async fn small_video_is_attached_and_archive_removed_after_upload() {
        let root = tempfile::tempdir().unwrap();
        let dir = session(root.path());
        let uploader = Arc::new(RecordingUploader::default());
        let encoder = Arc::new(FakeEncoder { fail: false, video_bytes: 10 });
        let (pipeline, mut rx) = pipeline(encoder, uploader.clone(), 1024);

        let report = pipeline.run("t1", &dir, root.path(), 1).await;

        assert!(report.video.is_done() && report.upload.is_done() && report.notified);
        assert!(!root.path().join("t1.zip").exists());
        assert_eq!(uploader.uploads.lock().unwrap()[0].0, "t1.zip");
        match rx.recv().await.unwrap() {
            Notification::Finished { video, folder_link, .. } => {
                assert!(matches!(video, Some(VideoDelivery::Attached { size: 10, .. })));
                assert!(folder_link.is_some());
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn large_video_is_linked() {
        let root = tempfile::tempdir().unwrap();
        let dir = session(root.path());
        let encoder = Arc::new(FakeEncoder { fail: false, video_bytes: 4096 });
        let (pipeline, mut rx) = pipeline(encoder, Arc::new(RecordingUploader::default()), 1024);

        pipeline.run("t1", &dir, root.path(), 1).await;
        match rx.recv().await.unwrap() {
            Notification::Finished { video, .. } => {
                assert!(matches!(video, Some(VideoDelivery::Linked { size: 4096, .. })))
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn encode_failure_skips_upload_and_keeps_frames() {
        let root = tempfile::tempdir().unwrap();
        let dir = session(root.path());
        let uploader = Arc::new(RecordingUploader::default());
        let encoder = Arc::new(FakeEncoder { fail: true, video_bytes: 0 });
        let (pipeline, mut rx) = pipeline(encoder, uploader.clone(), 1024);

        let report = pipeline.run("t1", &dir, root.path(), 1).await;

        assert!(report.video.is_failed());
        assert!(report.archive.is_done());
        assert!(matches!(report.upload, StageResult::Skipped(_)));
        assert!(uploader.uploads.lock().unwrap().is_empty());
        assert!(dir.join("frames/000000.png").exists());
        assert!(root.path().join("t1.zip").exists());
        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::StageFailed { stage: Stage::Encode, .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), Notification::Finished { video: None, .. }));
    }

    #[tokio::test]
    async fn upload_failure_keeps_archive() {
        let root = tempfile::tempdir().unwrap();
        let dir = session(root.path());
        let uploader = Arc::new(RecordingUploader {
            fail: true,
            ..Default::default()
        });
        let encoder = Arc::new(FakeEncoder { fail: false, video_bytes: 4096 });
        let (pipeline, mut rx) = pipeline(encoder, uploader, 1024);

        let report = pipeline.run("t1", &dir, root.path(), 1).await;

        assert!(report.upload.is_failed());
        assert!(root.path().join("t1.zip").exists());
        match rx.recv().await.unwrap() {
            Notification::StageFailed { stage, retained, .. } => {
                assert_eq!(stage, Stage::Upload);
                assert_eq!(retained, root.path().join("t1.zip"));
            }
            other => panic!("unexpected notification {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Notification::Finished { video, folder_link, .. } => {
                assert!(matches!(video, Some(VideoDelivery::LocalOnly { .. })));
                assert!(folder_link.is_none());
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn panic_in_a_stage_is_reported_as_failure() {
        let root = tempfile::tempdir().unwrap();
        let dir = session(root.path());
        let (pipeline, mut rx) = pipeline(Arc::new(PanickingEncoder), Arc::new(RecordingUploader::default()), 1024);

        let result = Arc::new(pipeline)
            .run_guarded("t1".into(), dir.clone(), root.path().to_path_buf(), 1)
            .await;

        assert!(result.is_err());
        assert!(dir.join("frames/000000.png").exists());
        assert!(matches!(rx.recv().await.unwrap(), Notification::Failed { .. }));
    }
}
