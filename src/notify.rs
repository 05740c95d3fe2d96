use crate::errors::AppError;
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info, warn};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Post-capture pipeline steps that can fail on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Encode,
    Archive,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Encode => "video encoding",
            Stage::Archive => "archiving",
            Stage::Upload => "upload",
        };
        f.write_str(label)
    }
}

/// How the encoded video reaches the requester.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoDelivery {
    /// Small enough to travel with the message.
    Attached { path: PathBuf, size: u64 },
    /// Too large to attach; reachable through the upload destination.
    Linked { link: String, size: u64 },
    /// Too large to attach and nothing was uploaded.
    LocalOnly { path: PathBuf, size: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Finished {
        name: String,
        frames: u32,
        video: Option<VideoDelivery>,
        /// Set when the archive reached the upload destination.
        folder_link: Option<String>,
        location: PathBuf,
    },
    StageFailed {
        name: String,
        stage: Stage,
        reason: String,
        retained: PathBuf,
    },
    Canceled {
        name: String,
    },
    Failed {
        name: String,
        reason: String,
    },
}

impl Notification {
    pub fn name(&self) -> &str {
        match self {
            Notification::Finished { name, .. }
            | Notification::StageFailed { name, .. }
            | Notification::Canceled { name }
            | Notification::Failed { name, .. } => name,
        }
    }

    /// File to attach to the message, if any.
    pub fn attachment(&self) -> Option<&PathBuf> {
        match self {
            Notification::Finished {
                video: Some(VideoDelivery::Attached { path, .. }),
                ..
            } => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Finished {
                name,
                frames,
                video,
                folder_link,
                location,
            } => {
                write!(f, "'{}' timelapse has finished ({} frames)", name, frames)?;
                match folder_link {
                    Some(link) => write!(f, ": {}", link)?,
                    None => write!(f, ", stored at {}", location.display())?,
                }
                match video {
                    Some(VideoDelivery::Attached { .. }) => write!(f, ". Video attached."),
                    Some(VideoDelivery::Linked { link, size }) => {
                        write!(f, ". Video ({:.1} MiB) is too large to attach: {}", mib(*size), link)
                    }
                    Some(VideoDelivery::LocalOnly { path, size }) => write!(
                        f,
                        ". Video ({:.1} MiB) is too large to attach: {}",
                        mib(*size),
                        path.display()
                    ),
                    None => write!(f, "."),
                }
            }
            Notification::StageFailed {
                name,
                stage,
                reason,
                retained,
            } => write!(
                f,
                "Timelapse '{}': {} failed: {}. Local data kept at {}.",
                name,
                stage,
                reason,
                retained.display()
            ),
            Notification::Canceled { name } => write!(f, "Timelapse '{}' was canceled.", name),
            Notification::Failed { name, reason } => {
                write!(f, "An error has occurred with the timelapse '{}': {}", name, reason)
            }
        }
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), AppError>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), AppError> {
        match &notification {
            Notification::Failed { .. } | Notification::StageFailed { .. } => warn!("📣 {}", notification),
            _ => info!("📣 {}", notification),
        }
        Ok(())
    }
}

/// Forwards notifications to an in-process receiver.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelNotifier { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), AppError> {
        self.tx
            .send(notification)
            .map_err(|_| AppError::Unexpected("notification receiver is gone".to_string()))
    }
}

/// Delivers to every inner notifier; reports the first failure after trying all.
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        FanoutNotifier { targets }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), AppError> {
        let deliveries = self.targets.iter().map(|target| target.notify(notification.clone()));
        let mut first_error = None;
        for result in join_all(deliveries).await {
            if let Err(e) = result {
                error!("Notifier failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Posts to a Discord-compatible webhook. Attachable videos are sent as
/// multipart uploads, everything else as a plain JSON message.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(WebhookNotifier {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), AppError> {
        let payload = serde_json::json!({ "content": notification.to_string() });
        let request = match notification.attachment() {
            Some(path) => {
                let bytes = tokio::fs::read(path).await?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "timelapse.mp4".to_string());
                let form = Form::new()
                    .text("payload_json", payload.to_string())
                    .part("files[0]", Part::bytes(bytes).file_name(file_name));
                self.client.post(&self.url).multipart(form)
            }
            None => self.client.post(&self.url).json(&payload),
        };

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Unexpected(format!("webhook request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AppError::Unexpected(format!(
                "webhook rejected notification with {}",
                response.status()
            )));
        }
        debug!("Webhook notified for '{}'.", notification.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_message_prefers_upload_link() {
        let notification = Notification::Finished {
            name: "t1".into(),
            frames: 3,
            video: Some(VideoDelivery::Linked {
                link: "https://drive.google.com/drive/folders/abc?usp=sharing".into(),
                size: 20 * 1024 * 1024,
            }),
            folder_link: Some("https://drive.google.com/drive/folders/abc?usp=sharing".into()),
            location: PathBuf::from("data/timelapses/finished/t1"),
        };
        let text = notification.to_string();
        assert!(text.starts_with("'t1' timelapse has finished (3 frames): https://drive.google.com"));
        assert!(text.contains("Video (20.0 MiB) is too large to attach"));
        assert!(notification.attachment().is_none());
    }

    #[test]
    fn stage_failure_names_retained_data() {
        let notification = Notification::StageFailed {
            name: "t1".into(),
            stage: Stage::Encode,
            reason: "ffmpeg exited with 1".into(),
            retained: PathBuf::from("/data/finished/t1"),
        };
        assert_eq!(
            notification.to_string(),
            "Timelapse 't1': video encoding failed: ffmpeg exited with 1. Local data kept at /data/finished/t1."
        );
    }

    #[tokio::test]
    async fn fanout_reaches_every_target() {
        let (first, mut first_rx) = ChannelNotifier::new();
        let (second, mut second_rx) = ChannelNotifier::new();
        let fanout = FanoutNotifier::new(vec![Arc::new(first), Arc::new(LogNotifier), Arc::new(second)]);
        fanout
            .notify(Notification::Canceled { name: "t1".into() })
            .await
            .unwrap();
        assert_eq!(first_rx.recv().await.unwrap().name(), "t1");
        assert_eq!(second_rx.recv().await.unwrap().name(), "t1");
    }
}
