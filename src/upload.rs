use crate::app_config::{UploadBackend, UploadConfig};
use crate::common::file_utils::{ensure_output_directory, write_durable};
use crate::errors::AppError;
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use reqwest::Client;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;

const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files?uploadType=multipart";

/// Sends a finished archive to external storage.
#[async_trait]
pub trait Uploader: Send + Sync {
    fn describe(&self) -> String;

    async fn upload(&self, filename: &str, folder_id: &str, data: Vec<u8>) -> Result<(), AppError>;
}

/// Builds the uploader named in the config; `None` when uploads are disabled.
pub fn from_config(config: &UploadConfig) -> anyhow::Result<Option<Arc<dyn Uploader>>> {
    match config.backend {
        UploadBackend::Disabled => Ok(None),
        UploadBackend::Folder => Ok(Some(Arc::new(FolderUploader))),
        UploadBackend::Drive => {
            if env::var(&config.token_env_var).is_err() {
                warn!(
                    "⚠️ Drive upload enabled but '{}' is not set; uploads will fail until it is.",
                    config.token_env_var
                );
            }
            let uploader = DriveUploader::new(&config.token_env_var, Duration::from_secs(config.timeout_secs))?;
            Ok(Some(Arc::new(uploader)))
        }
    }
}

/// Google Drive v3 multipart upload. The OAuth access token is read from an
/// environment variable on every upload so it can be rotated while running.
pub struct DriveUploader {
    client: Client,
    token_env_var: String,
    endpoint: String,
}

impl DriveUploader {
    pub fn new(token_env_var: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(DriveUploader {
            client,
            token_env_var: token_env_var.to_string(),
            endpoint: DRIVE_UPLOAD_URL.to_string(),
        })
    }

    /// Points the uploader at another endpoint, e.g. a local stand-in.
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    fn token(&self) -> Result<String, AppError> {
        env::var(&self.token_env_var).map_err(|_| {
            AppError::UploadFailure(format!(
                "access token not found in environment variable '{}'",
                self.token_env_var
            ))
        })
    }
}

/// Builds a `multipart/related` body: JSON file metadata, then the media.
fn related_body(filename: &str, folder_id: &str, data: &[u8], boundary: &str) -> Result<Vec<u8>, AppError> {
    let metadata = serde_json::json!({
        "name": filename,
        "parents": [folder_id],
    });
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n--{b}\r\nContent-Type: application/zip\r\n\r\n",
            b = boundary,
            m = serde_json::to_string(&metadata)?
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    Ok(body)
}

#[async_trait]
impl Uploader for DriveUploader {
    fn describe(&self) -> String {
        "google-drive".to_string()
    }

    async fn upload(&self, filename: &str, folder_id: &str, data: Vec<u8>) -> Result<(), AppError> {
        let start = Instant::now();
        let token = self.token()?;
        let boundary = format!("camlapse-{:016x}", rand::thread_rng().gen::<u64>());
        let size = data.len();
        let body = related_body(filename, folder_id, &data, &boundary)?;
        debug!("☁️ Uploading '{}' ({} bytes) to Drive folder {}", filename, size, folder_id);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::UploadFailure(format!("request for '{}' failed: {}", filename, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::UploadFailure(format!(
                "Drive rejected '{}' with {}: {}",
                filename,
                status,
                detail.trim()
            )));
        }
        info!("☁️ Uploaded '{}' ({} bytes) in {:?}", filename, size, start.elapsed());
        Ok(())
    }
}

/// Copies archives into a local directory, e.g. a synced or network mount.
/// The folder id is the destination path.
pub struct FolderUploader;

#[async_trait]
impl Uploader for FolderUploader {
    fn describe(&self) -> String {
        "folder".to_string()
    }

    async fn upload(&self, filename: &str, folder_id: &str, data: Vec<u8>) -> Result<(), AppError> {
        let dest_dir = PathBuf::from(folder_id);
        let dest = dest_dir.join(filename);
        task::spawn_blocking(move || -> Result<(), AppError> {
            ensure_output_directory(&dest_dir)?;
            write_durable(&dest, &data)
                .map_err(|e| AppError::UploadFailure(format!("failed to write '{}': {}", dest.display(), e)))?;
            info!("📁 Copied archive to '{}'", dest.display());
            Ok(())
        })
        .await
        .map_err(|e| AppError::UploadFailure(format!("upload task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_body_wraps_metadata_and_media() {
        let body = related_body("t1.zip", "folder123", b"PK\x03\x04", "xyz").unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--xyz\r\nContent-Type: application/json"));
        assert!(text.contains(r#""parents":["folder123"]"#));
        assert!(text.contains("Content-Type: application/zip\r\n\r\nPK\u{3}\u{4}\r\n--xyz--"));
    }

    #[tokio::test]
    async fn folder_uploader_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("uploads");
        FolderUploader
            .upload("t1.zip", dest.to_str().unwrap(), b"zipdata".to_vec())
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest.join("t1.zip")).unwrap(), b"zipdata");
    }

    #[tokio::test]
    async fn drive_upload_without_token_fails_cleanly() {
        let uploader = DriveUploader::new("CAMLAPSE_TEST_UNSET_TOKEN", Duration::from_secs(1)).unwrap();
        let err = uploader.upload("t1.zip", "folder", Vec::new()).await.unwrap_err();
        assert!(matches!(err, AppError::UploadFailure(_)));
    }

    #[test]
    fn disabled_backend_builds_nothing() {
        assert!(from_config(&UploadConfig::default()).unwrap().is_none());
    }
}
