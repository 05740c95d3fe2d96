use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApplicationConfig {
    pub log_level: Option<String>, // Making it optional to potentially use CLI or env var as primary
    pub snapshot_directory: String,
    pub filename_timestamp_format: String, // strftime format string
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        ApplicationConfig {
            log_level: Some("info".to_string()),
            snapshot_directory: "./data/snaps".to_string(),
            filename_timestamp_format: "%Yy%mm%dd%Hh%Mm%Ss".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IncompletePolicy {
    /// Move interrupted sessions to `incomplete/`.
    Relocate,
    /// Remove interrupted sessions entirely.
    Delete,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimelapseConfig {
    pub root_directory: String,
    /// Polling quantum of the capture loop, in milliseconds.
    pub poll_quantum_ms: u64,
    pub video_fps: u32,
    pub video_extension: String,
    pub encode_video: bool,
    pub incomplete_policy: IncompletePolicy,
    pub confirm_timeout_secs: u64,
    pub max_count: u32,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        TimelapseConfig {
            root_directory: "./data/timelapses".to_string(),
            poll_quantum_ms: 100,
            video_fps: 24,
            video_extension: "mp4".to_string(),
            encode_video: true,
            incomplete_policy: IncompletePolicy::Relocate,
            confirm_timeout_secs: 180,
            max_count: 100_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadBackend {
    Disabled,
    Drive,
    Folder,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UploadConfig {
    pub backend: UploadBackend,
    /// Drive folder id, or the destination directory for the `folder` backend.
    pub folder_id: String,
    /// Name of the environment variable holding the Drive OAuth access token.
    pub token_env_var: String,
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            backend: UploadBackend::Disabled,
            folder_id: String::new(),
            token_env_var: "DRIVE_ACCESS_TOKEN".to_string(),
            timeout_secs: 300,
        }
    }
}

impl UploadConfig {
    /// Shareable link to the upload destination, when there is one.
    pub fn folder_link(&self) -> Option<String> {
        match self.backend {
            UploadBackend::Drive if !self.folder_id.is_empty() => Some(format!(
                "https://drive.google.com/drive/folders/{}?usp=sharing",
                self.folder_id
            )),
            UploadBackend::Folder if !self.folder_id.is_empty() => Some(self.folder_id.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub attachment_limit_bytes: Option<u64>,
}

impl NotifyConfig {
    pub const DEFAULT_ATTACHMENT_LIMIT: u64 = 8 * 1024 * 1024;

    pub fn attachment_limit(&self) -> u64 {
        self.attachment_limit_bytes.unwrap_or(Self::DEFAULT_ATTACHMENT_LIMIT)
    }
}
