use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("There is currently an active timelapse.")]
    AlreadyActive,

    #[error("A timelapse named '{0}' already exists.")]
    NameExists(String),

    #[error("Invalid timelapse name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid timelapse request: {0}")]
    InvalidRequest(String),

    #[error("Capture Error: {0}")]
    CaptureFailure(String),

    #[error("Encoding Error: {0}")]
    EncodeFailure(String),

    #[error("Upload Error: {0}")]
    UploadFailure(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("There is no active timelapse.")]
    NoActiveSession,

    #[error("Confirmation for proposal #{0} lapsed before it was answered.")]
    ProposalLapsed(u64),

    #[error("Unknown proposal #{0}.")]
    UnknownProposal(u64),

    #[error("Camera is busy: {0}")]
    DeviceBusy(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("File I/O Error: {0}")]
    Io(String),

    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl AppError {
    /// Request-level rejections are answered locally and never abort a session.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AppError::AlreadyActive
                | AppError::NameExists(_)
                | AppError::InvalidName { .. }
                | AppError::InvalidRequest(_)
                | AppError::NotFound(_)
                | AppError::NoActiveSession
                | AppError::ProposalLapsed(_)
                | AppError::UnknownProposal(_)
                | AppError::DeviceBusy(_)
        )
    }
}

// Allow conversion from std::io::Error to AppError::Io
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Io(format!("metadata serialization failed: {}", err))
    }
}
