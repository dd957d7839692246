use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Server returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("JSON parsing failed: {0}")]
    ParseFailed(#[from] serde_json::Error),

    #[error("URL encoding failed: {0}")]
    UrlEncodingFailed(#[from] serde_urlencoded::ser::Error),

    #[error("No valid session, login required")]
    AuthRequired,

    #[error("Token expired (HTTP 401)")]
    TokenExpired,

    #[error("Device is not registered with the server")]
    DeviceNotFound,

    #[error("Registration failed after {0} attempts")]
    RegistrationFailed(u32),

    #[error("Identity mismatch in server payload: {0}")]
    SecurityMismatch(String),

    #[error("Disk I/O error: {0}")]
    DiskError(#[from] std::io::Error),

    #[error("Cache full: need {needed} bytes, only {available} can be made available")]
    CacheFull { needed: u64, available: u64 },

    #[error("Size mismatch for media {media_id}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        media_id: i64,
        expected: u64,
        actual: u64,
    },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Task panicked or cancelled")]
    TaskJoinError(#[from] tokio::task::JoinError),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else {
            SyncError::RequestFailed(err)
        }
    }
}

impl SyncError {
    /// True for failures that a later attempt may get past without operator
    /// or user intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RequestFailed(_)
            | SyncError::Timeout
            | SyncError::InvalidResponse(_)
            | SyncError::ParseFailed(_) => true,
            SyncError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// True when the session must be refreshed (re-login) before any further
    /// network call can succeed.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::AuthRequired | SyncError::TokenExpired)
    }
}
