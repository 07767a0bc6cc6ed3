use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Failure of a locally-initiated action, returned to the caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// The backend refused the action; `message` is meant for the user.
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("not connected")]
    NotConnected,

    #[error("event consumer already registered")]
    AlreadyRegistered,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sync session has ended")]
    SessionClosed,
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Rejected { status: 404, .. })
            || matches!(self, SyncError::Rejected { message, .. } if message.contains("introuvable") || message.to_lowercase().contains("not found"))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

/// Why a raw frame could not become an [`crate::Event`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("unsupported event type: {0}")]
    Unsupported(String),
}
