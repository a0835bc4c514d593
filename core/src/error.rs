use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("insufficient data: {got} samples, at least {needed} required")]
    InsufficientData { got: usize, needed: usize },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("device {0} is not connected")]
    DeviceNotConnected(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
