//! Error types for the Calibre bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Permission denied for '{action}': {rule}")]
    PermissionDenied { action: String, rule: String },

    #[error("Worker spawn failed: {0}")]
    WorkerSpawn(String),

    #[error("Worker timed out: {0}")]
    WorkerTimeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Engine error {code}: {message}")]
    Engine { code: i64, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// True when the error resolves inside the bridge without any
    /// worker process having been contacted.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            BridgeError::Config(_)
                | BridgeError::LibraryNotFound(_)
                | BridgeError::PermissionDenied { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
