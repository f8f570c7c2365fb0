use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object store error: {message}")]
    Storage { message: String, transient: bool },

    #[error("access denied: {0}")]
    Auth(String),

    #[error("invalid relative path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("sync state corrupt: {0}")]
    StateCorrupt(String),

    #[error("watcher error: {0}")]
    Watch(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid daemon state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// A transient object-store failure the next cycle may clear.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// A permanent object-store failure (bad request, missing bucket, ...).
    pub fn storage_permanent(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) => true,
            Self::Storage { transient, .. } => *transient,
            _ => false,
        }
    }
}
