use std::path::PathBuf;

use crate::mission::{MissionId, MissionStatus};
use crate::store::StoreError;

/// Errors returned by [`DownloadEngine`](super::DownloadEngine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The mission store failed or holds unreadable state.
    #[error("mission store: {0}")]
    Store(#[from] StoreError),
    #[error("no mission with id {0}")]
    NotFound(MissionId),
    #[error("a mission already exists for {0}")]
    Duplicate(PathBuf),
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("a mission needs at least one url")]
    NoUrls,
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("cannot {action} a mission that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: MissionStatus,
    },
    #[error("write permission denied for {0}")]
    WritePermissionDenied(PathBuf),
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn from_store(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(path) => EngineError::Duplicate(path),
            other => EngineError::Store(other),
        }
    }
}
