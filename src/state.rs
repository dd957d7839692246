use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use tracing::{debug, warn};

use crate::SyncError;

/// Lifecycle of the device/server pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Registering,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Registering => "registering",
            ConnectionState::Connected => "connected",
            ConnectionState::Error(_) => "error",
        }
    }
}

/// Readiness capability other components query instead of probing the
/// connection manager's internals.
pub trait ConnectionStatus: Send + Sync {
    fn is_connected(&self) -> bool;
    fn is_authenticated(&self) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorFile {
    last_processed_id: i64,
}

/// Id of the newest command that has been fully handled. Never moves
/// backwards.
#[derive(Clone, Debug)]
pub struct CommandCursor {
    last_processed_id: Arc<AtomicI64>,
    path: Option<PathBuf>,
}

impl CommandCursor {
    pub fn in_memory() -> Self {
        Self {
            last_processed_id: Arc::new(AtomicI64::new(0)),
            path: None,
        }
    }

    /// Load the cursor persisted at `path`. A missing or unreadable file
    /// starts from zero.
    pub async fn load(path: &Path) -> Self {
        let start = match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<CursorFile>(&bytes) {
                Ok(file) => file.last_processed_id,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Ignoring unreadable command cursor");
                    0
                }
            },
            Err(_) => 0,
        };
        debug!(last_processed_id = start, "Command cursor loaded");
        Self {
            last_processed_id: Arc::new(AtomicI64::new(start)),
            path: Some(path.to_path_buf()),
        }
    }

    pub fn get(&self) -> i64 {
        self.last_processed_id.load(Ordering::SeqCst)
    }

    /// Move the cursor to `id` if it is ahead. Returns true when it moved.
    pub async fn advance(&self, id: i64) -> Result<bool, SyncError> {
        let previous = self.last_processed_id.fetch_max(id, Ordering::SeqCst);
        if id <= previous {
            return Ok(false);
        }
        if let Some(path) = &self.path {
            let body = serde_json::to_vec(&CursorFile {
                last_processed_id: self.get(),
            })?;
            tokio::fs::write(path, body).await?;
        }
        Ok(true)
    }
}
