use std::path::PathBuf;

use crate::arbitration::ActiveMediaSelection;
use crate::commands::CommandKind;
use crate::display::Surface;
use crate::models::MediaKind;
use crate::state::ConnectionState;

// Event types broadcast to subscribers of the agent
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ConnectionStateChanged(ConnectionState),
    Registered,
    AuthExpired,
    CommandReceived { id: i64, kind: CommandKind },
    SelectionChanged(ActiveMediaSelection),
    SecurityMismatch(String),
    DownloadStarted { media_id: i64, total_bytes: u64 },
    DownloadProgress { media_id: i64, bytes_written: u64, total_bytes: u64 },
    SizeMismatch { media_id: i64, expected: u64, actual: u64 },
    MediaReady { kind: MediaKind, media_id: i64, path: PathBuf },
    MediaEvicted { media_id: i64 },
    CacheCleared,
    SurfaceChanged(Surface),
}

impl AgentEvent {
    // Get the name of the event type
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::ConnectionStateChanged(_) => "connectionStateChanged",
            AgentEvent::Registered => "registered",
            AgentEvent::AuthExpired => "authExpired",
            AgentEvent::CommandReceived { .. } => "commandReceived",
            AgentEvent::SelectionChanged(_) => "selectionChanged",
            AgentEvent::SecurityMismatch(_) => "securityMismatch",
            AgentEvent::DownloadStarted { .. } => "downloadStarted",
            AgentEvent::DownloadProgress { .. } => "downloadProgress",
            AgentEvent::SizeMismatch { .. } => "sizeMismatch",
            AgentEvent::MediaReady { .. } => "mediaReady",
            AgentEvent::MediaEvicted { .. } => "mediaEvicted",
            AgentEvent::CacheCleared => "cacheCleared",
            AgentEvent::SurfaceChanged(_) => "surfaceChanged",
        }
    }
}
