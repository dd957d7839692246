#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use signage_sync_rs::{ApiClient, AuthProvider, MediaDescriptor, MediaKind, SessionStore, Settings};

pub const APP_ID: &str = "app-1";
pub const DEVICE_ID: &str = "device-1";
pub const USER_ID: i64 = 77;
pub const TOKEN: &str = "token-abc";

// Settings with short intervals pointed at a mock server
pub fn test_settings(server_url: &str, cache_dir: &Path) -> Settings {
    Settings {
        server_url: server_url.to_string(),
        app_id: APP_ID.to_string(),
        device_id: DEVICE_ID.to_string(),
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(60),
        media_poll_interval: Duration::from_secs(60),
        registration_retry_delay: Duration::from_millis(10),
        cache_dir: cache_dir.to_path_buf(),
        max_cache_size_bytes: 1024 * 1024,
        chunked_threshold_bytes: 10,
        chunk_size_bytes: 10,
        chunk_retry_backoff: Duration::from_millis(5),
        size_tolerance_bytes: 0,
        persist_command_cursor: false,
        surface_debounce: Duration::ZERO,
        ..Settings::default()
    }
}

pub fn logged_in_session() -> SessionStore {
    let store = SessionStore::new(Duration::from_secs(3600));
    store.login(TOKEN, USER_ID, false);
    store
}

pub fn api_client(settings: &Settings, session: &SessionStore) -> Arc<ApiClient> {
    let auth: Arc<dyn AuthProvider> = Arc::new(session.clone());
    Arc::new(ApiClient::new(settings, auth).unwrap())
}

pub fn descriptor(kind: MediaKind, id: i64, url: &str, size: u64) -> MediaDescriptor {
    MediaDescriptor {
        id,
        kind,
        filename: format!("media-{id}.bin"),
        original_name: format!("Original {id}.bin"),
        url: url.to_string(),
        size_bytes: size,
        mime_type: "application/octet-stream".to_string(),
        is_active: None,
    }
}

// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
