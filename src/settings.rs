use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;

const MB: u64 = 1024 * 1024;
const APP_ID_FILE: &str = "app_id";

/// Holds all tunables. Built once by the host (usually via [`Settings::from_env`])
/// and handed to every component constructor.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub app_id: String,
    pub device_id: String,
    pub device_model: String,
    pub os: String,

    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub media_poll_interval: Duration,
    pub registration_retry_delay: Duration,
    pub max_registration_attempts: u32,
    pub session_timeout: Duration,

    pub cache_dir: PathBuf,
    pub max_cache_size_bytes: u64,
    pub chunked_threshold_bytes: u64,
    pub chunk_size_bytes: u64,
    pub chunk_max_retries: u32,
    pub chunk_retry_backoff: Duration,
    pub size_tolerance_bytes: u64,
    pub persist_command_cursor: bool,

    pub sticky_selection: bool,
    pub active_flag_tiebreak: bool,
    pub video_priority: bool,
    pub maintain_last_active: bool,
    pub surface_debounce: Duration,

    pub event_buffer_capacity: usize,
}

impl Default for Settings {
    /// Defaults for every tunable. The app id is a fresh UUID that is not
    /// stored anywhere; [`Settings::from_env`] persists one instead.
    fn default() -> Self {
        let app_id = uuid::Uuid::new_v4().to_string();
        Settings {
            server_url: "http://localhost:3000/api".to_string(),
            device_id: app_id.clone(),
            app_id,
            device_model: "generic".to_string(),
            os: env::consts::OS.to_string(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            media_poll_interval: Duration::from_secs(3),
            registration_retry_delay: Duration::from_secs(5),
            max_registration_attempts: 3,
            session_timeout: Duration::from_secs(60 * 60),
            cache_dir: default_cache_dir(),
            max_cache_size_bytes: 500 * MB,
            chunked_threshold_bytes: 10 * MB,
            chunk_size_bytes: 5 * MB,
            chunk_max_retries: 3,
            chunk_retry_backoff: Duration::from_secs(1),
            size_tolerance_bytes: 1024,
            persist_command_cursor: true,
            sticky_selection: true,
            active_flag_tiebreak: false,
            video_priority: true,
            maintain_last_active: true,
            surface_debounce: Duration::from_millis(100),
            event_buffer_capacity: 256,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("signage-sync")
}

fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(MB)
}

/// The app id stored in `dir`, generating and storing one on first use so the
/// device keeps its identity (and command cursor) across restarts.
pub(crate) fn load_or_create_app_id(dir: &Path) -> String {
    let path = dir.join(APP_ID_FILE);
    if let Ok(stored) = fs::read_to_string(&path) {
        let stored = stored.trim();
        if !stored.is_empty() {
            return stored.to_string();
        }
    }
    let app_id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = fs::create_dir_all(dir).and_then(|()| fs::write(&path, &app_id)) {
        warn!(error = %e, path = %path.display(), "Could not store generated app id");
    }
    app_id
}

impl Settings {
    /// Read every tunable from `SYNC_*` environment variables (optionally
    /// loaded from a `.env` file), falling back to [`Settings::default`].
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Settings::default();

        fn parse_string(var: &str, default: String) -> String {
            env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default)
        }

        fn parse_u32(var: &str, default: u32) -> u32 {
            env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        fn parse_u64(var: &str, default: u64) -> u64 {
            env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        fn parse_usize(var: &str, default: usize) -> usize {
            env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        fn parse_bool(var: &str, default: bool) -> bool {
            match env::var(var).ok().as_deref().map(str::trim) {
                Some("1") | Some("true") | Some("yes") | Some("on") => true,
                Some("0") | Some("false") | Some("no") | Some("off") => false,
                _ => default,
            }
        }

        // helper to parse seconds into Duration
        fn parse_secs(var: &str, default: Duration) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        }

        // helper to parse millis into Duration
        fn parse_millis(var: &str, default: Duration) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        }

        fn parse_mb(var: &str, default_bytes: u64) -> u64 {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(mb_to_bytes)
                .unwrap_or(default_bytes)
        }

        let cache_dir = env::var("SYNC_CACHE_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);
        let app_id = env::var("SYNC_APP_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| load_or_create_app_id(&cache_dir));
        let device_id = parse_string("SYNC_DEVICE_ID", app_id.clone());
        let session_timeout = env::var("SYNC_SESSION_TIMEOUT_MINUTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
            .unwrap_or(defaults.session_timeout);

        Settings {
            server_url: parse_string("SYNC_SERVER_URL", defaults.server_url),
            app_id,
            device_id,
            device_model: parse_string("SYNC_DEVICE_MODEL", defaults.device_model),
            os: parse_string("SYNC_OS", defaults.os),
            request_timeout: parse_secs("SYNC_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            poll_interval: parse_secs("SYNC_POLL_INTERVAL_SECS", defaults.poll_interval),
            heartbeat_interval: parse_secs(
                "SYNC_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            media_poll_interval: parse_secs(
                "SYNC_MEDIA_POLL_INTERVAL_SECS",
                defaults.media_poll_interval,
            ),
            registration_retry_delay: parse_secs(
                "SYNC_REGISTRATION_RETRY_SECS",
                defaults.registration_retry_delay,
            ),
            max_registration_attempts: parse_u32(
                "SYNC_MAX_REGISTRATION_ATTEMPTS",
                defaults.max_registration_attempts,
            ),
            session_timeout,
            cache_dir,
            max_cache_size_bytes: parse_mb("SYNC_MAX_CACHE_SIZE_MB", defaults.max_cache_size_bytes),
            chunked_threshold_bytes: parse_mb(
                "SYNC_CHUNKED_THRESHOLD_MB",
                defaults.chunked_threshold_bytes,
            ),
            chunk_size_bytes: parse_mb("SYNC_CHUNK_SIZE_MB", defaults.chunk_size_bytes),
            chunk_max_retries: parse_u32("SYNC_CHUNK_MAX_RETRIES", defaults.chunk_max_retries),
            chunk_retry_backoff: parse_millis(
                "SYNC_CHUNK_RETRY_BACKOFF_MS",
                defaults.chunk_retry_backoff,
            ),
            size_tolerance_bytes: parse_u64(
                "SYNC_SIZE_TOLERANCE_BYTES",
                defaults.size_tolerance_bytes,
            ),
            persist_command_cursor: parse_bool(
                "SYNC_PERSIST_COMMAND_CURSOR",
                defaults.persist_command_cursor,
            ),
            sticky_selection: parse_bool("SYNC_STICKY_SELECTION", defaults.sticky_selection),
            active_flag_tiebreak: parse_bool(
                "SYNC_ACTIVE_FLAG_TIEBREAK",
                defaults.active_flag_tiebreak,
            ),
            video_priority: parse_bool("SYNC_VIDEO_PRIORITY", defaults.video_priority),
            maintain_last_active: parse_bool(
                "SYNC_MAINTAIN_LAST_ACTIVE",
                defaults.maintain_last_active,
            ),
            surface_debounce: parse_millis("SYNC_SURFACE_DEBOUNCE_MS", defaults.surface_debounce),
            event_buffer_capacity: parse_usize(
                "SYNC_EVENT_BUFFER_CAPACITY",
                defaults.event_buffer_capacity,
            ),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.cache_dir.join("manifest.json")
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.cache_dir.join("command_cursor.json")
    }

    /// Where [`Settings::from_env`] keeps a generated app id.
    pub fn app_id_path(&self) -> PathBuf {
        self.cache_dir.join(APP_ID_FILE)
    }
}
