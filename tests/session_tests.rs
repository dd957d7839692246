mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use signage_sync_rs::{ApiClient, AuthProvider, Session, SessionStore, Settings};

// Test session validity needs a token and recent activity
#[test]
fn test_session_validity_window() {
    let session = Session::new("tok", 1, true);
    let now = Utc::now();
    let timeout = Duration::from_secs(30 * 60);

    assert!(session.is_valid_at(now, timeout));
    assert!(session.is_valid_at(now + ChronoDuration::minutes(30), timeout));
    assert!(!session.is_valid_at(now + ChronoDuration::minutes(31), timeout));

    let empty = Session::new("", 1, false);
    assert!(!empty.is_valid_at(now, timeout));
}

// Test the store's login, touch, invalidate and logout
#[test]
fn test_session_store_lifecycle() {
    let store = SessionStore::new(Duration::from_secs(60));
    assert!(!store.is_valid());
    assert_eq!(store.token(), None);

    store.login("tok", 42, false);
    assert!(store.is_valid());
    assert_eq!(store.token().as_deref(), Some("tok"));
    assert_eq!(store.user_id(), Some(42));

    store.invalidate();
    assert!(!store.is_valid());
    assert_eq!(store.token(), None);
    // The user stays known after the token is dropped
    assert_eq!(store.user_id(), Some(42));

    store.logout();
    assert_eq!(store.user_id(), None);
    assert!(store.snapshot().is_none());
}

// Test an idle session expires and touch keeps it alive
#[test]
fn test_session_store_expiry_and_touch() {
    let store = SessionStore::new(Duration::from_secs(60));
    let mut stale = Session::new("tok", 1, true);
    stale.last_activity = Utc::now() - ChronoDuration::minutes(5);
    store.restore(stale);
    assert!(!store.is_valid());

    store.touch();
    assert!(store.is_valid());
}

// Test media urls resolve against the server
#[test]
fn test_resolve_media_url() {
    let settings = Settings {
        server_url: "https://signage.example.com/api/".to_string(),
        ..Settings::default()
    };
    let auth: Arc<dyn AuthProvider> = Arc::new(logged_in_session());
    let api = ApiClient::new(&settings, auth).unwrap();

    assert_eq!(
        api.url("/device/register"),
        "https://signage.example.com/api/device/register"
    );
    assert_eq!(
        api.resolve_media_url("/uploads/a.jpg").unwrap(),
        "https://signage.example.com/uploads/a.jpg"
    );
    assert_eq!(
        api.resolve_media_url("uploads/a.jpg").unwrap(),
        "https://signage.example.com/api/uploads/a.jpg"
    );
    assert_eq!(
        api.resolve_media_url("http://cdn.example.com/b.mp4").unwrap(),
        "http://cdn.example.com/b.mp4"
    );
}

// Test settings come from SYNC_* variables
#[test]
fn test_settings_from_env() {
    std::env::set_var("SYNC_APP_ID", "env-app");
    std::env::set_var("SYNC_MAX_CACHE_SIZE_MB", "64");
    std::env::set_var("SYNC_STICKY_SELECTION", "false");
    std::env::set_var("SYNC_SURFACE_DEBOUNCE_MS", "250");
    std::env::set_var("SYNC_SESSION_TIMEOUT_MINUTES", "15");

    let settings = Settings::from_env();
    assert_eq!(settings.app_id, "env-app");
    assert_eq!(settings.device_id, "env-app");
    assert_eq!(settings.max_cache_size_bytes, 64 * 1024 * 1024);
    assert!(!settings.sticky_selection);
    assert_eq!(settings.surface_debounce, Duration::from_millis(250));
    assert_eq!(settings.session_timeout, Duration::from_secs(15 * 60));
    assert_eq!(settings.max_registration_attempts, 3);
    assert_eq!(
        settings.manifest_path(),
        settings.cache_dir.join("manifest.json")
    );
}
