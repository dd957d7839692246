mod common;

use mockito::{Mock, Server, ServerGuard};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use common::*;
use signage_sync_rs::{
    cache::temp_path_for, AgentEvent, CacheManifest, MediaCache, MediaKind, SessionStore,
    Settings, SyncError,
};

async fn open_cache(
    settings: Settings,
    session: &SessionStore,
) -> (MediaCache, broadcast::Receiver<AgentEvent>) {
    let settings = Arc::new(settings);
    let api = api_client(&settings, session);
    let (tx, rx) = broadcast::channel(256);
    let cache = MediaCache::open(api, settings, tx).await.unwrap();
    (cache, rx)
}

async fn whole_file_mock(server: &mut ServerGuard, path: &str, data: &[u8]) -> Mock {
    server
        .mock("GET", path)
        .match_header("authorization", format!("Bearer {}", TOKEN).as_str())
        .with_status(200)
        .with_body(data)
        .expect(1)
        .create_async()
        .await
}

async fn range_mock(
    server: &mut ServerGuard,
    path: &str,
    data: &[u8],
    start: usize,
    end: usize,
) -> Mock {
    server
        .mock("GET", path)
        .match_header("range", format!("bytes={}-{}", start, end).as_str())
        .with_status(206)
        .with_header(
            "content-range",
            &format!("bytes {}-{}/{}", start, end, data.len()),
        )
        .with_body(&data[start..=end])
        .expect(1)
        .create_async()
        .await
}

fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// A small file is streamed once, then served from disk
#[tokio::test]
async fn test_streamed_download_then_cache_hit() {
    init_tracing();
    let mut server = Server::new_async().await;
    let data = payload(8);
    let mock = whole_file_mock(&mut server, "/files/a.bin", &data).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = test_settings(&server.url(), dir.path());
    let manifest_path = settings.manifest_path();
    let (cache, mut rx) = open_cache(settings, &session).await;
    let media = descriptor(MediaKind::Image, 1, "/files/a.bin", 8);

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(entry.media_id, 1);
    assert_eq!(entry.size_bytes, 8);
    assert_eq!(entry.original_name, "Original 1.bin");
    assert_eq!(tokio::fs::read(&entry.local_path).await.unwrap(), data);
    assert!(!temp_path_for(&entry.local_path).exists());

    let again = cache.fetch(&media).await.unwrap();
    assert_eq!(again.local_path, entry.local_path);
    assert!(again.last_accessed >= entry.last_accessed);
    mock.assert_async().await;

    let persisted = CacheManifest::load(&manifest_path).await.unwrap();
    assert_eq!(persisted.entries.len(), 1);
    assert_eq!(persisted.entries[0].media_id, 1);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::DownloadStarted { media_id: 1, total_bytes: 8 })));
}

// Large files are fetched in byte ranges
#[tokio::test]
async fn test_chunked_download_uses_ranges() {
    let mut server = Server::new_async().await;
    let data = payload(25);
    let chunks = vec![
        range_mock(&mut server, "/files/big.bin", &data, 0, 9).await,
        range_mock(&mut server, "/files/big.bin", &data, 10, 19).await,
        range_mock(&mut server, "/files/big.bin", &data, 20, 24).await,
    ];

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, mut rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Video, 2, "/files/big.bin", 25);

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(tokio::fs::read(&entry.local_path).await.unwrap(), data);
    for chunk in chunks {
        chunk.assert_async().await;
    }

    let progress: Vec<u64> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            AgentEvent::DownloadProgress { bytes_written, .. } => Some(bytes_written),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10, 20, 25]);
}

// An existing partial file is continued, not restarted
#[tokio::test]
async fn test_chunked_download_resumes_from_partial_file() {
    let mut server = Server::new_async().await;
    let data = payload(25);
    let first = server
        .mock("GET", "/files/big.bin")
        .match_header("range", "bytes=0-9")
        .expect(0)
        .create_async()
        .await;
    let second = range_mock(&mut server, "/files/big.bin", &data, 10, 19).await;
    let third = range_mock(&mut server, "/files/big.bin", &data, 20, 24).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, _rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Video, 3, "/files/big.bin", 25);

    let tmp = temp_path_for(&cache.final_path_for(&media));
    tokio::fs::write(&tmp, &data[..10]).await.unwrap();

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(tokio::fs::read(&entry.local_path).await.unwrap(), data);
    first.assert_async().await;
    second.assert_async().await;
    third.assert_async().await;
}

// A download that fails mid-way resumes to a byte-identical file
#[tokio::test]
async fn test_interrupted_download_resumes_to_identical_file() {
    let mut server = Server::new_async().await;
    let data = payload(25);
    let first = range_mock(&mut server, "/files/big.bin", &data, 0, 9).await;
    let failing = server
        .mock("GET", "/files/big.bin")
        .match_header("range", "bytes=10-19")
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, _rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Video, 4, "/files/big.bin", 25);

    let result = cache.fetch(&media).await;
    assert!(matches!(
        result,
        Err(SyncError::HttpStatus { status: 500, .. })
    ));
    failing.assert_async().await;
    let tmp = temp_path_for(&cache.final_path_for(&media));
    assert_eq!(tokio::fs::metadata(&tmp).await.unwrap().len(), 10);
    assert!(cache.get(4).await.is_none());
    assert_eq!(cache.in_flight_id(), None);

    failing.remove_async().await;
    let second = range_mock(&mut server, "/files/big.bin", &data, 10, 19).await;
    let third = range_mock(&mut server, "/files/big.bin", &data, 20, 24).await;

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(tokio::fs::read(&entry.local_path).await.unwrap(), data);
    first.assert_async().await;
    second.assert_async().await;
    third.assert_async().await;
}

// A server that answers a range request with the whole file
#[tokio::test]
async fn test_range_ignored_restarts_whole_file() {
    let mut server = Server::new_async().await;
    let data = payload(25);
    let mock = server
        .mock("GET", "/files/norange.bin")
        .with_status(200)
        .with_body(&data)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, _rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Video, 5, "/files/norange.bin", 25);

    // Stale partial data that must not end up in the final file
    let tmp = temp_path_for(&cache.final_path_for(&media));
    tokio::fs::write(&tmp, vec![0xFFu8; 10]).await.unwrap();

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(tokio::fs::read(&entry.local_path).await.unwrap(), data);
    mock.assert_async().await;
}

// Size differences are reported but the file is still used
#[tokio::test]
async fn test_size_mismatch_is_not_fatal() {
    let mut server = Server::new_async().await;
    let data = payload(5);
    whole_file_mock(&mut server, "/files/short.bin", &data).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, mut rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Image, 6, "/files/short.bin", 9);

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(entry.size_bytes, 5);
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        AgentEvent::SizeMismatch {
            media_id: 6,
            expected: 9,
            actual: 5
        }
    )));
}

// A declared size larger than the file follows the length in Content-Range
#[tokio::test]
async fn test_chunked_download_follows_reported_length() {
    let mut server = Server::new_async().await;
    let data = payload(20);
    let first = range_mock(&mut server, "/files/over.bin", &data, 0, 9).await;
    let second = range_mock(&mut server, "/files/over.bin", &data, 10, 19).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, mut rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Video, 7, "/files/over.bin", 25);

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(entry.size_bytes, 20);
    assert_eq!(tokio::fs::read(&entry.local_path).await.unwrap(), data);
    first.assert_async().await;
    second.assert_async().await;
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        AgentEvent::SizeMismatch {
            media_id: 7,
            expected: 25,
            actual: 20
        }
    )));
}

// A declared size smaller than the file still downloads every byte
#[tokio::test]
async fn test_chunked_download_not_truncated_by_short_declared_size() {
    let mut server = Server::new_async().await;
    let data = payload(25);
    let chunks = vec![
        range_mock(&mut server, "/files/under.bin", &data, 0, 9).await,
        range_mock(&mut server, "/files/under.bin", &data, 10, 19).await,
        range_mock(&mut server, "/files/under.bin", &data, 20, 24).await,
    ];

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, mut rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Video, 8, "/files/under.bin", 15);

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(entry.size_bytes, 25);
    assert_eq!(tokio::fs::read(&entry.local_path).await.unwrap(), data);
    for chunk in chunks {
        chunk.assert_async().await;
    }
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        AgentEvent::SizeMismatch {
            media_id: 8,
            expected: 15,
            actual: 25
        }
    )));
}

// A 416 at the end of a complete partial file finishes the download
#[tokio::test]
async fn test_unsatisfiable_range_at_end_completes_download() {
    let mut server = Server::new_async().await;
    let data = payload(20);
    let tail = server
        .mock("GET", "/files/done.bin")
        .match_header("range", "bytes=20-24")
        .with_status(416)
        .with_header("content-range", "bytes */20")
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, _rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Video, 13, "/files/done.bin", 25);
    let tmp = temp_path_for(&cache.final_path_for(&media));
    tokio::fs::write(&tmp, &data).await.unwrap();

    let entry = cache.fetch(&media).await.unwrap();
    assert_eq!(entry.size_bytes, 20);
    assert_eq!(tokio::fs::read(&entry.local_path).await.unwrap(), data);
    assert!(!tmp.exists());
    tail.assert_async().await;
}

// Eviction removes the least recently used entry but never the protected one
#[tokio::test]
async fn test_eviction_skips_protected_entry() {
    let mut server = Server::new_async().await;
    let data = payload(8);
    for path in ["/files/1.bin", "/files/2.bin", "/files/3.bin"] {
        whole_file_mock(&mut server, path, &data).await;
    }

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = Settings {
        max_cache_size_bytes: 20,
        ..test_settings(&server.url(), dir.path())
    };
    let (cache, mut rx) = open_cache(settings, &session).await;

    let a = cache
        .fetch(&descriptor(MediaKind::Image, 1, "/files/1.bin", 8))
        .await
        .unwrap();
    let b = cache
        .fetch(&descriptor(MediaKind::Image, 2, "/files/2.bin", 8))
        .await
        .unwrap();
    cache.set_protected(Some(1));

    cache
        .fetch(&descriptor(MediaKind::Image, 3, "/files/3.bin", 8))
        .await
        .unwrap();

    let ids: Vec<i64> = cache.entries().await.iter().map(|e| e.media_id).collect();
    assert_eq!(ids, vec![1, 3]);
    assert!(a.local_path.exists());
    assert!(!b.local_path.exists());
    assert!(cache.total_size().await <= 20);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, AgentEvent::MediaEvicted { media_id: 2 })));
}

// When nothing can be evicted the download is refused
#[tokio::test]
async fn test_cache_full_when_nothing_evictable() {
    let mut server = Server::new_async().await;
    let data = payload(8);
    whole_file_mock(&mut server, "/files/1.bin", &data).await;
    let big = server
        .mock("GET", "/files/big.bin")
        .expect(0)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = Settings {
        max_cache_size_bytes: 20,
        chunked_threshold_bytes: 1024,
        ..test_settings(&server.url(), dir.path())
    };
    let (cache, _rx) = open_cache(settings, &session).await;

    cache
        .fetch(&descriptor(MediaKind::Image, 1, "/files/1.bin", 8))
        .await
        .unwrap();
    cache.set_protected(Some(1));

    let result = cache
        .fetch(&descriptor(MediaKind::Video, 9, "/files/big.bin", 16))
        .await;
    assert!(matches!(
        result,
        Err(SyncError::CacheFull {
            needed: 16,
            available: 12
        })
    ));
    assert!(cache.get(1).await.is_some());
    big.assert_async().await;
}

// A file that turns out larger than declared is dropped if it cannot fit
#[tokio::test]
async fn test_oversized_download_is_discarded() {
    let mut server = Server::new_async().await;
    whole_file_mock(&mut server, "/files/1.bin", &payload(8)).await;
    whole_file_mock(&mut server, "/files/2.bin", &payload(16)).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = Settings {
        max_cache_size_bytes: 20,
        ..test_settings(&server.url(), dir.path())
    };
    let (cache, _rx) = open_cache(settings, &session).await;

    cache
        .fetch(&descriptor(MediaKind::Image, 1, "/files/1.bin", 8))
        .await
        .unwrap();
    cache.set_protected(Some(1));

    let understated = descriptor(MediaKind::Image, 2, "/files/2.bin", 8);
    let result = cache.fetch(&understated).await;
    assert!(matches!(
        result,
        Err(SyncError::CacheFull {
            needed: 16,
            available: 12
        })
    ));
    let ids: Vec<i64> = cache.entries().await.iter().map(|e| e.media_id).collect();
    assert_eq!(ids, vec![1]);
    assert!(cache.total_size().await <= 20);
    assert!(!cache.final_path_for(&understated).exists());
}

// Partial downloads count against the bound and go before complete entries
#[tokio::test]
async fn test_stale_partials_reaped_before_eviction() {
    let mut server = Server::new_async().await;
    let data = payload(8);
    for path in ["/files/1.bin", "/files/2.bin", "/files/3.bin"] {
        whole_file_mock(&mut server, path, &data).await;
    }

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = Settings {
        max_cache_size_bytes: 30,
        ..test_settings(&server.url(), dir.path())
    };
    let (cache, mut rx) = open_cache(settings, &session).await;

    cache
        .fetch(&descriptor(MediaKind::Image, 1, "/files/1.bin", 8))
        .await
        .unwrap();
    let stale = dir.path().join("50_abandoned.bin.tmp");
    tokio::fs::write(&stale, vec![0u8; 10]).await.unwrap();

    // 8 + 10 + 8 still fits, so the partial stays for a later resume
    cache
        .fetch(&descriptor(MediaKind::Image, 2, "/files/2.bin", 8))
        .await
        .unwrap();
    assert!(stale.exists());

    // 8 + 8 + 10 + 8 does not; the partial goes, no entry is evicted
    cache
        .fetch(&descriptor(MediaKind::Image, 3, "/files/3.bin", 8))
        .await
        .unwrap();
    assert!(!stale.exists());
    let ids: Vec<i64> = cache.entries().await.iter().map(|e| e.media_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, AgentEvent::MediaEvicted { .. })));
}

// Clearing deletes media, partials and the manifest but keeps the cursor and app id
#[tokio::test]
async fn test_clear_all_removes_files_but_keeps_cursor() {
    let mut server = Server::new_async().await;
    let data = payload(8);
    whole_file_mock(&mut server, "/files/1.bin", &data).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = test_settings(&server.url(), dir.path());
    let cursor_path = settings.cursor_path();
    let app_id_path = settings.app_id_path();
    let manifest_path = settings.manifest_path();
    let (cache, mut rx) = open_cache(settings, &session).await;

    let entry = cache
        .fetch(&descriptor(MediaKind::Image, 1, "/files/1.bin", 8))
        .await
        .unwrap();
    tokio::fs::write(&cursor_path, br#"{"lastProcessedId":3}"#)
        .await
        .unwrap();
    tokio::fs::write(&app_id_path, b"kiosk-7").await.unwrap();
    let partial = dir.path().join("99_partial.bin.tmp");
    tokio::fs::write(&partial, b"junk").await.unwrap();
    cache.set_protected(Some(1));

    cache.clear_all().await.unwrap();

    assert!(cache.entries().await.is_empty());
    assert!(!entry.local_path.exists());
    assert!(!partial.exists());
    assert!(!manifest_path.exists());
    assert!(cursor_path.exists());
    assert!(app_id_path.exists());
    assert_eq!(cache.protected(), None);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, AgentEvent::CacheCleared)));
}

// Entries whose files disappeared are dropped when the cache is reopened
#[tokio::test]
async fn test_stale_entries_dropped_on_open() {
    let mut server = Server::new_async().await;
    let data = payload(8);
    whole_file_mock(&mut server, "/files/1.bin", &data).await;
    whole_file_mock(&mut server, "/files/2.bin", &data).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = test_settings(&server.url(), dir.path());
    let (cache, _rx) = open_cache(settings.clone(), &session).await;

    cache
        .fetch(&descriptor(MediaKind::Image, 1, "/files/1.bin", 8))
        .await
        .unwrap();
    let gone = cache
        .fetch(&descriptor(MediaKind::Image, 2, "/files/2.bin", 8))
        .await
        .unwrap();
    drop(cache);
    tokio::fs::remove_file(&gone.local_path).await.unwrap();

    let (reopened, _rx) = open_cache(settings, &session).await;
    let ids: Vec<i64> = reopened.entries().await.iter().map(|e| e.media_id).collect();
    assert_eq!(ids, vec![1]);
}

// Two requests for the same media share one download
#[tokio::test]
async fn test_same_media_requests_coalesce() {
    let mut server = Server::new_async().await;
    let data = payload(8);
    let mock = whole_file_mock(&mut server, "/files/1.bin", &data).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, _rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    let media = descriptor(MediaKind::Image, 1, "/files/1.bin", 8);

    let (first, second) = tokio::join!(cache.fetch(&media), cache.fetch(&media));
    assert_eq!(first.unwrap().local_path, second.unwrap().local_path);
    mock.assert_async().await;
}

// A request for different media cancels the running download
#[tokio::test]
async fn test_new_media_supersedes_running_download() {
    let mut server = Server::new_async().await;
    // Keeps the first job sleeping in its retry backoff
    server
        .mock("GET", "/files/slow.bin")
        .with_status(503)
        .create_async()
        .await;
    let data = payload(8);
    whole_file_mock(&mut server, "/files/fast.bin", &data).await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = Settings {
        chunk_retry_backoff: Duration::from_millis(500),
        ..test_settings(&server.url(), dir.path())
    };
    let (cache, _rx) = open_cache(settings, &session).await;

    let slow = descriptor(MediaKind::Video, 10, "/files/slow.bin", 25);
    let background = cache.clone();
    let first = tokio::spawn(async move { background.fetch(&slow).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.in_flight_id(), Some(10));

    let entry = cache
        .fetch(&descriptor(MediaKind::Image, 11, "/files/fast.bin", 8))
        .await
        .unwrap();
    assert_eq!(entry.media_id, 11);
    assert!(matches!(first.await.unwrap(), Err(SyncError::Cancelled)));

    let ids: Vec<i64> = cache.entries().await.iter().map(|e| e.media_id).collect();
    assert_eq!(ids, vec![11]);
    assert_eq!(cache.in_flight_id(), None);
}

// Cancelling leaves the partial file for a later resume
#[tokio::test]
async fn test_cancel_in_flight_keeps_partial_file() {
    let mut server = Server::new_async().await;
    let data = payload(25);
    range_mock(&mut server, "/files/big.bin", &data, 0, 9).await;
    server
        .mock("GET", "/files/big.bin")
        .match_header("range", "bytes=10-19")
        .with_status(503)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let settings = Settings {
        chunk_retry_backoff: Duration::from_millis(500),
        ..test_settings(&server.url(), dir.path())
    };
    let (cache, _rx) = open_cache(settings, &session).await;
    let media = descriptor(MediaKind::Video, 12, "/files/big.bin", 25);
    let tmp = temp_path_for(&cache.final_path_for(&media));

    let background = cache.clone();
    let job = tokio::spawn(async move { background.fetch(&media).await });
    tokio::time::sleep(Duration::from_millis(150)).await;

    cache.cancel_in_flight().await;
    assert!(matches!(job.await.unwrap(), Err(SyncError::Cancelled)));
    assert_eq!(cache.in_flight_id(), None);
    assert_eq!(tokio::fs::metadata(&tmp).await.unwrap().len(), 10);
}

// Without a token nothing is requested
#[tokio::test]
async fn test_fetch_requires_session() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/files/1.bin")
        .expect(0)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = logged_in_session();
    let (cache, _rx) = open_cache(test_settings(&server.url(), dir.path()), &session).await;
    session.logout();

    let result = cache
        .fetch(&descriptor(MediaKind::Image, 1, "/files/1.bin", 8))
        .await;
    assert!(matches!(result, Err(SyncError::AuthRequired)));
    mock.assert_async().await;
}
