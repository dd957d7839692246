//! Disk-backed media cache keyed by server media id.
//!
//! At most one download runs at a time. A request for the media already
//! downloading joins that download; a request for different media cancels
//! it first and waits until it has stopped writing. Completed files are
//! recorded in a JSON manifest that is re-validated against the disk on
//! startup. Partial downloads count against the size bound too. When adding
//! a file would exceed it, partials left by other media are removed first,
//! then the least recently used entries are evicted (never the protected one).

pub mod download;
pub mod manifest;

pub use download::{temp_path_for, DownloadJob};
pub use manifest::{CacheEntry, CacheManifest};

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use std::time::SystemTime;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ApiClient;
use crate::error::SyncError;
use crate::events::AgentEvent;
use crate::models::MediaDescriptor;
use crate::settings::Settings;
use crate::utils::sanitize_filename;
use download::Downloader;

struct InFlight {
    media_id: i64,
    generation: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct CacheInner {
    api: Arc<ApiClient>,
    settings: Arc<Settings>,
    dir: PathBuf,
    manifest_path: PathBuf,
    // Single writer for the manifest, in memory and on disk.
    manifest: tokio::sync::Mutex<CacheManifest>,
    in_flight: Mutex<Option<InFlight>>,
    protected: Mutex<Option<i64>>,
    generation: AtomicU64,
    event_sender: broadcast::Sender<AgentEvent>,
}

/// Clears the in-flight slot and signals completion however the job ends,
/// including panics and cancellation.
struct JobGuard {
    inner: Arc<CacheInner>,
    generation: u64,
    done_tx: watch::Sender<bool>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|job| job.generation == self.generation) {
                *slot = None;
            }
        }
        self.done_tx.send_replace(true);
    }
}

struct Partial {
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
}

enum Wait {
    Coalesce(watch::Receiver<bool>),
    Supersede(watch::Receiver<bool>),
}

#[derive(Clone)]
pub struct MediaCache {
    inner: Arc<CacheInner>,
}

impl MediaCache {
    /// Open (creating if needed) the cache directory and load the manifest,
    /// dropping entries whose files are gone.
    pub async fn open(
        api: Arc<ApiClient>,
        settings: Arc<Settings>,
        event_sender: broadcast::Sender<AgentEvent>,
    ) -> Result<Self, SyncError> {
        let dir = settings.cache_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;
        let manifest_path = settings.manifest_path();

        let mut manifest = CacheManifest::load(&manifest_path).await?;
        let dropped = manifest.retain_present(settings.size_tolerance_bytes).await;
        if dropped > 0 {
            manifest.save(&manifest_path).await?;
        }
        info!(
            dir = %dir.display(),
            entries = manifest.entries.len(),
            bytes = manifest.total_size(),
            dropped,
            "Media cache opened"
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                api,
                settings,
                dir,
                manifest_path,
                manifest: tokio::sync::Mutex::new(manifest),
                in_flight: Mutex::new(None),
                protected: Mutex::new(None),
                generation: AtomicU64::new(0),
                event_sender,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn final_path_for(&self, descriptor: &MediaDescriptor) -> PathBuf {
        self.inner.dir.join(format!(
            "{}_{}",
            descriptor.id,
            sanitize_filename(&descriptor.filename)
        ))
    }

    pub async fn entries(&self) -> Vec<CacheEntry> {
        self.inner.manifest.lock().await.entries.clone()
    }

    pub async fn total_size(&self) -> u64 {
        self.inner.manifest.lock().await.total_size()
    }

    /// Cached entry for `media_id` if its file is still intact.
    pub async fn get(&self, media_id: i64) -> Option<CacheEntry> {
        let manifest = self.inner.manifest.lock().await;
        let entry = manifest.get(media_id)?.clone();
        entry
            .is_present(self.inner.settings.size_tolerance_bytes)
            .await
            .then_some(entry)
    }

    /// Mark media as in use (updates its LRU timestamp).
    pub async fn touch(&self, media_id: i64) -> Result<Option<CacheEntry>, SyncError> {
        let mut manifest = self.inner.manifest.lock().await;
        let entry = manifest.touch(media_id, Utc::now()).cloned();
        if entry.is_some() {
            manifest.save(&self.inner.manifest_path).await?;
        }
        Ok(entry)
    }

    /// The media currently on screen; eviction never removes it.
    pub fn set_protected(&self, media_id: Option<i64>) {
        *self
            .inner
            .protected
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = media_id;
    }

    pub fn protected(&self) -> Option<i64> {
        *self
            .inner
            .protected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight_id(&self) -> Option<i64> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|job| job.media_id)
    }

    /// Return the cached file for `descriptor`, downloading it if needed.
    pub async fn fetch(&self, descriptor: &MediaDescriptor) -> Result<CacheEntry, SyncError> {
        if let Some(entry) = self.lookup_hit(descriptor.id).await? {
            debug!(media_id = descriptor.id, "Cache hit");
            return Ok(entry);
        }

        let (generation, cancel, done_tx) = loop {
            let wait = {
                let mut slot = self
                    .inner
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match slot.as_ref() {
                    None => {
                        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                        let cancel = CancellationToken::new();
                        let (done_tx, done_rx) = watch::channel(false);
                        *slot = Some(InFlight {
                            media_id: descriptor.id,
                            generation,
                            cancel: cancel.clone(),
                            done: done_rx,
                        });
                        break (generation, cancel, done_tx);
                    }
                    Some(job) if job.media_id == descriptor.id => Wait::Coalesce(job.done.clone()),
                    Some(job) => {
                        info!(
                            current = job.media_id,
                            requested = descriptor.id,
                            "Superseding in-flight download"
                        );
                        job.cancel.cancel();
                        Wait::Supersede(job.done.clone())
                    }
                }
            };
            match wait {
                Wait::Coalesce(mut done) => {
                    debug!(media_id = descriptor.id, "Joining in-flight download");
                    let _ = done.wait_for(|finished| *finished).await;
                    return self
                        .inner
                        .manifest
                        .lock()
                        .await
                        .get(descriptor.id)
                        .cloned()
                        .ok_or(SyncError::Cancelled);
                }
                // Wait until the old writer has stopped, then claim the slot.
                Wait::Supersede(mut done) => {
                    let _ = done.wait_for(|finished| *finished).await;
                }
            }
        };

        let guard = JobGuard {
            inner: self.inner.clone(),
            generation,
            done_tx,
        };
        let cache = self.clone();
        let descriptor = descriptor.clone();
        tokio::spawn(async move {
            let _guard = guard;
            cache.run_job(descriptor, cancel).await
        })
        .await?
    }

    /// Stop the running download. Its partial `.tmp` file stays for resume.
    pub async fn cancel_in_flight(&self) {
        let done = {
            let slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slot.as_ref().map(|job| {
                info!(media_id = job.media_id, "Cancelling in-flight download");
                job.cancel.cancel();
                job.done.clone()
            })
        };
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Delete every cached file (partials included) and the manifest. The
    /// command cursor and the stored app id are agent state and stay.
    pub async fn clear_all(&self) -> Result<(), SyncError> {
        self.cancel_in_flight().await;
        let mut manifest = self.inner.manifest.lock().await;
        let keep = [
            self.inner.settings.cursor_path(),
            self.inner.settings.app_id_path(),
        ];

        let mut dir = tokio::fs::read_dir(&self.inner.dir).await?;
        let mut removed = 0usize;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if keep.contains(&path) || !item.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(error = %e, path = %path.display(), "Failed to delete cached file"),
            }
        }
        *manifest = CacheManifest::default();
        drop(manifest);

        self.set_protected(None);
        info!(removed, "Media cache cleared");
        let _ = self.inner.event_sender.send(AgentEvent::CacheCleared);
        Ok(())
    }

    async fn lookup_hit(&self, media_id: i64) -> Result<Option<CacheEntry>, SyncError> {
        let mut manifest = self.inner.manifest.lock().await;
        let Some(entry) = manifest.get(media_id).cloned() else {
            return Ok(None);
        };
        if entry.is_present(self.inner.settings.size_tolerance_bytes).await {
            let touched = manifest.touch(media_id, Utc::now()).cloned();
            manifest.save(&self.inner.manifest_path).await?;
            Ok(touched)
        } else {
            warn!(media_id, path = %entry.local_path.display(), "Cached file missing, will download again");
            manifest.remove(media_id);
            manifest.save(&self.inner.manifest_path).await?;
            Ok(None)
        }
    }

    async fn run_job(
        &self,
        descriptor: MediaDescriptor,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, SyncError> {
        let url = self.inner.api.resolve_media_url(&descriptor.url)?;
        let final_path = self.final_path_for(&descriptor);
        let own_partial = temp_path_for(&final_path);

        self.ensure_capacity(descriptor.id, &own_partial, descriptor.size_bytes)
            .await?;

        info!(
            media_id = descriptor.id,
            kind = descriptor.kind.as_str(),
            size = descriptor.size_bytes,
            "Downloading media"
        );
        let _ = self.inner.event_sender.send(AgentEvent::DownloadStarted {
            media_id: descriptor.id,
            total_bytes: descriptor.size_bytes,
        });

        let mut job = DownloadJob::new(descriptor.id, url, descriptor.size_bytes, final_path.clone());
        let downloader = Downloader {
            api: &self.inner.api,
            settings: &self.inner.settings,
            cancel: &cancel,
            events: &self.inner.event_sender,
        };
        let size = match downloader.run(&mut job).await {
            Ok(size) => size,
            Err(SyncError::Cancelled) => {
                info!(
                    media_id = descriptor.id,
                    written = job.bytes_written,
                    "Download cancelled, partial file kept"
                );
                return Err(SyncError::Cancelled);
            }
            Err(e) => return Err(e),
        };

        let entry = CacheEntry {
            media_id: descriptor.id,
            filename: final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            local_path: final_path,
            size_bytes: size,
            last_accessed: Utc::now(),
            original_name: descriptor.original_name.clone(),
        };

        let max = self.inner.settings.max_cache_size_bytes;
        let mut manifest = self.inner.manifest.lock().await;
        manifest.upsert(entry.clone());
        // The declared size may have been missing or wrong.
        let projected = self
            .make_room(&mut manifest, entry.media_id, &own_partial, size)
            .await?;
        if projected > max {
            manifest.remove(entry.media_id);
            manifest.save(&self.inner.manifest_path).await?;
            drop(manifest);
            if let Err(e) = tokio::fs::remove_file(&entry.local_path).await {
                warn!(error = %e, media_id = entry.media_id, "Failed to delete oversized download");
            }
            let available = max.saturating_sub(projected - size);
            warn!(media_id = entry.media_id, size, available, max, "Downloaded file does not fit in the cache, discarded");
            return Err(SyncError::CacheFull {
                needed: size,
                available,
            });
        }
        manifest.save(&self.inner.manifest_path).await?;
        drop(manifest);

        info!(media_id = entry.media_id, size, "Media cached");
        Ok(entry)
    }

    /// Make room for `incoming` bytes of `media_id`, or fail with `CacheFull`.
    async fn ensure_capacity(
        &self,
        media_id: i64,
        own_partial: &Path,
        incoming: u64,
    ) -> Result<(), SyncError> {
        let max = self.inner.settings.max_cache_size_bytes;
        let mut manifest = self.inner.manifest.lock().await;
        let projected = self
            .make_room(&mut manifest, media_id, own_partial, incoming)
            .await?;
        if projected > max {
            let used = projected - incoming;
            warn!(media_id, incoming, used, max, "Not enough evictable space in cache");
            return Err(SyncError::CacheFull {
                needed: incoming,
                available: max.saturating_sub(used),
            });
        }
        Ok(())
    }

    /// Free space for `incoming` bytes of `media_id`. Partial downloads of
    /// other media go first (oldest first), then LRU entries. Returns the
    /// projected usage, which may still exceed the bound.
    async fn make_room(
        &self,
        manifest: &mut CacheManifest,
        media_id: i64,
        own_partial: &Path,
        incoming: u64,
    ) -> Result<u64, SyncError> {
        let max = self.inner.settings.max_cache_size_bytes;
        let existing = manifest.get(media_id).map(|e| e.size_bytes).unwrap_or(0);
        let needed = manifest.total_size().saturating_sub(existing) + incoming;

        let partials = self.stale_partials(own_partial).await?;
        let mut partial_bytes: u64 = partials.iter().map(|p| p.size).sum();
        for partial in partials {
            if needed + partial_bytes <= max {
                break;
            }
            match tokio::fs::remove_file(&partial.path).await {
                Ok(()) => {
                    info!(path = %partial.path.display(), size = partial.size, "Removed stale partial download");
                    partial_bytes -= partial.size;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => partial_bytes -= partial.size,
                Err(e) => warn!(error = %e, path = %partial.path.display(), "Failed to delete partial download"),
            }
        }

        if self.evict_until_fits(manifest, media_id, incoming + partial_bytes) > 0 {
            manifest.save(&self.inner.manifest_path).await?;
        }
        let existing = manifest.get(media_id).map(|e| e.size_bytes).unwrap_or(0);
        Ok(manifest.total_size().saturating_sub(existing) + incoming + partial_bytes)
    }

    /// `*.tmp` downloads in the cache directory other than `own`, oldest first.
    async fn stale_partials(&self, own: &Path) -> Result<Vec<Partial>, SyncError> {
        let manifest_tmp = self.inner.manifest_path.with_extension("json.tmp");
        let mut partials = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.inner.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path == own || path == manifest_tmp || path.extension().map_or(true, |ext| ext != "tmp") {
                continue;
            }
            let Ok(meta) = item.metadata().await else {
                continue;
            };
            if meta.is_file() {
                partials.push(Partial {
                    path,
                    size: meta.len(),
                    modified: meta.modified().ok(),
                });
            }
        }
        partials.sort_by_key(|p| p.modified);
        Ok(partials)
    }

    /// Evict LRU entries until the manifest plus `extra` bytes fits, treating
    /// `media_id`'s own entry (if any) as replaced by `extra`.
    fn evict_until_fits(&self, manifest: &mut CacheManifest, media_id: i64, extra: u64) -> usize {
        let max = self.inner.settings.max_cache_size_bytes;
        let mut protected = vec![media_id];
        if let Some(id) = self.protected() {
            protected.push(id);
        }
        if let Some(id) = self.in_flight_id() {
            protected.push(id);
        }

        let mut evicted = 0;
        loop {
            let existing = manifest.get(media_id).map(|e| e.size_bytes).unwrap_or(0);
            let projected = manifest.total_size().saturating_sub(existing) + extra;
            if projected <= max {
                break;
            }
            let Some(victim) = manifest.eviction_candidate(&protected).cloned() else {
                break;
            };
            manifest.remove(victim.media_id);
            if let Err(e) = std::fs::remove_file(&victim.local_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, media_id = victim.media_id, "Failed to delete evicted file");
                }
            }
            info!(media_id = victim.media_id, size = victim.size_bytes, "Evicted cached media");
            let _ = self.inner.event_sender.send(AgentEvent::MediaEvicted {
                media_id: victim.media_id,
            });
            evicted += 1;
        }
        evicted
    }
}
