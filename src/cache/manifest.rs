use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::SyncError;

pub const MANIFEST_VERSION: u32 = 1;

/// One fully downloaded media file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub media_id: i64,
    pub filename: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub last_accessed: DateTime<Utc>,
    pub original_name: String,
}

impl CacheEntry {
    /// An entry is only usable while its file exists with the recorded size.
    pub async fn is_present(&self, tolerance: u64) -> bool {
        match tokio::fs::metadata(&self.local_path).await {
            Ok(meta) if meta.is_file() => meta.len().abs_diff(self.size_bytes) <= tolerance,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub version: u32,
    pub entries: Vec<CacheEntry>,
}

impl Default for CacheManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: Vec::new(),
        }
    }
}

impl CacheManifest {
    /// Read the manifest at `path`. A missing file yields an empty manifest;
    /// an unparseable one is discarded so a corrupted cache can recover.
    pub async fn load(path: &Path) -> Result<Self, SyncError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache manifest yet");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<CacheManifest>(&bytes) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Cache manifest is corrupted, starting empty");
                Ok(Self::default())
            }
        }
    }

    /// Drop entries whose file is gone or has the wrong size. Returns how
    /// many were removed.
    pub async fn retain_present(&mut self, tolerance: u64) -> usize {
        let before = self.entries.len();
        let mut kept = Vec::with_capacity(before);
        for entry in self.entries.drain(..) {
            if entry.is_present(tolerance).await {
                kept.push(entry);
            } else {
                info!(media_id = entry.media_id, path = %entry.local_path.display(), "Dropping stale cache entry");
            }
        }
        self.entries = kept;
        before - self.entries.len()
    }

    /// Write to a sibling temp file, then rename over the old manifest.
    pub async fn save(&self, path: &Path) -> Result<(), SyncError> {
        let body = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn get(&self, media_id: i64) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.media_id == media_id)
    }

    pub fn upsert(&mut self, entry: CacheEntry) {
        match self.entries.iter_mut().find(|e| e.media_id == entry.media_id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, media_id: i64) -> Option<CacheEntry> {
        let idx = self.entries.iter().position(|e| e.media_id == media_id)?;
        Some(self.entries.remove(idx))
    }

    pub fn touch(&mut self, media_id: i64, at: DateTime<Utc>) -> Option<&CacheEntry> {
        let entry = self.entries.iter_mut().find(|e| e.media_id == media_id)?;
        entry.last_accessed = at;
        Some(entry)
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    /// Least recently accessed entry that is not in `protected`.
    pub fn eviction_candidate(&self, protected: &[i64]) -> Option<&CacheEntry> {
        self.entries
            .iter()
            .filter(|e| !protected.contains(&e.media_id))
            .min_by_key(|e| e.last_accessed)
    }
}
