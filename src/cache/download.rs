use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Response, StatusCode};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::ApiClient;
use crate::error::SyncError;
use crate::events::AgentEvent;
use crate::settings::Settings;
use crate::utils::{linear_backoff, parse_content_range, parse_unsatisfied_range};

/// `<final>.tmp`, the file a download writes into until it is complete.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name: OsString = final_path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// The one transfer that may be running at a time.
///
/// `declared_size` is what the server's media status claimed; `total_size`
/// starts out equal to it and follows the length the file server reports.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub media_id: i64,
    pub url: String,
    pub declared_size: u64,
    pub total_size: u64,
    pub bytes_written: u64,
    pub temp_path: PathBuf,
    pub final_path: PathBuf,
}

impl DownloadJob {
    pub fn new(media_id: i64, url: String, total_size: u64, final_path: PathBuf) -> Self {
        Self {
            media_id,
            url,
            declared_size: total_size,
            total_size,
            bytes_written: 0,
            temp_path: temp_path_for(&final_path),
            final_path,
        }
    }
}

enum ChunkBody {
    Partial { bytes: Bytes, total: Option<u64> },
    // The server ignored the Range header and is sending the whole file.
    Full(Response),
    // 416: nothing at the requested offset; carries the complete length.
    Unsatisfiable(u64),
}

pub(crate) struct Downloader<'a> {
    pub api: &'a ApiClient,
    pub settings: &'a Settings,
    pub cancel: &'a CancellationToken,
    pub events: &'a broadcast::Sender<AgentEvent>,
}

impl Downloader<'_> {
    /// Transfer `job` into its temp file, then rename it into place.
    /// Returns the size of the final file.
    pub async fn run(&self, job: &mut DownloadJob) -> Result<u64, SyncError> {
        if job.total_size > self.settings.chunked_threshold_bytes {
            self.download_chunked(job).await?;
        } else {
            self.download_streamed(job).await?;
        }
        self.finalize(job).await
    }

    fn progress(&self, job: &DownloadJob) {
        let _ = self.events.send(AgentEvent::DownloadProgress {
            media_id: job.media_id,
            bytes_written: job.bytes_written,
            total_bytes: job.total_size,
        });
    }

    async fn download_chunked(&self, job: &mut DownloadJob) -> Result<(), SyncError> {
        job.bytes_written = match tokio::fs::metadata(&job.temp_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if job.bytes_written > 0 {
            info!(
                media_id = job.media_id,
                offset = job.bytes_written,
                total = job.total_size,
                "Resuming partial download"
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&job.temp_path)
            .await?;
        let chunk_size = self.settings.chunk_size_bytes.max(1);
        // Until the file server has answered once, the declared size is only
        // a guess; a partial file already at that size still gets one request.
        let mut length_confirmed = false;

        while job.bytes_written < job.total_size || !length_confirmed {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let start = job.bytes_written;
            let end = if job.total_size > start {
                (start + chunk_size).min(job.total_size) - 1
            } else {
                start + chunk_size - 1
            };

            match self.fetch_chunk_with_retry(job, start, end).await? {
                ChunkBody::Partial { bytes, total } => {
                    length_confirmed = true;
                    if let Some(total) = total.filter(|t| *t != job.total_size) {
                        debug!(
                            media_id = job.media_id,
                            expected = job.total_size,
                            reported = total,
                            "File server reports a different length"
                        );
                        job.total_size = total;
                    }
                    file.write_all(&bytes).await?;
                    file.flush().await?;
                    file.sync_data().await?;
                    job.bytes_written += bytes.len() as u64;
                    debug!(
                        media_id = job.media_id,
                        written = job.bytes_written,
                        total = job.total_size,
                        "Chunk stored"
                    );
                    self.progress(job);
                }
                ChunkBody::Unsatisfiable(total) if total == job.bytes_written => {
                    debug!(media_id = job.media_id, total, "No bytes past the partial file, download complete");
                    length_confirmed = true;
                    job.total_size = total;
                }
                ChunkBody::Unsatisfiable(total) if total < job.bytes_written => {
                    warn!(
                        media_id = job.media_id,
                        partial = job.bytes_written,
                        total,
                        "Partial file is larger than the media, restarting"
                    );
                    file.set_len(0).await?;
                    job.bytes_written = 0;
                    job.total_size = total;
                    length_confirmed = true;
                }
                ChunkBody::Unsatisfiable(total) => {
                    return Err(SyncError::InvalidResponse(format!(
                        "Range {}-{} rejected although the file has {} bytes",
                        start, end, total
                    )));
                }
                ChunkBody::Full(response) => {
                    warn!(media_id = job.media_id, "Server ignored range request, downloading whole file");
                    drop(file);
                    return self.stream_to_temp(job, response).await;
                }
            }
        }
        Ok(())
    }

    async fn fetch_chunk_with_retry(
        &self,
        job: &DownloadJob,
        start: u64,
        end: u64,
    ) -> Result<ChunkBody, SyncError> {
        let max_attempts = self.settings.chunk_max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                res = self.fetch_chunk(&job.url, start, end) => res,
            };
            match result {
                Ok(body) => return Ok(body),
                Err(e) if e.is_auth_error() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    warn!(media_id = job.media_id, start, end, error = %e, "Chunk failed, aborting download");
                    return Err(e);
                }
                Err(e) => {
                    let delay = linear_backoff(self.settings.chunk_retry_backoff, attempt);
                    warn!(media_id = job.media_id, start, attempt, error = %e, ?delay, "Chunk failed, retrying");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn fetch_chunk(&self, url: &str, start: u64, end: u64) -> Result<ChunkBody, SyncError> {
        let response = self.api.open_media(url, Some((start, end))).await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let range = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                if let Some((range_start, _, _)) = range {
                    if range_start != start {
                        return Err(SyncError::InvalidResponse(format!(
                            "Range starts at {} but {} was requested",
                            range_start, start
                        )));
                    }
                }
                let mut body = response.bytes().await?;
                if body.is_empty() {
                    return Err(SyncError::InvalidResponse(format!(
                        "Empty chunk for bytes {}-{}",
                        start, end
                    )));
                }
                let expected = (end - start + 1) as usize;
                if body.len() > expected {
                    body.truncate(expected);
                }
                Ok(ChunkBody::Partial {
                    bytes: body,
                    total: range.and_then(|(_, _, total)| total),
                })
            }
            StatusCode::OK => Ok(ChunkBody::Full(response)),
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let total = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_unsatisfied_range);
                match total {
                    Some(total) => Ok(ChunkBody::Unsatisfiable(total)),
                    None => Err(SyncError::HttpStatus {
                        status: StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
                        body: response.text().await.unwrap_or_default(),
                    }),
                }
            }
            other => Err(SyncError::InvalidResponse(format!(
                "Unexpected status {} for ranged request",
                other
            ))),
        }
    }

    async fn download_streamed(&self, job: &mut DownloadJob) -> Result<(), SyncError> {
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            res = self.api.open_media(&job.url, None) => res?,
        };
        self.stream_to_temp(job, response).await
    }

    async fn stream_to_temp(&self, job: &mut DownloadJob, response: Response) -> Result<(), SyncError> {
        if let Some(length) = response.content_length() {
            job.total_size = length;
        }
        let mut file = File::create(&job.temp_path).await?;
        job.bytes_written = 0;

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    file.flush().await?;
                    return Err(SyncError::Cancelled);
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await?;
                    job.bytes_written += chunk.len() as u64;
                    trace!(media_id = job.media_id, written = job.bytes_written, "Stream chunk stored");
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        file.flush().await?;
        file.sync_data().await?;
        self.progress(job);
        Ok(())
    }

    async fn finalize(&self, job: &DownloadJob) -> Result<u64, SyncError> {
        tokio::fs::rename(&job.temp_path, &job.final_path).await?;
        let actual = tokio::fs::metadata(&job.final_path).await?.len();

        let declared = job.declared_size;
        if declared > 0 && actual.abs_diff(declared) > self.settings.size_tolerance_bytes {
            // Logged only; playback of the file still goes ahead.
            let mismatch = SyncError::SizeMismatch {
                media_id: job.media_id,
                expected: declared,
                actual,
            };
            warn!(error = %mismatch, "Downloaded file size differs from declared size");
            let _ = self.events.send(AgentEvent::SizeMismatch {
                media_id: job.media_id,
                expected: declared,
                actual,
            });
        }
        Ok(actual)
    }
}
