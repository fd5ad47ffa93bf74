//! End-to-end upload orchestration.
//!
//! One `Uploader::upload` call drives the whole transfer: resolve the file's
//! identity, resume or create the remote resource, then run the sequential
//! chunk loop with retry/backoff, checkpointing, and throttled progress.
//! The loop is strictly one chunk in flight — the protocol's offset
//! semantics are sequential.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::error::{ProtocolError, UploadError};
use crate::guard::{ConcurrencyGuard, ProcessProbe, SystemProbe};
use crate::progress::ProgressSink;
use crate::protocol::{self, TusClient};
use crate::state::{StateStore, UploadState};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Checkpoints are never written closer together than this many bytes, so
/// tiny chunk sizes cannot checkpoint-storm.
const CHECKPOINT_FLOOR: u64 = 10 * 1024 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a completed upload.
#[derive(Debug)]
pub struct UploadOutcome {
    pub remote_url: String,
    /// Bytes sent during this invocation.
    pub bytes_sent: u64,
    /// Server-confirmed offset this invocation started from.
    pub resumed_from: u64,
}

pub struct Uploader {
    config: UploadConfig,
    store: StateStore,
    probe: Box<dyn ProcessProbe>,
    progress: Option<Arc<dyn ProgressSink>>,
    cancelled: Arc<AtomicBool>,
}

impl Uploader {
    pub fn new(config: UploadConfig, store: StateStore) -> Self {
        Self {
            config,
            store,
            probe: Box::new(SystemProbe),
            progress: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Shared flag that stops the upload at the next chunk boundary. An
    /// in-flight request completes or times out on its own schedule.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Upload one file, resuming from stored state when possible.
    pub async fn upload(&self, path: &Path) -> Result<UploadOutcome, UploadError> {
        self.config.validate()?;

        let file_err = |e: std::io::Error| UploadError::File {
            path: path.display().to_string(),
            source: e,
        };
        let meta = tokio::fs::metadata(path).await.map_err(file_err)?;
        if !meta.is_file() {
            return Err(file_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let file_size = meta.len();

        if self.config.reset {
            info!("reset requested, discarding stored upload state");
            self.store.clear(path);
        }

        let active = ConcurrencyGuard::new(&self.store, self.probe.as_ref()).check_active(path);
        if let Some(warning) = active.warning {
            warn!("{warning}");
        }

        let timeout = protocol::request_timeout(self.config.chunk_size, file_size);
        let client = TusClient::new(self.config.headers.clone(), timeout)
            .map_err(|e| UploadError::Config(e.to_string()))?;

        let (url, resumed_from) = self.resolve_resume_point(&client, path, file_size).await?;

        self.run_chunk_loop(&client, path, &url, resumed_from, file_size)
            .await?;

        self.store.clear(path);
        info!(url = %url, bytes = file_size, "upload complete");
        Ok(UploadOutcome {
            remote_url: url,
            bytes_sent: file_size - resumed_from,
            resumed_from,
        })
    }

    /// Find where to start: a stored record whose validation keys match and
    /// whose resource still answers an offset query wins; anything else
    /// falls back to creating a fresh upload.
    async fn resolve_resume_point(
        &self,
        client: &TusClient,
        path: &Path,
        file_size: u64,
    ) -> Result<(String, u64), UploadError> {
        if let Some(state) = self.store.load(path) {
            if state.file_size == file_size && state.endpoint == self.config.endpoint {
                // Never trust the stored offset blindly — the server's
                // answer is the resume point.
                match client.query_offset(&state.url).await {
                    Ok(confirmed) if confirmed <= file_size => {
                        info!(offset = confirmed, url = %state.url, "resuming at server-confirmed offset");
                        return Ok((state.url, confirmed));
                    }
                    Ok(confirmed) => {
                        warn!(
                            offset = confirmed,
                            file_size, "server offset exceeds file size, starting fresh"
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "stored upload no longer resumable, starting fresh");
                    }
                }
            } else {
                debug!("stored state does not match current request, ignoring");
            }
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let url = client
            .create_upload(&self.config.endpoint, file_size, &name)
            .await
            .map_err(UploadError::Create)?;
        info!(url = %url, "created new upload");
        self.checkpoint(path, &url, 0, file_size);
        Ok((url, 0))
    }

    async fn run_chunk_loop(
        &self,
        client: &TusClient,
        path: &Path,
        url: &str,
        start_offset: u64,
        file_size: u64,
    ) -> Result<(), UploadError> {
        let file_err = |e: std::io::Error| UploadError::File {
            path: path.display().to_string(),
            source: e,
        };
        let mut file = tokio::fs::File::open(path).await.map_err(file_err)?;
        let mut buf = vec![0u8; self.config.chunk_size as usize];

        let interval = checkpoint_interval(self.config.chunk_size, file_size);
        let mut offset = start_offset;
        let mut since_checkpoint: u64 = 0;
        let mut last_report = Instant::now();
        let mut last_report_offset = offset;

        while offset < file_size {
            // Cancellation is observed at chunk boundaries only.
            if self.cancelled.load(Ordering::Relaxed) {
                self.checkpoint(path, url, offset, file_size);
                info!(offset, "upload cancelled, checkpoint saved");
                return Err(UploadError::Cancelled { offset });
            }

            let want = (file_size - offset).min(self.config.chunk_size) as usize;
            file.seek(SeekFrom::Start(offset)).await.map_err(file_err)?;
            file.read_exact(&mut buf[..want]).await.map_err(file_err)?;
            let chunk = Bytes::copy_from_slice(&buf[..want]);

            let confirmed = self
                .patch_with_retry(client, path, url, offset, chunk, file_size)
                .await?;
            since_checkpoint += confirmed.saturating_sub(offset);
            offset = confirmed;

            if since_checkpoint >= interval && offset < file_size {
                self.checkpoint(path, url, offset, file_size);
                since_checkpoint = 0;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(last_report);
            if elapsed >= PROGRESS_INTERVAL {
                if let Some(sink) = &self.progress {
                    let rate =
                        ((offset - last_report_offset) as f64 / elapsed.as_secs_f64()) as u64;
                    sink.on_progress(offset, file_size, rate);
                }
                last_report = now;
                last_report_offset = offset;
            }
        }

        // Sinks always see completion, throttle or not.
        if let Some(sink) = &self.progress {
            let elapsed = last_report.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                ((file_size - last_report_offset) as f64 / elapsed) as u64
            } else {
                0
            };
            sink.on_progress(file_size, file_size, rate);
        }
        Ok(())
    }

    /// Send one chunk, retrying transient failures with exponential backoff
    /// up to the configured ceiling. Returns the server-confirmed offset
    /// after the chunk landed, which may differ from `offset + len` after a
    /// conflict resync.
    async fn patch_with_retry(
        &self,
        client: &TusClient,
        path: &Path,
        url: &str,
        offset: u64,
        chunk: Bytes,
        file_size: u64,
    ) -> Result<u64, UploadError> {
        let mut attempt: u32 = 0;
        loop {
            match client.patch_chunk(url, offset, chunk.clone()).await {
                Ok(confirmed) => return Ok(confirmed),

                // The server disagrees about the offset: resync instead of
                // retrying blindly at a stale position. The round-trip
                // itself spaces the attempts, so no backoff sleep here.
                Err(ProtocolError::OffsetConflict) if attempt < self.config.max_retries => {
                    attempt += 1;
                    match client.query_offset(url).await {
                        Ok(server) if server != offset => {
                            warn!(local = offset, server, "offset conflict, adopting server offset");
                            return Ok(server);
                        }
                        Ok(_) => {
                            warn!(offset, "offset conflict but server agrees, retrying chunk");
                        }
                        Err(e) => {
                            self.checkpoint(path, url, offset, file_size);
                            return Err(UploadError::Resumable {
                                offset,
                                attempts: attempt,
                                source: e,
                            });
                        }
                    }
                }

                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max = self.config.max_retries,
                        offset,
                        error = %e,
                        "chunk upload failed, backing off {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }

                Err(e) => {
                    // Either the ceiling is exhausted or the error is fatal;
                    // either way the checkpoint keeps the upload resumable.
                    self.checkpoint(path, url, offset, file_size);
                    return Err(UploadError::Resumable {
                        offset,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    fn checkpoint(&self, path: &Path, url: &str, offset: u64, file_size: u64) {
        let state = UploadState {
            url: url.to_string(),
            offset,
            file_size,
            endpoint: self.config.endpoint.clone(),
            chunk_size: self.config.chunk_size,
            headers: self.config.headers.clone(),
            saved_at: 0, // stamped by the store
        };
        if let Err(e) = self.store.save(path, &state) {
            warn!(error = %e, "failed to persist upload state");
        }
    }
}

/// Backoff before retry `attempt` (0-based): 1s, 2s, 4s, ... capped at 30s.
fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE.saturating_mul(1u32 << attempt.min(6)).min(BACKOFF_CAP)
}

/// Checkpoint cadence in bytes: the larger of two chunks and 5% of the
/// file, floored so the replay distance stays bounded without storming.
fn checkpoint_interval(chunk_size: u64, file_size: u64) -> u64 {
    (chunk_size * 2).max(file_size / 20).max(CHECKPOINT_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(20), Duration::from_secs(30));
    }

    #[test]
    fn total_backoff_matches_schedule() {
        // For N consecutive retryable failures the total sleep is
        // sum(min(2^i, 30s)) for i in 0..N.
        let total: Duration = (0..8).map(backoff_delay).sum();
        assert_eq!(total, Duration::from_secs(1 + 2 + 4 + 8 + 16 + 30 + 30 + 30));
    }

    #[test]
    fn checkpoint_cadence() {
        const MIB: u64 = 1024 * 1024;
        // Small everything: the floor wins.
        assert_eq!(checkpoint_interval(64 * 1024, MIB), 10 * MIB);
        // Large chunks: two chunks win.
        assert_eq!(checkpoint_interval(16 * MIB, 100 * MIB), 32 * MIB);
        // Large file: 5% wins.
        assert_eq!(checkpoint_interval(2 * MIB, 1024 * MIB), 1024 * MIB / 20);
    }
}
