//! Streaming bundle download.
//!
//! Payloads stream into a temporary directory outside the store's namespace
//! so a partial file can never be mistaken for an installed bundle. The temp
//! directory is removed on every exit path, including cancellation and
//! errors, by tying its lifetime to [`TempPayload`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::descriptor::BundleDescriptor;
use crate::error::DownloadError;

/// Extra headroom over the declared payload size required on the staging
/// volume: one copy in the temp dir plus one in the store.
const SPACE_HEADROOM_FACTOR: u64 = 2;

/// Cooperative cancellation for an in-flight fetch, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A fully received payload parked in its own temp directory. Dropping the
/// value deletes the directory and everything in it.
#[derive(Debug)]
pub struct TempPayload {
    path: PathBuf,
    _dir: TempDir,
}

impl TempPayload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage raw bytes as a payload, e.g. a sideloaded bundle.
    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join("bundle.gz");
        std::fs::write(&path, bytes)?;
        Ok(Self { path, _dir: dir })
    }
}

/// Streams bundle payloads from their descriptor URL.
pub struct Downloader {
    client: reqwest::Client,
    stall_timeout: Duration,
}

impl Downloader {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(config.user_agent.clone())
                .connect_timeout(config.request_timeout())
                .build()
                .unwrap_or_default(),
            stall_timeout: config.stall_timeout(),
        }
    }

    /// Fetch the descriptor's payload.
    ///
    /// `on_progress` receives raw per-chunk samples `(received, total)`; the
    /// caller owns any rate limiting. No samples are delivered after a
    /// cancellation is observed.
    pub async fn fetch<F>(
        &self,
        descriptor: &BundleDescriptor,
        cancel: &CancelHandle,
        mut on_progress: F,
    ) -> Result<TempPayload, DownloadError>
    where
        F: FnMut(u64, u64),
    {
        let dir = TempDir::new()?;
        preflight_space(dir.path(), descriptor.size)?;

        let path = dir.path().join("bundle.gz");
        let mut file = tokio::fs::File::create(&path).await?;

        let mut resp = self
            .client
            .get(&descriptor.url)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::ServerError {
                status: status.as_u16(),
            });
        }

        let mut received: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                debug!(version = %descriptor.version, "Download cancelled");
                return Err(DownloadError::Cancelled);
            }

            let chunk = tokio::time::timeout(self.stall_timeout, resp.chunk())
                .await
                .map_err(|_| DownloadError::Timeout)?
                .map_err(map_transport_error)?;
            let Some(chunk) = chunk else { break };

            received += chunk.len() as u64;
            if received > descriptor.size {
                warn!(version = %descriptor.version, received, declared = descriptor.size,
                    "Server sent more bytes than the descriptor declared");
                return Err(DownloadError::SizeMismatch {
                    expected: descriptor.size,
                    actual: received,
                });
            }

            file.write_all(&chunk).await?;
            on_progress(received, descriptor.size);
        }

        if received != descriptor.size {
            return Err(DownloadError::SizeMismatch {
                expected: descriptor.size,
                actual: received,
            });
        }

        file.flush().await?;
        drop(file);
        debug!(version = %descriptor.version, bytes = received, "Download complete");
        Ok(TempPayload { path, _dir: dir })
    }
}

fn map_transport_error(e: reqwest::Error) -> DownloadError {
    if e.is_timeout() {
        DownloadError::Timeout
    } else {
        DownloadError::NetworkUnavailable(e.to_string())
    }
}

/// Refuse a download the staging volume clearly cannot hold. Best effort:
/// platforms without the query succeed vacuously.
#[cfg(unix)]
fn preflight_space(staging: &Path, payload_size: u64) -> Result<(), DownloadError> {
    let required = payload_size.saturating_mul(SPACE_HEADROOM_FACTOR);
    match nix::sys::statvfs::statvfs(staging) {
        Ok(stat) => {
            let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            if available < required {
                return Err(DownloadError::InsufficientSpace {
                    required,
                    available,
                });
            }
            Ok(())
        }
        Err(e) => {
            debug!("Skipping disk space preflight: {e}");
            Ok(())
        }
    }
}

#[cfg(not(unix))]
fn preflight_space(_staging: &Path, _payload_size: u64) -> Result<(), DownloadError> {
    Ok(())
}
