//! Update cycle orchestration.
//!
//! Drives check → download → verify → install → activate → confirm, and
//! owns every rollback path: explicit boot-failure signals, confirmation
//! window expiry, and process restarts that interrupt an open window. The
//! state machine runs at most one cycle at a time and is re-entrant across
//! the life of the process.
//!
//! The confirmation window is wall-clock based and persisted next to the
//! store before the pointer swap, so a crash inside the window reads as a
//! failed confirmation on the next open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::descriptor::{BundleDescriptor, UpdateSource};
use crate::download::{CancelHandle, Downloader, TempPayload};
use crate::error::{DownloadError, StoreError, UpdateError};
use crate::events::{EventSink, ProgressThrottle, UpdatePhase};
use crate::store::{BundleStatus, BundleStore};
use crate::verify::verify;

const PENDING_FILE: &str = "pending.json";
const BACKOFF_BASE_MS: u64 = 500;

/// Result of a completed update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No newer bundle, or nothing to do.
    UpToDate,
    /// A new bundle is active and awaiting boot confirmation.
    Installed { version: String },
}

/// What `notify_boot_outcome` observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// The window resolved successfully; the bundle is confirmed good.
    Promoted { version: String },
    /// The host reported a failed boot; the bundle was rolled back.
    RolledBack { version: String },
    /// A crash-triggered rollback happened before this boot. One-shot.
    Recovered { crashed_version: String },
    /// No confirmation window was open.
    Stable,
}

/// Persisted record of an open confirmation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingConfirmation {
    version: String,
    prior_version: Option<String>,
    activated_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

/// Window bookkeeping shared with the watchdog task.
struct ConfirmationState {
    pending: StdMutex<Option<PendingConfirmation>>,
    session_rollback: StdMutex<Option<String>>,
}

/// Orchestrates update cycles over a [`BundleStore`].
pub struct UpdateCoordinator<S: UpdateSource> {
    config: EngineConfig,
    store: Arc<BundleStore>,
    source: S,
    downloader: Downloader,
    sink: Arc<dyn EventSink>,
    throttle: ProgressThrottle,
    phase: Arc<RwLock<UpdatePhase>>,
    state: Arc<ConfirmationState>,
    cycle: tokio::sync::Mutex<()>,
    cancel: StdMutex<CancelHandle>,
    watchdog: StdMutex<Option<JoinHandle<()>>>,
}

impl<S: UpdateSource> UpdateCoordinator<S> {
    pub fn new(
        config: EngineConfig,
        store: Arc<BundleStore>,
        source: S,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let throttle = ProgressThrottle::new(config.progress_interval());
        let downloader = Downloader::new(&config);
        Self {
            config,
            store,
            source,
            downloader,
            sink,
            throttle,
            phase: Arc::new(RwLock::new(UpdatePhase::Idle)),
            state: Arc::new(ConfirmationState {
                pending: StdMutex::new(None),
                session_rollback: StdMutex::new(None),
            }),
            cycle: tokio::sync::Mutex::new(()),
            cancel: StdMutex::new(CancelHandle::new()),
            watchdog: StdMutex::new(None),
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        *self.phase.read().unwrap()
    }

    pub fn pending_version(&self) -> Option<String> {
        self.state
            .pending
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.version.clone())
    }

    /// Resolve a confirmation window a previous process left open.
    ///
    /// A restart inside the window is indistinguishable from a bundle that
    /// never managed to boot, so the interrupted version is rolled back.
    /// Returns the rolled-back version, if any.
    pub fn recover(&self) -> Result<Option<String>, UpdateError> {
        let Some(pending) = load_pending_file(self.store.root()) else {
            return Ok(None);
        };
        let matches_active = self
            .store
            .current()
            .map(|r| r.version == pending.version)
            .unwrap_or(false);
        if !matches_active {
            debug!(version = %pending.version, "Discarding stale confirmation record");
            remove_pending_file(self.store.root());
            return Ok(None);
        }

        warn!(
            version = %pending.version,
            "Restarted inside a confirmation window, treating as failed boot"
        );
        let version = pending.version.clone();
        execute_rollback(
            &self.store,
            &self.sink,
            &self.state,
            &self.phase,
            pending,
            "interrupted confirmation window",
        )?;
        Ok(Some(version))
    }

    /// Run one full update cycle.
    ///
    /// Rejected with [`UpdateError::CycleInProgress`] while another cycle
    /// holds the machine, and with [`UpdateError::ConfirmationPending`]
    /// while an installed update still awaits its boot confirmation.
    pub async fn check_for_update(&self) -> Result<CycleOutcome, UpdateError> {
        let _guard = self
            .cycle
            .try_lock()
            .map_err(|_| UpdateError::CycleInProgress)?;

        let result = self.run_cycle().await;
        match &result {
            Ok(CycleOutcome::Installed { .. }) => {}
            Ok(_) => self.set_phase(UpdatePhase::Idle),
            Err(e) => {
                self.sink.on_error(e);
                self.set_phase(UpdatePhase::Idle);
            }
        }
        result
    }

    async fn run_cycle(&self) -> Result<CycleOutcome, UpdateError> {
        if self.state.pending.lock().unwrap().is_some() {
            return Err(UpdateError::ConfirmationPending);
        }

        self.set_phase(UpdatePhase::Checking);
        let descriptor = self.source.latest().await.map_err(UpdateError::Source)?;
        let Some(descriptor) = descriptor else {
            debug!("No update descriptor available");
            return Ok(CycleOutcome::UpToDate);
        };

        if let Some(current) = self.store.current() {
            if current.version == descriptor.version {
                debug!(version = %descriptor.version, "Already running the latest bundle");
                return Ok(CycleOutcome::UpToDate);
            }
        }
        if self.store.is_crashed(&descriptor.version) {
            warn!(version = %descriptor.version, "Refusing bundle from crash history");
            return Err(UpdateError::CrashHistory(descriptor.version));
        }

        info!(version = %descriptor.version, size = descriptor.size, "Update available");

        // Reuse an already-stored payload when its identity matches.
        let cached = self.store.get(&descriptor.version).filter(|r| {
            r.status == BundleStatus::Verified
                && r.checksum.eq_ignore_ascii_case(&descriptor.checksum)
                && r.path.exists()
        });
        let record = match cached {
            Some(record) => {
                info!(version = %record.version, "Bundle already stored, skipping download");
                self.set_phase(UpdatePhase::Installing);
                record
            }
            None => {
                let payload = self.download_and_verify(&descriptor).await?;
                self.set_phase(UpdatePhase::Installing);
                self.store.put(payload.path(), &descriptor)?
            }
        };

        let prior_version = self.store.current().map(|r| r.version);
        let now = Utc::now();
        let pending = PendingConfirmation {
            version: record.version.clone(),
            prior_version: prior_version.clone(),
            activated_at: now,
            deadline: now + chrono::Duration::seconds(self.config.confirmation_window_secs as i64),
        };
        // Persisted before the swap: a crash after activation always finds
        // the window on disk.
        write_pending_file(self.store.root(), &pending)?;
        *self.state.pending.lock().unwrap() = Some(pending.clone());

        if let Err(e) = self.store.activate(&record.version) {
            // The pointer is untouched on a failed swap; drop the window.
            remove_pending_file(self.store.root());
            *self.state.pending.lock().unwrap() = None;
            return Err(e.into());
        }
        self.store.set_protected_prior(prior_version);

        self.set_phase(UpdatePhase::AwaitingConfirmation);
        self.spawn_watchdog(pending);
        info!(version = %record.version, "Update installed, awaiting boot confirmation");
        Ok(CycleOutcome::Installed {
            version: record.version,
        })
    }

    /// Download with bounded retries and exponential backoff. A failed
    /// verification discards the payload and re-downloads; the same bytes
    /// are never re-verified.
    async fn download_and_verify(
        &self,
        descriptor: &BundleDescriptor,
    ) -> Result<TempPayload, UpdateError> {
        let cancel = {
            let mut guard = self.cancel.lock().unwrap();
            *guard = CancelHandle::new();
            guard.clone()
        };

        let max_attempts = self.config.max_download_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            self.set_phase(UpdatePhase::Downloading);
            self.throttle.reset();
            let fetched = self
                .downloader
                .fetch(descriptor, &cancel, |received, total| {
                    if let Some(event) = self.throttle.admit(received, total) {
                        self.sink.on_progress(&event);
                    }
                })
                .await;

            let error: UpdateError = match fetched {
                Ok(payload) => {
                    self.set_phase(UpdatePhase::Verifying);
                    match verify(payload.path(), &descriptor.checksum, descriptor.size) {
                        Ok(()) => return Ok(payload),
                        Err(e) => {
                            warn!(attempt, "Verification failed, discarding payload: {e}");
                            e.into()
                        }
                    }
                }
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled.into()),
                Err(e) => {
                    warn!(attempt, "Download failed: {e}");
                    e.into()
                }
            };

            if attempt >= max_attempts {
                return Err(error);
            }
            let delay = Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1));
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Resolve an open confirmation window with the host shell's verdict.
    pub fn notify_boot_outcome(&self, success: bool) -> Result<ConfirmationStatus, UpdateError> {
        if let Some(crashed) = self.state.session_rollback.lock().unwrap().take() {
            return Ok(ConfirmationStatus::Recovered {
                crashed_version: crashed,
            });
        }

        let Some(pending) = claim_pending(&self.state, None) else {
            return Ok(ConfirmationStatus::Stable);
        };
        self.abort_watchdog();

        if success {
            if let Err(e) = self.store.mark_confirmed(&pending.version) {
                // Keep the window open so expiry can still resolve it.
                *self.state.pending.lock().unwrap() = Some(pending);
                return Err(e.into());
            }
            self.store.set_protected_prior(None);
            remove_pending_file(self.store.root());
            self.set_phase(UpdatePhase::Confirmed);
            self.set_phase(UpdatePhase::Idle);
            info!(version = %pending.version, "Boot confirmed, update promoted");
            Ok(ConfirmationStatus::Promoted {
                version: pending.version,
            })
        } else {
            let version = pending.version.clone();
            execute_rollback(
                &self.store,
                &self.sink,
                &self.state,
                &self.phase,
                pending,
                "host shell reported boot failure",
            )?;
            Ok(ConfirmationStatus::RolledBack { version })
        }
    }

    /// Abort an in-flight download. Has no effect once installation has
    /// begun; an activated bundle can only be undone by rollback.
    pub fn cancel_download(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    fn spawn_watchdog(&self, pending: PendingConfirmation) {
        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(&self.state);
        let phase = Arc::clone(&self.phase);
        let wait = (pending.deadline - Utc::now()).to_std().unwrap_or_default();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(claimed) = claim_pending(&state, Some(&pending.version)) {
                warn!(version = %claimed.version, "Confirmation window expired");
                if let Err(e) = execute_rollback(
                    &store,
                    &sink,
                    &state,
                    &phase,
                    claimed,
                    "confirmation window expired",
                ) {
                    error!("Rollback after expired window failed: {e}");
                }
            }
        });
        if let Some(old) = self.watchdog.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    fn abort_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn set_phase(&self, next: UpdatePhase) {
        transition(&self.phase, &self.sink, next);
    }
}

impl<S: UpdateSource> Drop for UpdateCoordinator<S> {
    fn drop(&mut self) {
        self.abort_watchdog();
    }
}

fn transition(phase: &RwLock<UpdatePhase>, sink: &Arc<dyn EventSink>, next: UpdatePhase) {
    let mut guard = phase.write().unwrap();
    if *guard != next {
        *guard = next;
        sink.on_phase(next);
    }
}

/// Take the pending window if it matches the expected version (or any
/// version when `expect` is `None`). Whoever claims it resolves it; the
/// other party (watchdog vs. notify) then no-ops.
fn claim_pending(
    state: &ConfirmationState,
    expect: Option<&str>,
) -> Option<PendingConfirmation> {
    let mut guard = state.pending.lock().unwrap();
    let claimable = match (guard.as_ref(), expect) {
        (Some(p), Some(v)) => p.version == v,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if claimable {
        guard.take()
    } else {
        None
    }
}

/// Revert to the prior bundle and book the failure.
fn execute_rollback(
    store: &Arc<BundleStore>,
    sink: &Arc<dyn EventSink>,
    state: &ConfirmationState,
    phase: &RwLock<UpdatePhase>,
    pending: PendingConfirmation,
    reason: &str,
) -> Result<(), UpdateError> {
    warn!(version = %pending.version, reason, "Rolling back");
    match &pending.prior_version {
        Some(prior) => store.rollback_to(prior)?,
        None => store.deactivate(&pending.version)?,
    }
    store.record_crash(&pending.version);
    store.set_protected_prior(None);
    remove_pending_file(store.root());
    *state.session_rollback.lock().unwrap() = Some(pending.version.clone());
    transition(phase, sink, UpdatePhase::RolledBack);
    transition(phase, sink, UpdatePhase::Idle);
    Ok(())
}

// --- pending window persistence ------------------------------------------

fn pending_path(root: &Path) -> PathBuf {
    root.join(PENDING_FILE)
}

fn write_pending_file(root: &Path, pending: &PendingConfirmation) -> Result<(), StoreError> {
    let tmp = root.join(format!("{PENDING_FILE}.new"));
    fs::write(&tmp, serde_json::to_string_pretty(pending)?)?;
    fs::rename(&tmp, pending_path(root))?;
    Ok(())
}

fn load_pending_file(root: &Path) -> Option<PendingConfirmation> {
    let content = fs::read_to_string(pending_path(root)).ok()?;
    match serde_json::from_str(&content) {
        Ok(pending) => Some(pending),
        Err(e) => {
            warn!("Unreadable confirmation record, discarding: {e}");
            let _ = fs::remove_file(pending_path(root));
            None
        }
    }
}

fn remove_pending_file(root: &Path) {
    let _ = fs::remove_file(pending_path(root));
}
