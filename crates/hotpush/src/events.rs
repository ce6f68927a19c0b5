//! Progress and state notifications.
//!
//! The coordinator never assumes a delivery mechanism: everything flows
//! through the [`EventSink`] capability the host hands in. Progress events
//! pass through a [`ProgressThrottle`] first so chunk-granularity I/O does
//! not flood the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::UpdateError;
use crate::resolver::ResolvedBundle;

/// A single download progress sample. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_received as f64 / self.total_bytes as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.bytes_received >= self.total_bytes
    }
}

/// Coordinator state machine phases, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Installing,
    AwaitingConfirmation,
    Confirmed,
    RolledBack,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Checking => "checking",
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Installing => "installing",
            UpdatePhase::AwaitingConfirmation => "awaiting_confirmation",
            UpdatePhase::Confirmed => "confirmed",
            UpdatePhase::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// Host-provided notification channel. All methods default to no-ops so
/// sinks implement only what they care about.
pub trait EventSink: Send + Sync {
    fn on_progress(&self, _event: &ProgressEvent) {}

    fn on_phase(&self, _phase: UpdatePhase) {}

    fn on_error(&self, _error: &UpdateError) {}

    /// The engine asks the shell to re-resolve and reload from `bundle`.
    fn on_reload_requested(&self, _bundle: &ResolvedBundle) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}

/// Minimum-interval admission policy for progress events.
///
/// Terminal events (all bytes received) always pass so the UI sees 100%.
pub struct ProgressThrottle {
    min_interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: Mutex::new(None),
        }
    }

    /// Admit a sample, returning the event to emit or `None` if suppressed.
    pub fn admit(&self, bytes_received: u64, total_bytes: u64) -> Option<ProgressEvent> {
        let terminal = total_bytes > 0 && bytes_received >= total_bytes;
        let now = Instant::now();
        let mut last = self.last_emit.lock().unwrap();
        if let Some(prev) = *last {
            if !terminal && now.duration_since(prev) < self.min_interval {
                return None;
            }
        }
        *last = Some(now);
        Some(ProgressEvent {
            bytes_received,
            total_bytes,
            timestamp: Utc::now(),
        })
    }

    /// Forget the last emission time, e.g. when a new download starts.
    pub fn reset(&self) {
        *self.last_emit.lock().unwrap() = None;
    }
}
