//! Error types for the update engine.

use thiserror::Error;

/// Failures while fetching a bundle payload. Transient: the coordinator
/// retries these with backoff up to the configured attempt count.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("download stalled past the configured timeout")]
    Timeout,

    #[error("server returned status {status}")]
    ServerError { status: u16 },

    #[error("size mismatch: descriptor declared {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("download cancelled")]
    Cancelled,

    #[error("I/O error during download: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while validating a downloaded payload. Non-retryable for that
/// payload; a retry re-downloads rather than re-verifying the same bytes.
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("malformed package: {0}")]
    MalformedPackage(String),

    #[error("I/O error while verifying: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures in the bundle store. Fatal to the current cycle; the active
/// pointer is guaranteed unchanged when `activate` returns one of these.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown bundle version {0}")]
    UnknownVersion(String),

    #[error("bundle {version} is not activatable from status {status}")]
    NotActivatable { version: String, status: String },

    #[error("bundle {0} is currently active and cannot be replaced")]
    ReplaceActive(String),

    #[error("store manifest is corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Umbrella error surfaced to the host shell for a whole update cycle.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("another update cycle is already running")]
    CycleInProgress,

    #[error("an installed update is still awaiting boot confirmation")]
    ConfirmationPending,

    #[error("bundle {0} previously failed confirmation and is refused")]
    CrashHistory(String),

    #[error("update source error: {0}")]
    Source(anyhow::Error),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
