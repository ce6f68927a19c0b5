//! hotpush: on-device bundle update engine.
//!
//! Fetches versioned application bundles over the network, verifies them,
//! stores them alongside known-good versions, atomically swaps the active
//! pointer, and rolls back automatically when a newly activated bundle
//! fails to prove it boots. The host shell resolves the bundle to load
//! through the engine's resolver surface and is never left without a
//! resolvable bundle, across crashes mid-download, mid-install, or
//! mid-boot-after-update.

pub mod config;
pub mod coordinator;
pub mod descriptor;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod resolver;
pub mod store;
pub mod verify;

pub use config::EngineConfig;
pub use coordinator::{ConfirmationStatus, CycleOutcome, UpdateCoordinator};
pub use descriptor::{BundleDescriptor, HttpUpdateSource, UpdateSource};
pub use download::{CancelHandle, Downloader, TempPayload};
pub use engine::UpdateEngine;
pub use error::{DownloadError, StoreError, UpdateError, VerificationError};
pub use events::{EventSink, NullSink, ProgressEvent, ProgressThrottle, UpdatePhase};
pub use resolver::{BootResolver, BundleOrigin, ResolvedBundle};
pub use store::{
    BundleRecord, BundleStatus, BundleStore, CrashEntry, CrashHistory, PrunePolicy,
};
pub use verify::verify;
