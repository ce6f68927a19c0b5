//! Engine façade and process-wide default instance.
//!
//! [`UpdateEngine`] wires the store, coordinator and resolver together and
//! is the surface the host shell talks to. It is fully instantiable, so
//! tests build as many engines as they like; an explicit singleton accessor
//! covers the usual one-per-process deployment.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::coordinator::{ConfirmationStatus, CycleOutcome, UpdateCoordinator};
use crate::descriptor::{HttpUpdateSource, UpdateSource};
use crate::error::UpdateError;
use crate::events::{EventSink, UpdatePhase};
use crate::resolver::{BootResolver, ResolvedBundle};
use crate::store::{BundleRecord, BundleStore, CrashHistory, PrunePolicy};

static GLOBAL_ENGINE: OnceCell<Arc<UpdateEngine>> = OnceCell::new();

/// The bundle update engine.
pub struct UpdateEngine<S: UpdateSource = HttpUpdateSource> {
    store: Arc<BundleStore>,
    coordinator: UpdateCoordinator<S>,
    resolver: BootResolver,
    sink: Arc<dyn EventSink>,
}

impl<S: UpdateSource> UpdateEngine<S> {
    /// Open the engine: recovers the store and resolves any confirmation
    /// window a previous process left behind.
    pub fn open(
        config: EngineConfig,
        source: S,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, UpdateError> {
        let store = Arc::new(BundleStore::open(&config.root_dir)?);
        let resolver = BootResolver::new(Arc::clone(&store), config.fallback_bundle.clone());
        let coordinator =
            UpdateCoordinator::new(config, Arc::clone(&store), source, Arc::clone(&sink));
        if let Some(version) = coordinator.recover()? {
            info!(version = %version, "Rolled back an update interrupted mid-confirmation");
        }
        Ok(Self {
            store,
            coordinator,
            resolver,
            sink,
        })
    }

    // --- resolution (side-effect-free, callable from anywhere) -----------

    /// The bundle the host shell should load right now. Never fails.
    pub fn resolve_active(&self) -> ResolvedBundle {
        self.resolver.resolve_active()
    }

    /// Resolve an explicit record instead of the active pointer.
    pub fn resolve_record(&self, record: &BundleRecord) -> ResolvedBundle {
        self.resolver.resolve_record(record)
    }

    /// Version label of the active bundle, `None` on the shipped fallback.
    pub fn current_version(&self) -> Option<String> {
        self.store.current().map(|r| r.version)
    }

    // --- update cycle -----------------------------------------------------

    /// Run one update cycle against the configured source.
    pub async fn check_for_update(&self) -> Result<CycleOutcome, UpdateError> {
        self.coordinator.check_for_update().await
    }

    /// Report the outcome of the first boot after an activation.
    pub fn notify_boot_outcome(&self, success: bool) -> Result<ConfirmationStatus, UpdateError> {
        self.coordinator.notify_boot_outcome(success)
    }

    /// Abort an in-flight download, if any.
    pub fn cancel_download(&self) {
        self.coordinator.cancel_download()
    }

    /// Ask the shell to re-resolve and reload from the active bundle.
    pub fn request_reload(&self) -> ResolvedBundle {
        let bundle = self.resolver.resolve_active();
        self.sink.on_reload_requested(&bundle);
        bundle
    }

    pub fn phase(&self) -> UpdatePhase {
        self.coordinator.phase()
    }

    // --- maintenance ------------------------------------------------------

    /// Delete old bundle records per the retention policy.
    pub fn prune(&self, policy: &PrunePolicy) -> Result<usize, UpdateError> {
        Ok(self.store.prune(policy)?)
    }

    pub fn crash_history(&self) -> CrashHistory {
        self.store.crash_history()
    }

    pub fn clear_crash_history(&self) {
        self.store.clear_crash_history()
    }

    /// Direct store access for embedders with bespoke needs.
    pub fn store(&self) -> &Arc<BundleStore> {
        &self.store
    }
}

impl UpdateEngine<HttpUpdateSource> {
    /// Install `engine` as the process-wide default. Returns `false` when a
    /// default was already installed; the passed engine is dropped.
    pub fn init_global(engine: UpdateEngine) -> bool {
        GLOBAL_ENGINE.set(Arc::new(engine)).is_ok()
    }

    /// The process-wide default engine, if one has been installed.
    pub fn global() -> Option<Arc<UpdateEngine>> {
        GLOBAL_ENGINE.get().cloned()
    }
}
