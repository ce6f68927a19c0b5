//! Boot-time bundle resolution.
//!
//! Read-only consumer of the store's active pointer. Never fails and never
//! coordinates with the update cycle: the host shell may call it at any
//! time, including while the coordinator is mid-failure.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::store::{BundleRecord, BundleStatus, BundleStore};

/// Where a resolved bundle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleOrigin {
    /// A downloaded bundle from the store.
    Store,
    /// The bundle shipped with the host install.
    Fallback,
}

/// A bundle the host shell can load right now.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBundle {
    /// Version label, `None` for the shipped fallback.
    pub version: Option<String>,
    pub path: PathBuf,
    pub origin: BundleOrigin,
}

impl ResolvedBundle {
    /// `file://` URL form of the bundle path.
    pub fn url(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Answers "which bundle should the shell load".
pub struct BootResolver {
    store: Arc<BundleStore>,
    fallback_bundle: PathBuf,
}

impl BootResolver {
    pub fn new(store: Arc<BundleStore>, fallback_bundle: PathBuf) -> Self {
        Self {
            store,
            fallback_bundle,
        }
    }

    /// Resolve the currently active bundle, falling back to the shipped
    /// bundle when nothing has been activated or the active payload is
    /// unusable.
    pub fn resolve_active(&self) -> ResolvedBundle {
        match self.store.current() {
            Some(record) if record.status == BundleStatus::Active && record.path.exists() => {
                ResolvedBundle {
                    version: Some(record.version),
                    path: record.path,
                    origin: BundleOrigin::Store,
                }
            }
            Some(record) => {
                debug!(version = %record.version, "Active record unusable, resolving fallback");
                self.fallback()
            }
            None => self.fallback(),
        }
    }

    /// Resolve an explicit record rather than the active pointer.
    pub fn resolve_record(&self, record: &BundleRecord) -> ResolvedBundle {
        if record.path.exists() {
            ResolvedBundle {
                version: Some(record.version.clone()),
                path: record.path.clone(),
                origin: BundleOrigin::Store,
            }
        } else {
            debug!(version = %record.version, "Requested record unusable, resolving fallback");
            self.fallback()
        }
    }

    fn fallback(&self) -> ResolvedBundle {
        ResolvedBundle {
            version: None,
            path: self.fallback_bundle.clone(),
            origin: BundleOrigin::Fallback,
        }
    }
}
