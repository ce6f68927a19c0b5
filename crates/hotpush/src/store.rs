//! On-disk bundle store.
//!
//! Persists verified bundle payloads under version-addressed directories and
//! owns the two pointer records the whole engine hangs off: `ACTIVE` (the
//! bundle the host shell should load) and `CONFIRMED` (the last bundle that
//! proved it boots). Each pointer is a single small file rewritten via
//! write-temp-then-rename, so a swap is one atomic step and a crash can
//! never leave a half-written pointer.
//!
//! Payload installation uses the same discipline at directory granularity:
//! the payload is copied into `<version>.tmp/` and promoted with one rename.
//! A `Pending` record in the registry is the write-ahead marker: a crash
//! mid-copy leaves the marker plus a `.tmp` directory, and both are swept on
//! the next open.
//!
//! Concurrency: all mutations serialize behind one mutex; [`BundleStore::current`]
//! reads a cached copy of the active record and never waits on store I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::descriptor::BundleDescriptor;
use crate::error::StoreError;
use crate::verify::sha256_file;

pub const ACTIVE_POINTER_FILE: &str = "ACTIVE";
pub const CONFIRMED_POINTER_FILE: &str = "CONFIRMED";
const RECORDS_FILE: &str = "records.json";
const CRASH_HISTORY_FILE: &str = "crash_history.json";
const BUNDLES_DIR: &str = "bundles";
const PAYLOAD_FILE: &str = "bundle.gz";
const STAGING_SUFFIX: &str = ".tmp";

/// Lifecycle status of a stored bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    /// Write-ahead marker: installation started but did not complete.
    Pending,
    /// Payload installed and checksum-verified, not currently active.
    Verified,
    /// The bundle the active pointer designates.
    Active,
    /// Failed its confirmation window; retained for diagnostics.
    RolledBack,
    /// Payload went missing or no longer matches its record.
    Corrupt,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Pending => "pending",
            BundleStatus::Verified => "verified",
            BundleStatus::Active => "active",
            BundleStatus::RolledBack => "rolled_back",
            BundleStatus::Corrupt => "corrupt",
        }
    }
}

/// Local record of a stored bundle version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub version: String,
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub status: BundleStatus,
    pub installed_at: DateTime<Utc>,
    pub confirmed_good: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordRegistry {
    #[serde(default = "registry_schema_version")]
    schema_version: u32,
    #[serde(default)]
    records: BTreeMap<String, BundleRecord>,
}

impl Default for RecordRegistry {
    fn default() -> Self {
        Self {
            schema_version: registry_schema_version(),
            records: BTreeMap::new(),
        }
    }
}

fn registry_schema_version() -> u32 {
    1
}

/// A bundle version that failed its confirmation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashEntry {
    pub version: String,
    pub crashed_at: DateTime<Utc>,
}

/// Versions refused for reinstall until explicitly cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrashHistory {
    pub entries: Vec<CrashEntry>,
}

impl CrashHistory {
    pub fn contains(&self, version: &str) -> bool {
        self.entries.iter().any(|e| e.version == version)
    }

    fn add(&mut self, version: &str) {
        if !self.contains(version) {
            self.entries.push(CrashEntry {
                version: version.to_string(),
                crashed_at: Utc::now(),
            });
        }
    }
}

/// Retention policy for [`BundleStore::prune`].
#[derive(Debug, Clone)]
pub enum PrunePolicy {
    /// Keep the N most recently installed records.
    RetainLatest(usize),
    /// Remove records installed longer ago than this.
    OlderThan(chrono::Duration),
}

#[derive(Debug)]
struct StoreInner {
    registry: RecordRegistry,
    active: Option<String>,
    confirmed: Option<String>,
    crash_history: CrashHistory,
    /// Prior-active version guarded from pruning while a confirmation
    /// window is open for its successor. In-memory only: an interrupted
    /// window rolls back on the next open, re-activating this version.
    protected_prior: Option<String>,
}

/// Version-addressed bundle storage with atomic pointer swaps.
pub struct BundleStore {
    root: PathBuf,
    inner: Mutex<StoreInner>,
    active_cache: RwLock<Option<BundleRecord>>,
}

impl BundleStore {
    /// Open (and recover) the store rooted at `root`.
    ///
    /// Recovery sweeps staging leftovers, discards `Pending` write-ahead
    /// markers, marks records with missing payloads `Corrupt`, and forces
    /// record statuses to agree with whatever the `ACTIVE` pointer file
    /// says; the pointer is the source of truth after a crash.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let bundles = root.join(BUNDLES_DIR);
        fs::create_dir_all(&bundles)?;

        sweep_staging(&bundles);
        remove_stale_pointer_temps(&root);

        let mut registry = load_registry(&root);
        let mut confirmed = read_pointer(&root, CONFIRMED_POINTER_FILE);
        let mut active = read_pointer(&root, ACTIVE_POINTER_FILE);

        // Discard write-ahead markers from interrupted installs.
        let pending: Vec<String> = registry
            .records
            .values()
            .filter(|r| r.status == BundleStatus::Pending)
            .map(|r| r.version.clone())
            .collect();
        for version in pending {
            warn!(version = %version, "Discarding interrupted install");
            let dir = bundles.join(&version);
            if dir.exists() {
                let _ = fs::remove_dir_all(&dir);
            }
            registry.records.remove(&version);
        }

        // Mark records whose payload disappeared or changed size.
        for record in registry.records.values_mut() {
            if record.status == BundleStatus::Corrupt {
                continue;
            }
            let usable = fs::metadata(&record.path)
                .map(|m| m.len() == record.size)
                .unwrap_or(false);
            if !usable {
                warn!(version = %record.version, "Payload missing or damaged, marking corrupt");
                record.status = BundleStatus::Corrupt;
            }
        }

        // Reconcile the active pointer against the registry.
        if let Some(version) = active.clone() {
            match registry.records.get(&version) {
                Some(record) if record.status != BundleStatus::Corrupt => {}
                Some(_) => {
                    warn!(version = %version, "Active bundle is corrupt, falling back");
                    active = fall_back_pointer(&root, &registry, confirmed.as_deref());
                }
                None => {
                    let payload = bundles.join(&version).join(PAYLOAD_FILE);
                    if payload.exists() {
                        // Registry was lost; rebuild the record from disk.
                        match rebuild_record(&version, &payload, confirmed.as_deref()) {
                            Ok(record) => {
                                warn!(version = %version, "Reconstructed active record from payload");
                                registry.records.insert(version.clone(), record);
                            }
                            Err(e) => {
                                warn!(version = %version, "Could not reconstruct active record: {e}");
                                active = fall_back_pointer(&root, &registry, confirmed.as_deref());
                            }
                        }
                    } else {
                        warn!(version = %version, "Active pointer names a missing bundle, clearing");
                        active = fall_back_pointer(&root, &registry, confirmed.as_deref());
                    }
                }
            }
        }

        // The pointer decides which record is Active; demote any other
        // record a crash left in Active state back to Verified.
        for record in registry.records.values_mut() {
            if record.status == BundleStatus::Active && active.as_deref() != Some(record.version.as_str()) {
                record.status = BundleStatus::Verified;
            }
        }
        if let Some(version) = &active {
            if let Some(record) = registry.records.get_mut(version) {
                record.status = BundleStatus::Active;
            }
        }

        if let Some(version) = &confirmed {
            if !registry.records.contains_key(version) {
                warn!(version = %version, "Confirmed pointer names an unknown bundle, clearing");
                confirmed = None;
            }
        }

        let crash_history = load_crash_history(&root);
        let active_record = active
            .as_ref()
            .and_then(|v| registry.records.get(v))
            .cloned();

        let store = Self {
            root,
            inner: Mutex::new(StoreInner {
                registry,
                active,
                confirmed,
                crash_history,
                protected_prior: None,
            }),
            active_cache: RwLock::new(active_record),
        };
        store.persist_registry(&store.inner.lock().unwrap())?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Install a verified payload under its version address.
    ///
    /// The caller has already checked the payload against the descriptor;
    /// the store records the descriptor's checksum as the bundle identity.
    pub fn put(&self, payload: &Path, descriptor: &BundleDescriptor) -> Result<BundleRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.active.as_deref() == Some(descriptor.version.as_str()) {
            return Err(StoreError::ReplaceActive(descriptor.version.clone()));
        }

        let version_dir = self.version_dir(&descriptor.version);
        let staging_dir = self.staging_dir(&descriptor.version);
        let final_path = version_dir.join(PAYLOAD_FILE);

        // Write-ahead marker: a crash from here on is detected on open.
        let record = BundleRecord {
            version: descriptor.version.clone(),
            path: final_path.clone(),
            checksum: descriptor.checksum.clone(),
            size: descriptor.size,
            status: BundleStatus::Pending,
            installed_at: Utc::now(),
            confirmed_good: false,
        };
        inner
            .registry
            .records
            .insert(descriptor.version.clone(), record.clone());
        self.persist_registry(&inner)?;

        let staged = stage_and_promote(payload, &staging_dir, &version_dir);
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging_dir);
            inner.registry.records.remove(&descriptor.version);
            let _ = self.persist_registry(&inner);
            return Err(e);
        }

        let record = inner
            .registry
            .records
            .get_mut(&descriptor.version)
            .expect("record inserted above");
        record.status = BundleStatus::Verified;
        let record = record.clone();
        self.persist_registry(&inner)?;
        info!(version = %descriptor.version, "Bundle installed");
        Ok(record)
    }

    /// Swap the active pointer to `version`. Idempotent for the version
    /// that is already active. On any error the previous pointer is intact.
    pub fn activate(&self, version: &str) -> Result<(), StoreError> {
        let inner = self.inner.lock().unwrap();
        self.swap_to(inner, version, BundleStatus::Verified)
    }

    /// Point the store back at a previously active record. Same atomic swap
    /// as [`BundleStore::activate`]; the record it displaces is marked
    /// `RolledBack` instead of `Verified`.
    pub fn rollback_to(&self, version: &str) -> Result<(), StoreError> {
        let inner = self.inner.lock().unwrap();
        self.swap_to(inner, version, BundleStatus::RolledBack)
    }

    fn swap_to(
        &self,
        mut inner: MutexGuard<'_, StoreInner>,
        version: &str,
        demote_to: BundleStatus,
    ) -> Result<(), StoreError> {
        let record = inner
            .registry
            .records
            .get(version)
            .ok_or_else(|| StoreError::UnknownVersion(version.to_string()))?;
        match record.status {
            BundleStatus::Verified | BundleStatus::Active => {}
            other => {
                return Err(StoreError::NotActivatable {
                    version: version.to_string(),
                    status: other.as_str().to_string(),
                })
            }
        }

        if inner.active.as_deref() == Some(version) {
            let record = record.clone();
            *self.active_cache.write().unwrap() = Some(record);
            return Ok(());
        }

        // The one atomic step: everything before this is read-only,
        // everything after is recoverable bookkeeping.
        self.write_pointer(ACTIVE_POINTER_FILE, version)?;

        let prev = inner.active.replace(version.to_string());
        if let Some(prev) = prev {
            if let Some(prev_record) = inner.registry.records.get_mut(&prev) {
                prev_record.status = demote_to;
            }
        }
        let record = inner
            .registry
            .records
            .get_mut(version)
            .expect("checked above");
        record.status = BundleStatus::Active;
        let record = record.clone();

        // The pointer already swapped; a registry write failure here is
        // repaired by open-time reconciliation, not surfaced as a failed
        // activation.
        if let Err(e) = self.persist_registry(&inner) {
            warn!("Registry write failed after pointer swap: {e}");
        }
        *self.active_cache.write().unwrap() = Some(record);
        info!(version, "Active pointer swapped");
        Ok(())
    }

    /// Clear the active pointer after a first-install rollback, when there
    /// is no prior record to return to and resolution falls back to the
    /// bundle shipped with the host.
    pub fn deactivate(&self, failed_version: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.as_deref() != Some(failed_version) {
            warn!(failed_version, "Deactivate skipped: version is not active");
            return Ok(());
        }
        let pointer = self.root.join(ACTIVE_POINTER_FILE);
        if pointer.exists() {
            fs::remove_file(&pointer)?;
        }
        inner.active = None;
        if let Some(record) = inner.registry.records.get_mut(failed_version) {
            record.status = BundleStatus::RolledBack;
        }
        if let Err(e) = self.persist_registry(&inner) {
            warn!("Registry write failed after deactivation: {e}");
        }
        *self.active_cache.write().unwrap() = None;
        info!(failed_version, "Active pointer cleared");
        Ok(())
    }

    /// The record the active pointer currently designates. Never blocks on
    /// store mutations. `None` until the first activation.
    pub fn current(&self) -> Option<BundleRecord> {
        self.active_cache.read().unwrap().clone()
    }

    pub fn get(&self, version: &str) -> Option<BundleRecord> {
        self.inner.lock().unwrap().registry.records.get(version).cloned()
    }

    pub fn records(&self) -> Vec<BundleRecord> {
        self.inner.lock().unwrap().registry.records.values().cloned().collect()
    }

    /// Mark a version confirmed-good and atomically update the `CONFIRMED`
    /// pointer, making it the preferred rollback target.
    pub fn mark_confirmed(&self, version: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.registry.records.contains_key(version) {
            return Err(StoreError::UnknownVersion(version.to_string()));
        }
        self.write_pointer(CONFIRMED_POINTER_FILE, version)?;
        inner.confirmed = Some(version.to_string());
        let record = inner
            .registry
            .records
            .get_mut(version)
            .expect("checked above");
        record.confirmed_good = true;
        let record = record.clone();
        self.persist_registry(&inner)?;
        if inner.active.as_deref() == Some(version) {
            *self.active_cache.write().unwrap() = Some(record);
        }
        info!(version, "Bundle confirmed good");
        Ok(())
    }

    pub fn last_confirmed(&self) -> Option<BundleRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .confirmed
            .as_ref()
            .and_then(|v| inner.registry.records.get(v))
            .cloned()
    }

    /// Guard `version` from pruning while its successor awaits confirmation.
    pub fn set_protected_prior(&self, version: Option<String>) {
        self.inner.lock().unwrap().protected_prior = version;
    }

    /// Delete records per the retention policy. The active target, the
    /// confirmed target and a guarded prior-active record are never removed.
    pub fn prune(&self, policy: &PrunePolicy) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let mut keep: Vec<String> = Vec::new();
        keep.extend(inner.active.clone());
        keep.extend(inner.confirmed.clone());
        keep.extend(inner.protected_prior.clone());

        if let PrunePolicy::RetainLatest(n) = policy {
            let mut by_age: Vec<&BundleRecord> = inner.registry.records.values().collect();
            by_age.sort_by(|a, b| b.installed_at.cmp(&a.installed_at));
            keep.extend(by_age.iter().take(*n).map(|r| r.version.clone()));
        }

        let cutoff = match policy {
            PrunePolicy::OlderThan(age) => Some(Utc::now() - *age),
            PrunePolicy::RetainLatest(_) => None,
        };

        let doomed: Vec<String> = inner
            .registry
            .records
            .values()
            .filter(|r| !keep.contains(&r.version))
            .filter(|r| match cutoff {
                Some(cutoff) => r.installed_at < cutoff,
                None => true,
            })
            .map(|r| r.version.clone())
            .collect();

        let mut removed = 0;
        for version in doomed {
            let dir = self.version_dir(&version);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            inner.registry.records.remove(&version);
            removed += 1;
            debug!(version = %version, "Pruned bundle");
        }
        if removed > 0 {
            self.persist_registry(&inner)?;
        }
        Ok(removed)
    }

    // --- crash history ----------------------------------------------------

    pub fn is_crashed(&self, version: &str) -> bool {
        self.inner.lock().unwrap().crash_history.contains(version)
    }

    pub fn record_crash(&self, version: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.crash_history.add(version);
        if let Err(e) = persist_crash_history(&self.root, &inner.crash_history) {
            warn!("Failed to persist crash history: {e}");
        }
    }

    pub fn crash_history(&self) -> CrashHistory {
        self.inner.lock().unwrap().crash_history.clone()
    }

    pub fn clear_crash_history(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.crash_history = CrashHistory::default();
        if let Err(e) = persist_crash_history(&self.root, &inner.crash_history) {
            warn!("Failed to persist crash history: {e}");
        }
    }

    // --- paths and persistence -------------------------------------------

    fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join(BUNDLES_DIR).join(version)
    }

    fn staging_dir(&self, version: &str) -> PathBuf {
        self.root
            .join(BUNDLES_DIR)
            .join(format!("{version}{STAGING_SUFFIX}"))
    }

    fn write_pointer(&self, name: &str, version: &str) -> Result<(), StoreError> {
        let path = self.root.join(name);
        let tmp = self.root.join(format!("{name}.new"));
        fs::write(&tmp, format!("{version}\n"))?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn persist_registry(&self, inner: &StoreInner) -> Result<(), StoreError> {
        let path = self.root.join(RECORDS_FILE);
        let tmp = self.root.join(format!("{RECORDS_FILE}.new"));
        fs::write(&tmp, serde_json::to_string_pretty(&inner.registry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Copy the payload into staging and promote it with one rename.
fn stage_and_promote(payload: &Path, staging_dir: &Path, version_dir: &Path) -> Result<(), StoreError> {
    if staging_dir.exists() {
        fs::remove_dir_all(staging_dir)?;
    }
    fs::create_dir_all(staging_dir)?;
    fs::copy(payload, staging_dir.join(PAYLOAD_FILE))?;
    if version_dir.exists() {
        fs::remove_dir_all(version_dir)?;
    }
    fs::rename(staging_dir, version_dir)?;
    Ok(())
}

fn sweep_staging(bundles: &Path) {
    let Ok(entries) = fs::read_dir(bundles) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(STAGING_SUFFIX) && entry.path().is_dir() {
            warn!(dir = %name, "Removing stale staging directory");
            let _ = fs::remove_dir_all(entry.path());
        }
    }
}

fn remove_stale_pointer_temps(root: &Path) {
    for name in [ACTIVE_POINTER_FILE, CONFIRMED_POINTER_FILE, RECORDS_FILE] {
        let tmp = root.join(format!("{name}.new"));
        if tmp.exists() {
            let _ = fs::remove_file(tmp);
        }
    }
}

fn load_registry(root: &Path) -> RecordRegistry {
    let path = root.join(RECORDS_FILE);
    if !path.exists() {
        return RecordRegistry::default();
    }
    match fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(registry) => registry,
            Err(e) => {
                warn!("Record registry unreadable, rebuilding from pointers: {e}");
                RecordRegistry::default()
            }
        },
        Err(e) => {
            warn!("Record registry unreadable, rebuilding from pointers: {e}");
            RecordRegistry::default()
        }
    }
}

fn rebuild_record(
    version: &str,
    payload: &Path,
    confirmed: Option<&str>,
) -> Result<BundleRecord, StoreError> {
    let size = fs::metadata(payload)?.len();
    let checksum = sha256_file(payload)?;
    Ok(BundleRecord {
        version: version.to_string(),
        path: payload.to_path_buf(),
        checksum,
        size,
        status: BundleStatus::Active,
        installed_at: Utc::now(),
        confirmed_good: confirmed == Some(version),
    })
}

/// Pick a replacement for a broken active pointer: the confirmed record if
/// it is usable, otherwise nothing. The pointer file follows the decision.
fn fall_back_pointer(
    root: &Path,
    registry: &RecordRegistry,
    confirmed: Option<&str>,
) -> Option<String> {
    let fallback = confirmed.and_then(|v| {
        registry
            .records
            .get(v)
            .filter(|r| r.status != BundleStatus::Corrupt)
            .map(|r| r.version.clone())
    });
    match &fallback {
        Some(version) => {
            let tmp = root.join(format!("{ACTIVE_POINTER_FILE}.new"));
            if fs::write(&tmp, format!("{version}\n")).is_ok() {
                let _ = fs::rename(&tmp, root.join(ACTIVE_POINTER_FILE));
            }
        }
        None => {
            let _ = fs::remove_file(root.join(ACTIVE_POINTER_FILE));
        }
    }
    fallback
}

fn read_pointer(root: &Path, name: &str) -> Option<String> {
    let content = fs::read_to_string(root.join(name)).ok()?;
    let version = content.trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

fn load_crash_history(root: &Path) -> CrashHistory {
    let path = root.join(CRASH_HISTORY_FILE);
    if !path.exists() {
        return CrashHistory::default();
    }
    fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

fn persist_crash_history(root: &Path, history: &CrashHistory) -> Result<(), StoreError> {
    let path = root.join(CRASH_HISTORY_FILE);
    let tmp = root.join(format!("{CRASH_HISTORY_FILE}.new"));
    fs::write(&tmp, serde_json::to_string_pretty(history)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn gzip_bytes(content: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    fn descriptor_for(version: &str, bytes: &[u8]) -> BundleDescriptor {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        BundleDescriptor {
            version: version.to_string(),
            url: format!("http://localhost/bundles/{version}"),
            checksum: hex::encode(hasher.finalize()),
            size: bytes.len() as u64,
        }
    }

    fn install(store: &BundleStore, temp: &TempDir, version: &str) -> BundleRecord {
        let bytes = gzip_bytes(format!("bundle {version}").as_bytes());
        let payload = temp.path().join(format!("payload-{version}.gz"));
        fs::write(&payload, &bytes).unwrap();
        store.put(&payload, &descriptor_for(version, &bytes)).unwrap()
    }

    #[test]
    fn put_then_activate_sets_current() {
        let temp = TempDir::new().unwrap();
        let store = BundleStore::open(temp.path().join("store")).unwrap();
        let record = install(&store, &temp, "1.0.0");
        assert_eq!(record.status, BundleStatus::Verified);
        assert!(store.current().is_none());

        store.activate("1.0.0").unwrap();
        let current = store.current().unwrap();
        assert_eq!(current.version, "1.0.0");
        assert_eq!(current.status, BundleStatus::Active);
    }

    #[test]
    fn activate_unknown_version_fails_without_moving_pointer() {
        let temp = TempDir::new().unwrap();
        let store = BundleStore::open(temp.path().join("store")).unwrap();
        install(&store, &temp, "1.0.0");
        store.activate("1.0.0").unwrap();

        let err = store.activate("9.9.9").unwrap_err();
        assert!(matches!(err, StoreError::UnknownVersion(_)));
        assert_eq!(store.current().unwrap().version, "1.0.0");
    }

    #[test]
    fn rollback_demotes_failed_record() {
        let temp = TempDir::new().unwrap();
        let store = BundleStore::open(temp.path().join("store")).unwrap();
        install(&store, &temp, "1.0.0");
        install(&store, &temp, "1.1.0");
        store.activate("1.0.0").unwrap();
        store.activate("1.1.0").unwrap();

        store.rollback_to("1.0.0").unwrap();
        assert_eq!(store.current().unwrap().version, "1.0.0");
        assert_eq!(store.get("1.1.0").unwrap().status, BundleStatus::RolledBack);
        // retained for diagnostics, not deleted
        assert!(store.get("1.1.0").unwrap().path.exists());
    }

    #[test]
    fn put_refuses_to_replace_the_active_bundle() {
        let temp = TempDir::new().unwrap();
        let store = BundleStore::open(temp.path().join("store")).unwrap();
        install(&store, &temp, "1.0.0");
        store.activate("1.0.0").unwrap();

        let bytes = gzip_bytes(b"other");
        let payload = temp.path().join("other.gz");
        fs::write(&payload, &bytes).unwrap();
        let err = store.put(&payload, &descriptor_for("1.0.0", &bytes)).unwrap_err();
        assert!(matches!(err, StoreError::ReplaceActive(_)));
    }

    #[test]
    fn confirmed_pointer_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("store");
        {
            let store = BundleStore::open(&root).unwrap();
            install(&store, &temp, "1.0.0");
            store.activate("1.0.0").unwrap();
            store.mark_confirmed("1.0.0").unwrap();
        }
        let store = BundleStore::open(&root).unwrap();
        let confirmed = store.last_confirmed().unwrap();
        assert_eq!(confirmed.version, "1.0.0");
        assert!(confirmed.confirmed_good);
    }

    #[test]
    fn prune_retains_active_confirmed_and_guarded_records() {
        let temp = TempDir::new().unwrap();
        let store = BundleStore::open(temp.path().join("store")).unwrap();
        for v in ["1.0.0", "1.1.0", "1.2.0", "1.3.0"] {
            install(&store, &temp, v);
        }
        store.activate("1.0.0").unwrap();
        store.mark_confirmed("1.0.0").unwrap();
        store.activate("1.3.0").unwrap();
        store.set_protected_prior(Some("1.0.0".to_string()));

        let removed = store.prune(&PrunePolicy::RetainLatest(0)).unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("1.0.0").is_some());
        assert!(store.get("1.3.0").is_some());
        assert!(store.get("1.1.0").is_none());
        assert!(store.get("1.2.0").is_none());
    }

    #[test]
    fn prune_by_age_keeps_recent_records() {
        let temp = TempDir::new().unwrap();
        let store = BundleStore::open(temp.path().join("store")).unwrap();
        install(&store, &temp, "1.0.0");
        install(&store, &temp, "1.1.0");
        store.activate("1.1.0").unwrap();

        // nothing is old enough to prune
        let removed = store.prune(&PrunePolicy::OlderThan(chrono::Duration::hours(1))).unwrap();
        assert_eq!(removed, 0);
        assert!(store.get("1.0.0").is_some());
    }

    #[test]
    fn crash_history_deduplicates_and_clears() {
        let temp = TempDir::new().unwrap();
        let store = BundleStore::open(temp.path().join("store")).unwrap();
        store.record_crash("2.0.0");
        store.record_crash("2.0.0");
        assert_eq!(store.crash_history().entries.len(), 1);
        assert!(store.is_crashed("2.0.0"));

        store.clear_crash_history();
        assert!(!store.is_crashed("2.0.0"));
    }

    #[test]
    fn crash_history_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("store");
        {
            let store = BundleStore::open(&root).unwrap();
            store.record_crash("2.0.0");
        }
        let store = BundleStore::open(&root).unwrap();
        assert!(store.is_crashed("2.0.0"));
    }
}
