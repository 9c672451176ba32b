//! Load-priority and write-through arbitration between the persistence
//! tiers.
//!
//! Read priority: removable per-entity directory, then removable legacy
//! single file, then the local KV store. Every write hits the KV store
//! synchronously (callers own that step); the arbiter mirrors writes to
//! removable storage best-effort and tracks a pending-sync flag while
//! the medium is absent.
//!
//! When an entity file has an encrypted sibling (`name.json.enc`), the
//! plain file is skipped. With a configured passphrase the bundle is
//! decrypted; without one the entry is treated as unreadable.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::encrypt::{decrypt_bundle, ENC_SUFFIX};
use crate::storage::KvStore;

/// Directory layout of the removable-storage tier.
#[derive(Debug, Clone)]
pub struct RemovableLayout {
    root: PathBuf,
}

impl RemovableLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// True while the medium is present.
    pub fn is_mounted(&self) -> bool {
        self.root.is_dir()
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Per-entity directory, e.g. `<root>/config/rules/`.
    pub fn entity_dir(&self, kind: &str) -> PathBuf {
        self.config_dir().join(kind)
    }

    /// Legacy single-file location, e.g. `<root>/config/rules.json`.
    pub fn legacy_file(&self, kind: &str) -> PathBuf {
        self.config_dir().join(format!("{kind}.json"))
    }
}

/// Which tier satisfied a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedFrom {
    RemovableDir,
    RemovableLegacy,
    LocalKv,
    Empty,
}

/// Arbitrates between the local KV store and removable storage.
pub struct StorageArbiter {
    kv: Arc<KvStore>,
    removable: Option<RemovableLayout>,
    bundle_passphrase: Option<String>,
    pending_sync: AtomicBool,
}

impl StorageArbiter {
    pub fn new(kv: Arc<KvStore>, removable: Option<RemovableLayout>) -> Self {
        Self {
            kv,
            removable,
            bundle_passphrase: None,
            pending_sync: AtomicBool::new(false),
        }
    }

    /// Configures the passphrase used to open `.enc` bundle siblings.
    pub fn with_bundle_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.bundle_passphrase = Some(passphrase.into());
        self
    }

    /// The synchronous tier. All writes land here first.
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn removable(&self) -> Option<&RemovableLayout> {
        self.removable.as_ref()
    }

    /// True when a removable mirror write was skipped or failed and the
    /// medium needs a re-export once present.
    pub fn pending_sync(&self) -> bool {
        self.pending_sync.load(Ordering::Relaxed)
    }

    pub fn clear_pending_sync(&self) {
        self.pending_sync.store(false, Ordering::Relaxed);
    }

    /// Reads one entity file, honoring the encrypted-sibling rule.
    ///
    /// `path` is the plain `.json` location; returns `None` when neither
    /// the plain file nor a readable bundle exists.
    pub fn read_entity_file(&self, path: &Path) -> Option<Vec<u8>> {
        let enc_path = PathBuf::from(format!("{}{ENC_SUFFIX}", path.display()));
        if enc_path.is_file() {
            // Plain sibling is skipped by design once a bundle exists.
            let Some(passphrase) = self.bundle_passphrase.as_deref() else {
                warn!(
                    "encrypted bundle {} present but no passphrase configured; skipping",
                    enc_path.display()
                );
                return None;
            };
            let content = match fs::read_to_string(&enc_path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("cannot read bundle {}: {e}", enc_path.display());
                    return None;
                }
            };
            return match decrypt_bundle(&content, passphrase) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("cannot decrypt bundle {}: {e}", enc_path.display());
                    None
                }
            };
        }
        match fs::read(path) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("cannot read {}: {e}", path.display());
                None
            }
        }
    }

    /// Loads every `.json` entity under `<removable>/config/<kind>/`,
    /// keyed by file stem. `None` when the medium or directory is absent
    /// or empty.
    pub fn load_entity_dir(&self, kind: &str) -> Option<Vec<(String, Vec<u8>)>> {
        let layout = self.removable.as_ref().filter(|l| l.is_mounted())?;
        let dir = layout.entity_dir(kind);
        let read_dir = fs::read_dir(&dir).ok()?;
        let mut entries = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Bundles are picked up through their plain-path stem below;
            // a bundle without a plain sibling is read via its own stem.
            let stem = if let Some(stem) = name.strip_suffix(".json") {
                stem.to_string()
            } else if let Some(stem) = name.strip_suffix(&format!(".json{ENC_SUFFIX}")) {
                if dir.join(format!("{stem}.json")).is_file() {
                    continue;
                }
                stem.to_string()
            } else {
                continue;
            };
            if let Some(data) = self.read_entity_file(&dir.join(format!("{stem}.json"))) {
                entries.push((stem, data));
            }
        }
        if entries.is_empty() {
            return None;
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Some(entries)
    }

    /// Loads the legacy single-file export for `kind`, if present.
    pub fn load_legacy_file(&self, kind: &str) -> Option<Vec<u8>> {
        let layout = self.removable.as_ref().filter(|l| l.is_mounted())?;
        self.read_entity_file(&layout.legacy_file(kind))
    }

    /// Best-effort mirror of one entity file to removable storage.
    /// Failures mark pending-sync; the KV copy is authoritative.
    pub fn mirror_entity(&self, kind: &str, stem: &str, data: &[u8]) {
        let Some(layout) = self.removable.as_ref() else {
            return;
        };
        if !layout.is_mounted() {
            self.pending_sync.store(true, Ordering::Relaxed);
            return;
        }
        let dir = layout.entity_dir(kind);
        let result = fs::create_dir_all(&dir)
            .and_then(|()| fs::write(dir.join(format!("{stem}.json")), data));
        if let Err(e) = result {
            warn!("mirror write failed for {kind}/{stem}: {e}");
            self.pending_sync.store(true, Ordering::Relaxed);
        }
    }

    /// Best-effort removal of one mirrored entity file.
    pub fn remove_mirror(&self, kind: &str, stem: &str) {
        let Some(layout) = self.removable.as_ref().filter(|l| l.is_mounted()) else {
            return;
        };
        let dir = layout.entity_dir(kind);
        for name in [format!("{stem}.json"), format!("{stem}.json{ENC_SUFFIX}")] {
            let path = dir.join(name);
            if path.is_file()
                && let Err(e) = fs::remove_file(&path)
            {
                warn!("mirror remove failed for {}: {e}", path.display());
            }
        }
    }

    /// Exports a whole entity set to the removable directory, replacing
    /// stale files. Used after a KV-tier load wins while the medium is
    /// mounted.
    pub fn export_entity_dir(&self, kind: &str, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let layout = self
            .removable
            .as_ref()
            .filter(|l| l.is_mounted())
            .ok_or_else(|| Error::InvalidState("removable storage not mounted".to_string()))?;
        let dir = layout.entity_dir(kind);
        fs::create_dir_all(&dir)?;
        // Drop stale plain exports not in the new set.
        if let Ok(read_dir) = fs::read_dir(&dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(stem) = name.strip_suffix(".json") else {
                    continue;
                };
                if !entries.iter().any(|(s, _)| s == stem) {
                    let _ = fs::remove_file(&path);
                }
            }
        }
        for (stem, data) in entries {
            fs::write(dir.join(format!("{stem}.json")), data)?;
        }
        debug!("exported {} {kind} entities to removable storage", entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::encrypt::encrypt_bundle;

    fn arbiter_with_dir(root: &Path) -> StorageArbiter {
        let kv = Arc::new(KvStore::in_memory().expect("kv"));
        StorageArbiter::new(kv, Some(RemovableLayout::new(root)))
    }

    #[test]
    fn dir_tier_wins_and_is_sorted() {
        let tmp = tempfile::tempdir().expect("tmpdir");
        let arbiter = arbiter_with_dir(tmp.path());
        let dir = tmp.path().join("config/rules");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("beta.json"), b"{\"id\":\"beta\"}").expect("write");
        fs::write(dir.join("alpha.json"), b"{\"id\":\"alpha\"}").expect("write");

        let entries = arbiter.load_entity_dir("rules").expect("entries");
        assert_eq!(entries[0].0, "alpha");
        assert_eq!(entries[1].0, "beta");
    }

    #[test]
    fn missing_medium_reports_none_and_marks_pending_sync() {
        let tmp = tempfile::tempdir().expect("tmpdir");
        let arbiter = arbiter_with_dir(&tmp.path().join("not-mounted"));
        assert!(arbiter.load_entity_dir("rules").is_none());
        assert!(!arbiter.pending_sync());
        arbiter.mirror_entity("rules", "alpha", b"{}");
        assert!(arbiter.pending_sync());
    }

    #[test]
    fn encrypted_sibling_shadows_plain_file() {
        let tmp = tempfile::tempdir().expect("tmpdir");
        let dir = tmp.path().join("config/rules");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("alpha.json"), b"plain").expect("write");
        let bundle = encrypt_bundle(b"sealed", "pw").expect("encrypt");
        fs::write(dir.join("alpha.json.enc"), bundle).expect("write");

        // Without a passphrase the entry is unreadable, not plain-read.
        let arbiter = arbiter_with_dir(tmp.path());
        assert!(arbiter.load_entity_dir("rules").is_none());

        let arbiter = arbiter_with_dir(tmp.path()).with_bundle_passphrase("pw");
        let entries = arbiter.load_entity_dir("rules").expect("entries");
        assert_eq!(entries, vec![("alpha".to_string(), b"sealed".to_vec())]);
    }

    #[test]
    fn legacy_file_is_second_tier() {
        let tmp = tempfile::tempdir().expect("tmpdir");
        let arbiter = arbiter_with_dir(tmp.path());
        fs::create_dir_all(tmp.path().join("config")).expect("mkdir");
        fs::write(tmp.path().join("config/rules.json"), b"[]").expect("write");
        assert_eq!(arbiter.load_legacy_file("rules"), Some(b"[]".to_vec()));
        assert!(arbiter.load_entity_dir("rules").is_none());
    }

    #[test]
    fn export_replaces_stale_entities() {
        let tmp = tempfile::tempdir().expect("tmpdir");
        let arbiter = arbiter_with_dir(tmp.path());
        let dir = tmp.path().join("config/rules");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("stale.json"), b"old").expect("write");

        arbiter
            .export_entity_dir("rules", &[("alpha".to_string(), b"new".to_vec())])
            .expect("export");
        assert!(!dir.join("stale.json").exists());
        assert_eq!(fs::read(dir.join("alpha.json")).expect("read"), b"new");
    }
}
