//! Persisted trust store for SSH server host keys.
//!
//! Each entry pins the SHA-256 fingerprint of a server's host key,
//! keyed by a djb2 hash of `host:port`. Verification is a byte-wise
//! comparison of lower-hex fingerprint strings; a mismatch means the
//! server presented a different key than the one trusted on first use
//! and must be treated as a security event.
//!
//! Storage follows the arbiter's tiering: the local KV copy is written
//! synchronously on every mutation and removable storage is mirrored
//! best-effort. At startup the removable directory wins over the KV
//! copy, and the KV copy is rewritten to match.

use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use russh::keys::{Algorithm, EcdsaCurve, HashAlg, PublicKey};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::now_epoch_s;
use crate::error::{Error, Result};
use crate::storage::{LoadedFrom, StorageArbiter};

/// Entity-kind directory name on removable storage.
const ENTITY_KIND: &str = "known_hosts";

/// KV key prefix. The full key is `h_` + zero-padded djb2 hex.
const KEY_PREFIX: &str = "h_";

/// Outcome of a host-key verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The presented fingerprint matches the pinned one.
    Ok,
    /// No entry exists for this host and port.
    NotFound,
    /// An entry exists and the fingerprint differs. Security event.
    Mismatch,
}

/// One pinned host key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KnownHostEntry {
    pub host: String,
    pub port: u16,
    /// SHA-256 of the host-key blob, 64 lower-hex characters.
    pub fingerprint: String,
    /// Human-readable key type tag, e.g. `RSA` or `ECDSA-256`.
    pub key_type: String,
    /// Numeric key type code kept for export compatibility.
    #[serde(rename = "type")]
    pub type_code: u32,
    /// Epoch seconds at which the entry was added.
    pub added_time: u64,
}

/// djb2 over the bytes of `s`.
fn djb2(s: &str) -> u32 {
    s.bytes()
        .fold(5381u32, |h, c| h.wrapping_mul(33).wrapping_add(u32::from(c)))
}

/// Renders raw SHA-256 digest bytes as the canonical 64-char lower-hex
/// fingerprint string.
pub fn hex_fingerprint(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// SHA-256 fingerprint of a server public key, canonical form.
pub fn public_key_fingerprint(key: &PublicKey) -> String {
    let fp = key.fingerprint(HashAlg::Sha256);
    hex_fingerprint(fp.as_bytes())
}

/// SHA-256 fingerprint of a raw host-key blob.
pub fn blob_fingerprint(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    hex_fingerprint(&hasher.finalize())
}

/// Key-type tag and numeric code for a server public key.
pub fn key_type_tag(key: &PublicKey) -> (&'static str, u32) {
    match key.algorithm() {
        Algorithm::Rsa { .. } => ("RSA", 1),
        Algorithm::Dsa => ("DSS", 2),
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        } => ("ECDSA-256", 3),
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP384,
        } => ("ECDSA-384", 4),
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP521,
        } => ("ECDSA-521", 5),
        Algorithm::Ed25519 => ("ED25519", 6),
        _ => ("UNKNOWN", 0),
    }
}

fn validate_fingerprint(fingerprint: &str) -> Result<String> {
    let normalized = fingerprint.to_ascii_lowercase();
    if normalized.len() != 64 || !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidArgument(format!(
            "fingerprint must be 64 hex chars, got {} chars",
            fingerprint.len()
        )));
    }
    Ok(normalized)
}

/// Persisted host-key trust store.
pub struct KnownHostsStore {
    arbiter: Arc<StorageArbiter>,
    // Serializes multi-step KV/mirror sequences.
    lock: Mutex<()>,
}

impl KnownHostsStore {
    pub fn new(arbiter: Arc<StorageArbiter>) -> Self {
        Self {
            arbiter,
            lock: Mutex::new(()),
        }
    }

    /// Storage key: `h_` + zero-padded djb2 hex of `host:port`.
    pub fn storage_key(host: &str, port: u16) -> String {
        format!("{KEY_PREFIX}{:08x}", djb2(&format!("{host}:{port}")))
    }

    /// Removable file stem: host with `.`/`:` replaced by `_`, then port.
    fn file_stem(host: &str, port: u16) -> String {
        format!("{}_{port}", host.replace(['.', ':'], "_"))
    }

    /// Verifies a presented fingerprint against the pinned entry.
    pub fn verify(
        &self,
        host: &str,
        port: u16,
        presented_fingerprint: &str,
        key_type: &str,
    ) -> Result<VerifyOutcome> {
        let presented = validate_fingerprint(presented_fingerprint)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = self.get_locked(host, port)? else {
            debug!("host {host}:{port} not in trust store");
            return Ok(VerifyOutcome::NotFound);
        };
        if entry.fingerprint == presented {
            debug!("host key verified for {host}:{port} ({key_type})");
            Ok(VerifyOutcome::Ok)
        } else {
            error!(
                "HOST KEY MISMATCH for {host}:{port}: pinned {} presented {presented} — possible man-in-the-middle",
                entry.fingerprint
            );
            Ok(VerifyOutcome::Mismatch)
        }
    }

    /// Pins a fingerprint, replacing any previous entry for the host.
    pub fn add(&self, host: &str, port: u16, fingerprint: &str, key_type: &str) -> Result<()> {
        let (_, type_code) = KNOWN_TYPE_CODES
            .iter()
            .find(|(tag, _)| *tag == key_type)
            .copied()
            .unwrap_or(("UNKNOWN", 0));
        let entry = KnownHostEntry {
            host: host.to_string(),
            port,
            fingerprint: validate_fingerprint(fingerprint)?,
            key_type: key_type.to_string(),
            type_code,
            added_time: now_epoch_s(),
        };
        let blob = serde_json::to_vec(&entry)
            .map_err(|e| Error::Parse(format!("known-host encode: {e}")))?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.arbiter
            .kv()
            .put(&Self::storage_key(host, port), &blob)?;
        self.arbiter
            .mirror_entity(ENTITY_KIND, &Self::file_stem(host, port), &blob);
        info!("pinned host key for {host}:{port} ({key_type})");
        Ok(())
    }

    pub fn remove(&self, host: &str, port: u16) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.arbiter.kv().delete(&Self::storage_key(host, port))? {
            return Err(Error::NotFound(format!("{host}:{port}")));
        }
        self.arbiter
            .remove_mirror(ENTITY_KIND, &Self::file_stem(host, port));
        Ok(())
    }

    pub fn get(&self, host: &str, port: u16) -> Result<Option<KnownHostEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.get_locked(host, port)
    }

    fn get_locked(&self, host: &str, port: u16) -> Result<Option<KnownHostEntry>> {
        match self.arbiter.kv().get(&Self::storage_key(host, port))? {
            Some(blob) => {
                let entry: KnownHostEntry = serde_json::from_slice(&blob)
                    .map_err(|e| Error::Parse(format!("known-host decode: {e}")))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<KnownHostEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for (key, blob) in self.arbiter.kv().list_prefix(KEY_PREFIX)? {
            match serde_json::from_slice::<KnownHostEntry>(&blob) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!("skipping undecodable trust entry {key}: {e}"),
            }
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Removes every pinned entry from both tiers.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let entries = self.arbiter.kv().list_prefix(KEY_PREFIX)?;
        for (_, blob) in &entries {
            if let Ok(entry) = serde_json::from_slice::<KnownHostEntry>(blob) {
                self.arbiter
                    .remove_mirror(ENTITY_KIND, &Self::file_stem(&entry.host, entry.port));
            }
        }
        self.arbiter.kv().replace_prefix(KEY_PREFIX, Vec::new())?;
        info!("trust store cleared ({} entries)", entries.len());
        Ok(())
    }

    /// Startup load. The removable directory wins over the KV copy; a
    /// removable load rewrites the KV copy to match.
    pub fn load(&self) -> Result<LoadedFrom> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(files) = self.arbiter.load_entity_dir(ENTITY_KIND) {
            let mut entries = Vec::new();
            for (stem, blob) in files {
                match serde_json::from_slice::<KnownHostEntry>(&blob) {
                    Ok(entry) => {
                        let key = Self::storage_key(&entry.host, entry.port);
                        entries.push((key, blob));
                    }
                    Err(e) => warn!("skipping undecodable trust file {stem}.json: {e}"),
                }
            }
            let count = entries.len();
            self.arbiter.kv().replace_prefix(KEY_PREFIX, entries)?;
            info!("trust store loaded from removable storage ({count} entries)");
            return Ok(LoadedFrom::RemovableDir);
        }
        let count = self.arbiter.kv().count_prefix(KEY_PREFIX)?;
        if count > 0 {
            info!("trust store loaded from local kv ({count} entries)");
            Ok(LoadedFrom::LocalKv)
        } else {
            Ok(LoadedFrom::Empty)
        }
    }
}

const KNOWN_TYPE_CODES: &[(&str, u32)] = &[
    ("RSA", 1),
    ("DSS", 2),
    ("ECDSA-256", 3),
    ("ECDSA-384", 4),
    ("ECDSA-521", 5),
    ("ED25519", 6),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KvStore, RemovableLayout};

    const FP_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const FP_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn mem_store() -> KnownHostsStore {
        let kv = Arc::new(KvStore::in_memory().expect("kv"));
        KnownHostsStore::new(Arc::new(StorageArbiter::new(kv, None)))
    }

    #[test]
    fn trust_on_first_use_flow() {
        let store = mem_store();
        assert_eq!(
            store.verify("10.0.0.5", 22, FP_A, "RSA").expect("verify"),
            VerifyOutcome::NotFound
        );
        store.add("10.0.0.5", 22, FP_A, "RSA").expect("add");
        assert_eq!(
            store.verify("10.0.0.5", 22, FP_A, "RSA").expect("verify"),
            VerifyOutcome::Ok
        );
        assert_eq!(
            store.verify("10.0.0.5", 22, FP_B, "RSA").expect("verify"),
            VerifyOutcome::Mismatch
        );
    }

    #[test]
    fn add_then_list_reports_exact_entry() {
        let store = mem_store();
        store.add("agx.local", 2222, FP_A, "ECDSA-256").expect("add");
        let entries = store.list().expect("list");
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.host, "agx.local");
        assert_eq!(entry.port, 2222);
        assert_eq!(entry.fingerprint, FP_A);
        assert_eq!(entry.key_type, "ECDSA-256");
        assert_eq!(entry.type_code, 3);
        assert!(entry.added_time > 0);
    }

    #[test]
    fn fingerprints_normalize_to_lower_hex() {
        let store = mem_store();
        store
            .add("h", 22, &FP_A.to_ascii_uppercase(), "RSA")
            .expect("add");
        assert_eq!(
            store.verify("h", 22, FP_A, "RSA").expect("verify"),
            VerifyOutcome::Ok
        );
        let err = store.verify("h", 22, "abcd", "RSA").expect_err("short");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn sequential_digest_formats_to_expected_literal() {
        let digest: Vec<u8> = (1u8..=0x20).collect();
        assert_eq!(
            hex_fingerprint(&digest),
            "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20"
        );
    }

    #[test]
    fn storage_key_shape_is_stable() {
        let key = KnownHostsStore::storage_key("10.0.0.5", 22);
        assert!(key.starts_with("h_"));
        assert_eq!(key.len(), 10);
        assert_eq!(key, KnownHostsStore::storage_key("10.0.0.5", 22));
        assert_ne!(key, KnownHostsStore::storage_key("10.0.0.5", 23));
    }

    #[test]
    fn remove_and_clear() {
        let store = mem_store();
        store.add("a", 22, FP_A, "RSA").expect("add");
        store.add("b", 22, FP_B, "RSA").expect("add");
        store.remove("a", 22).expect("remove");
        assert!(matches!(
            store.remove("a", 22).expect_err("gone"),
            Error::NotFound(_)
        ));
        assert_eq!(store.count().expect("count"), 1);
        store.clear().expect("clear");
        assert_eq!(store.count().expect("count"), 0);
    }

    #[test]
    fn removable_tier_wins_and_rewrites_kv() {
        let tmp = tempfile::tempdir().expect("tmpdir");
        let kv = Arc::new(KvStore::in_memory().expect("kv"));
        let arbiter = Arc::new(StorageArbiter::new(
            kv,
            Some(RemovableLayout::new(tmp.path())),
        ));

        // Seed the KV tier with a stale pin for the same host.
        let store = KnownHostsStore::new(arbiter.clone());
        store.add("10.0.0.5", 22, FP_B, "RSA").expect("add");

        // Removable copy carries the authoritative pin.
        let dir = tmp.path().join("config/known_hosts");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let entry = KnownHostEntry {
            host: "10.0.0.5".to_string(),
            port: 22,
            fingerprint: FP_A.to_string(),
            key_type: "RSA".to_string(),
            type_code: 1,
            added_time: 1,
        };
        std::fs::write(
            dir.join("10_0_0_5_22.json"),
            serde_json::to_vec(&entry).expect("encode"),
        )
        .expect("write");

        assert_eq!(store.load().expect("load"), LoadedFrom::RemovableDir);
        assert_eq!(
            store.verify("10.0.0.5", 22, FP_A, "RSA").expect("verify"),
            VerifyOutcome::Ok
        );
        // KV was overwritten to match the removable copy.
        assert_eq!(
            store
                .get("10.0.0.5", 22)
                .expect("get")
                .expect("entry")
                .fingerprint,
            FP_A
        );
    }
}
