//! Cached SSH sessions for automation actions.
//!
//! SSH-backed rule actions fire repeatedly against the same few hosts;
//! reconnecting for every trigger would dominate action latency. The
//! pool caches connected sessions keyed by `user@host:port`, evicts
//! them after idle timeout, and re-validates credentials on every hit
//! by comparing SHA-256 digests so a password change in the variable
//! store forces a clean reconnect.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::ssh::{SshConfig, SshSession, TrustSettings};

/// Cached-session capacity.
const POOL_CAPACITY: u64 = 16;

/// Idle eviction window.
const POOL_IDLE: Duration = Duration::from_secs(5 * 60);

/// Cache key and credential digest for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTarget {
    pub key: String,
    digest: [u8; 32],
}

impl PoolTarget {
    fn of(config: &SshConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config.username.as_bytes());
        if let Some(password) = &config.credentials.password {
            hasher.update(b"pw");
            hasher.update(password.as_bytes());
        }
        if let Some(key_data) = &config.credentials.key_data {
            hasher.update(b"key");
            hasher.update(key_data.as_slice());
        }
        Self {
            key: config.target(),
            digest: hasher.finalize().into(),
        }
    }
}

/// Pool of connected automation sessions.
pub struct SshSessionPool {
    cache: Cache<String, Arc<Mutex<SshSession>>>,
    trust: TrustSettings,
}

impl SshSessionPool {
    pub fn new(trust: TrustSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(POOL_CAPACITY)
            .time_to_idle(POOL_IDLE)
            .build();
        Self { cache, trust }
    }

    /// Gets a cached connected session or establishes a new one.
    pub async fn get(&self, config: SshConfig) -> Result<Arc<Mutex<SshSession>>> {
        let target = PoolTarget::of(&config);

        if let Some(entry) = self.cache.get(&target.key).await {
            let reusable = {
                let guard = entry.lock().await;
                guard.is_connected() && PoolTarget::of(guard.config()) == target
            };
            if reusable {
                debug!("ssh pool hit: {}", target.key);
                return Ok(entry);
            }
            debug!("ssh pool entry stale, reconnecting: {}", target.key);
            if let Some(stale) = self.cache.get(&target.key).await {
                let mut guard = stale.lock().await;
                let _ = guard.disconnect().await;
            }
            self.cache.invalidate(&target.key).await;
        }

        let mut session = SshSession::new(config, self.trust.clone());
        session.connect().await?;
        let entry = Arc::new(Mutex::new(session));
        self.cache.insert(target.key.clone(), entry.clone()).await;
        debug!("ssh pool insert: {}", target.key);
        Ok(entry)
    }

    /// Drops one cached session, disconnecting it first.
    pub async fn invalidate(&self, key: &str) {
        if let Some(entry) = self.cache.get(key).await {
            let mut guard = entry.lock().await;
            let _ = guard.disconnect().await;
        }
        self.cache.invalidate(key).await;
    }

    /// Disconnects and drops every cached session.
    pub async fn shutdown(&self) {
        for (key, entry) in self.cache.iter() {
            let mut guard = entry.lock().await;
            let _ = guard.disconnect().await;
            drop(guard);
            self.cache.invalidate(key.as_ref()).await;
        }
    }
}
