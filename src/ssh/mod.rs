//! SSH trust and execution core.
//!
//! This module owns the client side of the controller's SSH stack: the
//! transport state machine ([`SshSession`]), the interactive PTY shell,
//! the SFTP subsystem, the local port forwarder, and the session pool
//! used by SSH-backed rule actions.
//!
//! # Main Components
//!
//! - [`SshSession`] - connect/authenticate/exec/abort state machine
//! - [`Shell`] - interactive PTY shell on a connected session
//! - [`Sftp`] - file transfer subsystem
//! - [`PortForwarder`] - local TCP listener tunnelled over a channel
//! - [`SshSessionPool`] - cached automation sessions keyed by target

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use russh::Preferred;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config;
use crate::known_hosts::KnownHostsStore;

mod forward;
mod pool;
mod sftp;
mod shell;
mod transport;

pub use forward::{ForwardConfig, ForwardStats, PortForwarder};
pub use pool::{PoolTarget, SshSessionPool};
pub use sftp::{DirEntryInfo, FileStat, OpenFlags, Sftp, SftpDir, SftpFile, TransferProgress};
pub use shell::{Shell, ShellConfig, ShellInput, ShellRead, ShellSignal};
pub use transport::{ExecOutput, OutputSource, SshSession};

/// Default SSH TCP port.
pub const DEFAULT_PORT: u16 = 22;

/// Default connect / receive / send timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Abort-flag poll interval for blocking helpers.
pub const POLL_INTERVAL_MS: u64 = 100;

/// Input poll budget while the interactive shell is idle.
pub const SHELL_POLL_MS: u64 = 10;

/// Initial capacity of the exec stdout buffer.
pub const EXEC_STDOUT_INITIAL: usize = 4096;

/// Initial capacity of the exec stderr buffer.
pub const EXEC_STDERR_INITIAL: usize = 1024;

/// Transfer chunk size used by the SFTP subsystem.
pub const SFTP_CHUNK_SIZE: usize = 4096;

/// SSH algorithm negotiation profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Strict modern algorithms (default).
    #[default]
    Secure,
    /// Maximum compatibility with legacy embedded SSH daemons.
    LegacyCompatible,
}

impl SecurityLevel {
    pub(crate) fn preferred(self) -> Preferred {
        match self {
            SecurityLevel::Secure => Preferred {
                kex: Cow::Borrowed(config::SECURE_KEX_ORDER),
                key: Cow::Borrowed(config::SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(config::SECURE_CIPHERS),
                mac: Cow::Borrowed(config::SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(config::LEGACY_KEX_ORDER),
                key: Cow::Borrowed(config::LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(config::LEGACY_CIPHERS),
                mac: Cow::Borrowed(config::LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }
}

/// How unknown host keys are handled at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Only hosts already pinned in the trust store are accepted.
    #[default]
    Strict,
    /// Unknown hosts are accepted (optionally via the prompt hook) and
    /// pinned for future connections. Trust-on-first-use.
    AcceptNew,
    /// Every host key is accepted and nothing is pinned. Bring-up only.
    AcceptAll,
}

/// Host key facts handed to the accept-prompt hook.
#[derive(Debug, Clone)]
pub struct HostKeyInfo {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    /// 64-char lower-hex SHA-256 fingerprint.
    pub fingerprint: String,
}

/// Callback consulted before pinning an unknown host under
/// [`TrustPolicy::AcceptNew`]. Returning false rejects the connection.
pub type AcceptHook = Arc<dyn Fn(&HostKeyInfo) -> bool + Send + Sync>;

/// Trust-store wiring for a session.
#[derive(Clone, Default)]
pub struct TrustSettings {
    pub policy: TrustPolicy,
    pub store: Option<Arc<KnownHostsStore>>,
    pub accept_hook: Option<AcceptHook>,
}

impl fmt::Debug for TrustSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustSettings")
            .field("policy", &self.policy)
            .field("store", &self.store.is_some())
            .field("accept_hook", &self.accept_hook.is_some())
            .finish()
    }
}

/// Authentication material. Selection order: in-memory key buffer, then
/// key file, then password.
#[derive(Clone, Default)]
pub struct SshCredentials {
    pub password: Option<String>,
    /// Private key as an in-memory buffer (OpenSSH or PEM). Preferred;
    /// never touches the filesystem.
    pub key_data: Option<Zeroizing<Vec<u8>>>,
    pub key_path: Option<PathBuf>,
    pub key_passphrase: Option<String>,
}

impl SshCredentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    pub fn key_buffer(key_data: Zeroizing<Vec<u8>>, passphrase: Option<String>) -> Self {
        Self {
            key_data: Some(key_data),
            key_passphrase: passphrase,
            ..Self::default()
        }
    }
}

impl fmt::Debug for SshCredentials {
    // Secrets never reach log output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_data", &self.key_data.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Connection configuration for one SSH session.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: SshCredentials,
    pub security: SecurityLevel,
    /// Connect / receive / send timeout in milliseconds.
    pub timeout_ms: u64,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            credentials: SshCredentials::default(),
            security: SecurityLevel::Secure,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, credentials: SshCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// `user@host:port` label used in logs.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::{cipher, kex, mac};

    #[test]
    fn secure_profile_excludes_weak_algorithms() {
        let preferred = SecurityLevel::Secure.preferred();
        assert!(preferred.kex.iter().all(|alg| *alg != kex::DH_G1_SHA1));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::AES_128_CBC));
        assert!(preferred.mac.iter().all(|alg| *alg != mac::HMAC_SHA1));
    }

    #[test]
    fn legacy_profile_keeps_broad_compatibility_algorithms() {
        let preferred = SecurityLevel::LegacyCompatible.preferred();
        assert!(preferred.kex.contains(&kex::DH_G1_SHA1));
        assert!(preferred.cipher.contains(&cipher::AES_128_CBC));
        assert!(preferred.mac.contains(&mac::HMAC_SHA1));
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = SshCredentials::password("hunter2");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn config_defaults_match_contract() {
        let config = SshConfig::new("10.0.0.5", "root");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.target(), "root@10.0.0.5:22");
    }
}
