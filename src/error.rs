//! Error types shared by every controller subsystem.
//!
//! One crate-level enum covers argument/state validation, the persistence
//! tiers, the SSH trust and execution core, and the rule engine. Library
//! errors from the SSH backend are wrapped rather than stringified so
//! callers can still match on them.

use thiserror::Error;

/// Errors that can occur across the controller core.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The named entity already exists and overwrite was not requested.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Buffer or deep-copy growth failed; prior state is left intact.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation observed the abort flag and unwound.
    #[error("aborted")]
    Aborted,

    /// The server rejected every offered authentication method.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The presented host key does not match the pinned fingerprint.
    ///
    /// Treat as a security event: the peer may not be the host that was
    /// trusted on first use.
    #[error("host key mismatch for {0} (possible man-in-the-middle)")]
    TrustMismatch(String),

    /// The request names a feature the backend cannot provide.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Stored or received data could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// A bounded store is full.
    #[error("exhausted: {0}")]
    Exhausted(String),

    /// Invariant violation inside the crate.
    #[error("internal error: {0}")]
    Internal(String),

    /// Host name resolution failed.
    #[error("resolve failed for {0}")]
    ResolveFailed(String),

    /// TCP connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// SSH protocol handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server refused to open a channel.
    #[error("channel open failed: {0}")]
    ChannelOpenFailed(String),

    /// Remote command execution failed before an exit status was seen.
    #[error("exec failed: {0}")]
    ExecFailed(String),

    /// The key material is syntactically valid but the backend cannot use it.
    #[error("key type unsupported: {0}")]
    KeyUnsupported(String),

    /// An error occurred in the russh library.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// An error occurred in the russh-sftp library.
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
}

impl Error {
    /// True for errors a caller may retry after reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Io(_) | Error::ConnectFailed(_)
        ) || matches!(
            self,
            Error::Ssh(russh::Error::Disconnect | russh::Error::SendError | russh::Error::IO(_))
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_mismatch_message_flags_security() {
        let err = Error::TrustMismatch("10.0.0.5:22".to_string());
        assert!(err.to_string().contains("man-in-the-middle"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout("connect".to_string()).is_transient());
        assert!(Error::Ssh(russh::Error::Disconnect).is_transient());
        assert!(!Error::AuthFailed("denied".to_string()).is_transient());
        assert!(!Error::TrustMismatch("host".to_string()).is_transient());
    }
}
