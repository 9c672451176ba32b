//! SSH client transport: connect, authenticate, execute, abort.
//!
//! One [`SshSession`] owns one TCP connection and one protocol session.
//! The lifecycle is a strict state machine (`Disconnected → Connecting →
//! Authenticating → Connected → Disconnected | Error`); any failure
//! during establishment rolls the session back to `Error` with the
//! socket closed and protocol state freed.
//!
//! Every blocking helper polls the session's abort flag at least every
//! [`POLL_INTERVAL_MS`](super::POLL_INTERVAL_MS) milliseconds, so a
//! concurrent [`SshSession::abort`] unwinds in-flight work promptly.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::known_hosts::{key_type_tag, public_key_fingerprint};
use crate::ssh::{
    HostKeyInfo, SessionState, SshConfig, TrustPolicy, TrustSettings, EXEC_STDERR_INITIAL,
    EXEC_STDOUT_INITIAL, POLL_INTERVAL_MS,
};

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// Captured output of a request/response command execution.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit status reported by the server, if any arrived before close.
    pub exit_code: Option<u32>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Host-key decision recorded by the handler during the handshake, used
/// to turn a generic handshake failure into the precise trust error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrustDecision {
    Accepted,
    AcceptedNew,
    RejectedMismatch,
    RejectedUnknown,
}

/// `russh` client handler wiring the handshake into the trust store.
pub(crate) struct TrustHandler {
    host: String,
    port: u16,
    trust: TrustSettings,
    decision: Arc<Mutex<Option<TrustDecision>>>,
}

impl client::Handler for TrustHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = public_key_fingerprint(server_public_key);
        let (key_type, _) = key_type_tag(server_public_key);
        let record = |d: TrustDecision| {
            *self.decision.lock().unwrap_or_else(|e| e.into_inner()) = Some(d);
        };

        let Some(store) = self.trust.store.clone() else {
            if self.trust.policy != TrustPolicy::AcceptAll {
                warn!(
                    "no trust store configured for {}:{}; accepting host key {fingerprint}",
                    self.host, self.port
                );
            }
            record(TrustDecision::Accepted);
            return Ok(true);
        };

        use crate::known_hosts::VerifyOutcome;
        match store.verify(&self.host, self.port, &fingerprint, key_type)? {
            VerifyOutcome::Ok => {
                record(TrustDecision::Accepted);
                Ok(true)
            }
            VerifyOutcome::Mismatch => {
                record(TrustDecision::RejectedMismatch);
                Ok(false)
            }
            VerifyOutcome::NotFound => match self.trust.policy {
                TrustPolicy::Strict => {
                    warn!(
                        "unknown host key for {}:{} rejected (strict policy)",
                        self.host, self.port
                    );
                    record(TrustDecision::RejectedUnknown);
                    Ok(false)
                }
                TrustPolicy::AcceptAll => {
                    record(TrustDecision::Accepted);
                    Ok(true)
                }
                TrustPolicy::AcceptNew => {
                    let info = HostKeyInfo {
                        host: self.host.clone(),
                        port: self.port,
                        key_type: key_type.to_string(),
                        fingerprint: fingerprint.clone(),
                    };
                    let accepted = self
                        .trust
                        .accept_hook
                        .as_ref()
                        .map(|hook| hook(&info))
                        .unwrap_or(true);
                    if !accepted {
                        record(TrustDecision::RejectedUnknown);
                        return Ok(false);
                    }
                    store.add(&self.host, self.port, &fingerprint, key_type)?;
                    record(TrustDecision::AcceptedNew);
                    Ok(true)
                }
            },
        }
    }
}

/// One SSH session: single-owner, never shared across tasks.
pub struct SshSession {
    config: SshConfig,
    trust: TrustSettings,
    state: SessionState,
    handle: Option<Arc<Handle<TrustHandler>>>,
    abort: Arc<AtomicBool>,
    last_error: Option<String>,
    trust_decision: Arc<Mutex<Option<TrustDecision>>>,
}

impl SshSession {
    pub fn new(config: SshConfig, trust: TrustSettings) -> Self {
        Self {
            config,
            trust,
            state: SessionState::Disconnected,
            handle: None,
            abort: Arc::new(AtomicBool::new(false)),
            last_error: None,
            trust_decision: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Shared abort flag; hand it to watchdog tasks.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Requests cooperative abort. In-flight connect/exec loops observe
    /// the flag within one poll interval and unwind with `Aborted`.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
            && self.handle.as_ref().is_some_and(|h| !h.is_closed())
    }

    /// Establishes the connection: resolve, TCP, handshake, authenticate.
    /// Any failure rolls back to `Error` with the socket closed.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state == SessionState::Connected {
            return Err(Error::InvalidState("session already connected".to_string()));
        }
        // An abort requested before connect begins wins immediately.
        if self.abort.load(Ordering::Relaxed) {
            self.last_error = Some(Error::Aborted.to_string());
            return Err(Error::Aborted);
        }
        self.state = SessionState::Connecting;
        *self
            .trust_decision
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;

        match self.connect_inner().await {
            Ok(handle) => {
                self.handle = Some(Arc::new(handle));
                self.state = SessionState::Connected;
                debug!("{} connected", self.config.target());
                Ok(())
            }
            Err(err) => {
                let err = self.refine_trust_error(err);
                self.last_error = Some(err.to_string());
                self.handle = None;
                self.state = if matches!(err, Error::Aborted) {
                    SessionState::Disconnected
                } else {
                    SessionState::Error
                };
                Err(err)
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<Handle<TrustHandler>> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let target = self.config.target();

        let addr = self.resolve().await?;
        debug!("{target} resolved to {addr}");

        let stream = with_abort(
            &self.abort,
            tokio::time::timeout(timeout, TcpStream::connect(addr)),
        )
        .await?
        .map_err(|_| Error::Timeout(format!("tcp connect to {target}")))?
        .map_err(|e| Error::ConnectFailed(format!("{target}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::ConnectFailed(format!("{target}: {e}")))?;
        debug!("{target} TCP connection successful");

        let config = Arc::new(client::Config {
            preferred: self.config.security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let handler = TrustHandler {
            host: self.config.host.clone(),
            port: self.config.port,
            trust: self.trust.clone(),
            decision: self.trust_decision.clone(),
        };

        let mut handle = with_abort(
            &self.abort,
            tokio::time::timeout(timeout, client::connect_stream(config, stream, handler)),
        )
        .await?
        .map_err(|_| Error::Timeout(format!("ssh handshake with {target}")))?
        .map_err(|e| match e {
            Error::TrustMismatch(_) => e,
            other => Error::HandshakeFailed(format!("{target}: {other}")),
        })?;
        debug!("{target} handshake successful");

        self.state = SessionState::Authenticating;
        with_abort(
            &self.abort,
            tokio::time::timeout(timeout, self.authenticate(&mut handle)),
        )
        .await?
        .map_err(|_| Error::Timeout(format!("authentication with {target}")))??;
        debug!("{target} authenticated");

        Ok(handle)
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(ip) = self.config.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.config.port));
        }
        let mut addrs = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| Error::ResolveFailed(format!("{}: {e}", self.config.host)))?;
        addrs
            .next()
            .ok_or_else(|| Error::ResolveFailed(self.config.host.clone()))
    }

    async fn authenticate(&self, handle: &mut Handle<TrustHandler>) -> Result<()> {
        let user = self.config.username.clone();
        let creds = &self.config.credentials;
        let wants_pubkey = creds.key_data.is_some() || creds.key_path.is_some();

        // userauth none doubles as the method probe; some servers accept it.
        let probe = handle.authenticate_none(&user).await?;
        if probe.success() {
            return Ok(());
        }
        if let AuthResult::Failure {
            remaining_methods, ..
        } = &probe
        {
            let advertised = format!("{remaining_methods:?}").to_ascii_lowercase();
            if wants_pubkey && !advertised.contains("publickey") {
                warn!(
                    "{} does not advertise publickey auth (offers {advertised})",
                    self.config.target()
                );
            }
        }

        let key_material = if let Some(buffer) = &creds.key_data {
            Some(String::from_utf8_lossy(buffer).into_owned())
        } else if let Some(path) = &creds.key_path {
            Some(tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::AuthFailed(format!("cannot read key file {}: {e}", path.display()))
            })?)
        } else {
            None
        };

        if let Some(pem) = key_material {
            // Best-effort format inspection: RSA material is expected to
            // decode; EC variants may be unsupported by the backend and
            // must fail loudly rather than fall through silently.
            let key = decode_secret_key(&pem, creds.key_passphrase.as_deref()).map_err(|e| {
                Error::KeyUnsupported(format!("private key not usable by backend: {e}"))
            })?;
            let best_hash = handle.best_supported_rsa_hash().await?.flatten();
            let auth = handle
                .authenticate_publickey(&user, PrivateKeyWithHashAlg::new(Arc::new(key), best_hash))
                .await?;
            if auth.success() {
                return Ok(());
            }
            return Err(Error::AuthFailed(format!(
                "publickey rejected for {}",
                self.config.target()
            )));
        }

        if let Some(password) = &creds.password {
            let auth = handle
                .authenticate_password(user.as_str(), password.as_str())
                .await?;
            if auth.success() {
                return Ok(());
            }
            return Err(Error::AuthFailed(format!(
                "password rejected for {}",
                self.config.target()
            )));
        }

        Err(Error::AuthFailed(
            "no credentials configured (key buffer, key path or password)".to_string(),
        ))
    }

    fn refine_trust_error(&self, err: Error) -> Error {
        let decision = *self
            .trust_decision
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match decision {
            Some(TrustDecision::RejectedMismatch) => {
                Error::TrustMismatch(format!("{}:{}", self.config.host, self.config.port))
            }
            Some(TrustDecision::RejectedUnknown) => Error::HandshakeFailed(format!(
                "host key for {}:{} not in trust store",
                self.config.host, self.config.port
            )),
            _ => err,
        }
    }

    /// Opens a session channel. Shared by exec, shell and SFTP setup.
    pub(crate) async fn open_channel(&self) -> Result<Channel<Msg>> {
        let handle = self.handle_ref()?;
        with_abort(&self.abort, handle.channel_open_session())
            .await?
            .map_err(|e| Error::ChannelOpenFailed(e.to_string()))
    }

    pub(crate) fn handle_ref(&self) -> Result<&Arc<Handle<TrustHandler>>> {
        if self.state != SessionState::Connected {
            return Err(Error::InvalidState(format!(
                "session is {:?}, expected connected",
                self.state
            )));
        }
        self.handle
            .as_ref()
            .ok_or_else(|| Error::InvalidState("session has no protocol handle".to_string()))
    }

    /// Shared protocol handle for peer consumers (port forwarder).
    pub(crate) fn handle_arc(&self) -> Result<Arc<Handle<TrustHandler>>> {
        Ok(self.handle_ref()?.clone())
    }

    /// Executes `command`, draining stdout and stderr alternately until
    /// the channel closes. Returns captured output and the exit status.
    pub async fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let mut output = ExecOutput {
            stdout: Vec::with_capacity(EXEC_STDOUT_INITIAL),
            stderr: Vec::with_capacity(EXEC_STDERR_INITIAL),
            exit_code: None,
        };
        let exit_code = self
            .exec_inner(command, &mut |source, data| {
                let buf = match source {
                    OutputSource::Stdout => &mut output.stdout,
                    OutputSource::Stderr => &mut output.stderr,
                };
                buf.try_reserve(data.len())
                    .map_err(|_| Error::OutOfMemory("exec output buffer".to_string()))?;
                buf.extend_from_slice(data);
                Ok(())
            })
            .await?;
        output.exit_code = exit_code;
        Ok(output)
    }

    /// Streaming execution: every chunk is delivered through `on_chunk`
    /// tagged with its source stream. Returns the exit status.
    pub async fn exec_stream(
        &mut self,
        command: &str,
        mut on_chunk: impl FnMut(OutputSource, &[u8]) + Send,
    ) -> Result<Option<u32>> {
        self.exec_inner(command, &mut |source, data| {
            on_chunk(source, data);
            Ok(())
        })
        .await
    }

    async fn exec_inner(
        &mut self,
        command: &str,
        sink: &mut (dyn FnMut(OutputSource, &[u8]) -> Result<()> + Send),
    ) -> Result<Option<u32>> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::ExecFailed(e.to_string()))?;

        let mut exit_code = None;
        let mut poll = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
        loop {
            tokio::select! {
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        sink(OutputSource::Stdout, data)?;
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                        sink(OutputSource::Stderr, data)?;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
                _ = poll.tick() => {
                    if self.abort.load(Ordering::Relaxed) {
                        return Err(Error::Aborted);
                    }
                }
            }
        }
        Ok(exit_code)
    }

    /// Sends the by-application disconnect message, closes the socket and
    /// frees protocol state. Idempotent: a second call is a no-op.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "application shutdown", "en")
                .await;
            debug!("{} disconnected", self.config.target());
        }
        self.state = SessionState::Disconnected;
        self.abort.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// Drives `fut` while polling `abort` every poll interval; returns
/// `Error::Aborted` as soon as the flag is observed.
pub(crate) async fn with_abort<F, T>(abort: &AtomicBool, fut: F) -> Result<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::pin!(fut);
    let mut poll = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
    loop {
        tokio::select! {
            out = &mut fut => return Ok(out),
            _ = poll.tick() => {
                if abort.load(Ordering::Relaxed) {
                    return Err(Error::Aborted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::SshCredentials;

    fn test_config() -> SshConfig {
        SshConfig::new("127.0.0.1", "root")
            .with_credentials(SshCredentials::password("pw"))
    }

    #[test]
    fn new_session_starts_disconnected() {
        let session = SshSession::new(test_config(), TrustSettings::default());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn abort_before_connect_fails_with_aborted() {
        let mut session = SshSession::new(test_config(), TrustSettings::default());
        session.abort();

        let started = std::time::Instant::now();
        let err = session.connect().await.expect_err("aborted");
        assert!(matches!(err, Error::Aborted));
        assert!(started.elapsed() < Duration::from_millis(POLL_INTERVAL_MS + 50));

        // Disconnect clears the flag for a fresh attempt.
        session.disconnect().await.expect("disconnect");
        assert!(!session.abort_handle().load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn exec_on_disconnected_session_is_invalid_state() {
        let mut session = SshSession::new(test_config(), TrustSettings::default());
        let err = session.exec("uname -a").await.expect_err("not connected");
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut session = SshSession::new(test_config(), TrustSettings::default());
        session.disconnect().await.expect("first");
        session.disconnect().await.expect("second");
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn with_abort_returns_aborted() {
        let abort = AtomicBool::new(true);
        let err = with_abort(&abort, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .await
        .expect_err("aborted");
        assert!(matches!(err, Error::Aborted));
    }

    #[tokio::test]
    async fn connect_to_dead_port_reports_connect_failed() {
        // Port 1 on localhost is almost certainly closed; a refused
        // connection must surface as ConnectFailed, not a panic.
        let mut config = test_config();
        config.port = 1;
        config.timeout_ms = 2000;
        let mut session = SshSession::new(config, TrustSettings::default());
        let err = session.connect().await.expect_err("must fail");
        assert!(matches!(
            err,
            Error::ConnectFailed(_) | Error::Timeout(_) | Error::HandshakeFailed(_)
        ));
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.last_error().is_some());
    }
}
