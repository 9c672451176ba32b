//! Local TCP port forwarding over SSH channels.
//!
//! Binds a local listener and, for each accepted connection, opens a
//! direct-tcpip channel to the configured remote endpoint and pumps
//! bytes both ways until either side closes. Per-connection pumps run
//! as tasks owned by the listener task; stopping the forwarder tears
//! both down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{Error, Result};
use crate::ssh::SshSession;

/// Endpoints of one local forward.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Local bind address; all interfaces by default.
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardConfig {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_host: "0.0.0.0".to_string(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// Snapshot of forwarder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Counters {
    active: AtomicU64,
    total: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
}

/// A running local port forward.
pub struct PortForwarder {
    config: ForwardConfig,
    counters: Arc<Counters>,
    shutdown: Arc<Notify>,
    listener_task: Option<JoinHandle<()>>,
    bound_port: Option<u16>,
}

impl PortForwarder {
    pub fn new(config: ForwardConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
            shutdown: Arc::new(Notify::new()),
            listener_task: None,
            bound_port: None,
        }
    }

    /// Actual bound local port (differs from config when 0 was requested).
    pub fn local_port(&self) -> Option<u16> {
        self.bound_port
    }

    pub fn is_running(&self) -> bool {
        self.listener_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Binds the local listener and starts accepting.
    pub async fn start(&mut self, session: &SshSession) -> Result<()> {
        if self.is_running() {
            return Err(Error::InvalidState("forwarder already running".to_string()));
        }
        let handle = session.handle_arc()?;
        let listener =
            TcpListener::bind((self.config.local_host.as_str(), self.config.local_port))
                .await
                .map_err(|e| {
                    Error::ConnectFailed(format!(
                        "bind {}:{}: {e}",
                        self.config.local_host, self.config.local_port
                    ))
                })?;
        let bound = listener
            .local_addr()
            .map_err(Error::Io)?
            .port();
        self.bound_port = Some(bound);

        let config = self.config.clone();
        let counters = self.counters.clone();
        let shutdown = self.shutdown.clone();
        debug!(
            "port forward {}:{bound} -> {}:{} started",
            config.local_host, config.remote_host, config.remote_port
        );

        self.listener_task = Some(tokio::spawn(async move {
            // Dropping the set aborts every in-flight pump.
            let mut pumps = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (socket, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("forward accept failed: {e}");
                                continue;
                            }
                        };
                        counters.total.fetch_add(1, Ordering::Relaxed);
                        counters.active.fetch_add(1, Ordering::Relaxed);
                        let handle = handle.clone();
                        let counters = counters.clone();
                        let config = config.clone();
                        pumps.spawn(async move {
                            match pump(handle, &config, socket, peer).await {
                                Ok((sent, received)) => {
                                    counters.sent.fetch_add(sent, Ordering::Relaxed);
                                    counters.received.fetch_add(received, Ordering::Relaxed);
                                }
                                Err(e) => debug!("forward connection from {peer} ended: {e}"),
                            }
                            counters.active.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    () = shutdown.notified() => break,
                }
            }
        }));
        Ok(())
    }

    /// Stops accepting and aborts in-flight pumps.
    pub async fn stop(&mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.listener_task.take() {
            let _ = task.await;
        }
        self.bound_port = None;
    }

    /// Stops and consumes the forwarder.
    pub async fn destroy(mut self) {
        self.stop().await;
    }

    pub fn get_stats(&self) -> ForwardStats {
        ForwardStats {
            active_connections: self.counters.active.load(Ordering::Relaxed),
            total_connections: self.counters.total.load(Ordering::Relaxed),
            bytes_sent: self.counters.sent.load(Ordering::Relaxed),
            bytes_received: self.counters.received.load(Ordering::Relaxed),
        }
    }
}

async fn pump(
    handle: Arc<russh::client::Handle<super::transport::TrustHandler>>,
    config: &ForwardConfig,
    mut socket: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
) -> Result<(u64, u64)> {
    let channel = handle
        .channel_open_direct_tcpip(
            config.remote_host.as_str(),
            u32::from(config.remote_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
        .map_err(|e| Error::ChannelOpenFailed(e.to_string()))?;
    let mut stream = channel.into_stream();
    let (sent, received) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await?;
    debug!("forward connection from {peer} closed ({sent} up, {received} down)");
    Ok((sent, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{SshConfig, TrustSettings};

    #[test]
    fn stats_start_at_zero() {
        let fwd = PortForwarder::new(ForwardConfig::new(0, "10.0.0.5", 80));
        assert_eq!(fwd.get_stats(), ForwardStats::default());
        assert!(!fwd.is_running());
        assert!(fwd.local_port().is_none());
    }

    #[test]
    fn default_bind_covers_all_interfaces() {
        let config = ForwardConfig::new(8080, "db.internal", 5432);
        assert_eq!(config.local_host, "0.0.0.0");
    }

    #[tokio::test]
    async fn start_requires_connected_session() {
        let session = SshSession::new(SshConfig::new("127.0.0.1", "root"), TrustSettings::default());
        let mut fwd = PortForwarder::new(ForwardConfig::new(0, "10.0.0.5", 80));
        let err = fwd.start(&session).await.expect_err("not connected");
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
