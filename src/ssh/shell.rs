//! Interactive PTY shell on a connected SSH session.
//!
//! The shell owns one channel with a PTY and a remote shell started on
//! it. Callers can drive it directly with [`Shell::write`] /
//! [`Shell::read`], or hand input over an mpsc channel to the
//! cooperative [`Shell::run`] driver, which multiplexes caller input
//! against channel output until the remote side reports EOF or the
//! input provider asks to exit.
//!
//! Signals are delivered as control bytes (`INT` 0x03, `QUIT` 0x1C,
//! `TSTP` 0x1A, `EOF` 0x04) for maximum compatibility with embedded
//! sshd builds that lack the signal channel request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ssh::{SshSession, SHELL_POLL_MS};

/// PTY parameters for a new shell.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub term: String,
    pub width: u32,
    pub height: u32,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            width: 80,
            height: 24,
        }
    }
}

/// Result of a bounded [`Shell::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellRead {
    /// Bytes were appended to the caller's buffer.
    Data(usize),
    /// No output arrived within the deadline.
    Timeout,
    /// The remote side closed the stream.
    Eof,
}

/// Signals deliverable as control bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellSignal {
    Interrupt,
    Quit,
    Suspend,
    Eof,
}

impl ShellSignal {
    /// Canonical name → signal. Anything else is unsupported.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "INT" | "SIGINT" => Ok(Self::Interrupt),
            "QUIT" | "SIGQUIT" => Ok(Self::Quit),
            "TSTP" | "SIGTSTP" => Ok(Self::Suspend),
            "EOF" => Ok(Self::Eof),
            other => Err(Error::Unsupported(format!("shell signal '{other}'"))),
        }
    }

    fn control_byte(self) -> u8 {
        match self {
            Self::Interrupt => 0x03,
            Self::Quit => 0x1c,
            Self::Suspend => 0x1a,
            Self::Eof => 0x04,
        }
    }
}

/// Input messages accepted by the [`Shell::run`] driver.
#[derive(Debug)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize { width: u32, height: u32 },
    Signal(ShellSignal),
    /// Exit sentinel: the driver unwinds and the shell is closed.
    Exit,
}

/// A running interactive shell.
pub struct Shell {
    channel: Channel<Msg>,
    abort: Arc<AtomicBool>,
    exit_code: Option<u32>,
    eof_seen: bool,
}

impl Shell {
    /// Opens a channel, requests a PTY and starts the remote shell.
    pub async fn open(session: &SshSession, config: ShellConfig) -> Result<Self> {
        let channel = session.open_channel().await?;
        channel
            .request_pty(
                false,
                &config.term,
                config.width,
                config.height,
                0,
                0,
                &[],
            )
            .await?;
        channel.request_shell(false).await?;
        debug!(
            "shell opened on {} ({} {}x{})",
            session.config().target(),
            config.term,
            config.width,
            config.height
        );
        Ok(Self {
            channel,
            abort: session.abort_handle(),
            exit_code: None,
            eof_seen: false,
        })
    }

    /// Exit status reported by the remote shell, once seen.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    /// Writes raw bytes to the shell's stdin.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.channel.data(bytes).await?;
        Ok(())
    }

    /// Reads one chunk of output into `buf`, bounded by `timeout`.
    pub async fn read(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> Result<ShellRead> {
        if self.eof_seen {
            return Ok(ShellRead::Eof);
        }
        loop {
            match tokio::time::timeout(timeout, self.channel.wait()).await {
                Err(_) => return Ok(ShellRead::Timeout),
                Ok(None) | Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) => {
                    self.eof_seen = true;
                    return Ok(ShellRead::Eof);
                }
                Ok(Some(ChannelMsg::Data { ref data })) => {
                    buf.extend_from_slice(data);
                    return Ok(ShellRead::Data(data.len()));
                }
                Ok(Some(ChannelMsg::ExtendedData { ref data, .. })) => {
                    buf.extend_from_slice(data);
                    return Ok(ShellRead::Data(data.len()));
                }
                Ok(Some(ChannelMsg::ExitStatus { exit_status })) => {
                    self.exit_code = Some(exit_status);
                }
                Ok(Some(_)) => {}
            }
        }
    }

    /// Injects a PTY window-size change.
    pub async fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.channel.window_change(width, height, 0, 0).await?;
        Ok(())
    }

    /// Delivers a signal as its control byte.
    pub async fn signal(&mut self, signal: ShellSignal) -> Result<()> {
        let byte = [signal.control_byte()];
        self.channel.data(&byte[..]).await?;
        Ok(())
    }

    /// Delivers a signal by name; unknown names report `Unsupported`.
    pub async fn signal_by_name(&mut self, name: &str) -> Result<()> {
        self.signal(ShellSignal::from_name(name)?).await
    }

    /// Cooperative driver: multiplexes caller input against channel
    /// output until the remote side reports EOF, the input provider
    /// sends [`ShellInput::Exit`] or drops the sender, or the session
    /// abort flag is raised.
    ///
    /// Returns the remote exit status if one was reported.
    pub async fn run(
        &mut self,
        mut on_output: impl FnMut(&[u8]),
        input: &mut mpsc::Receiver<ShellInput>,
    ) -> Result<Option<u32>> {
        let mut poll = tokio::time::interval(Duration::from_millis(SHELL_POLL_MS));
        loop {
            tokio::select! {
                item = input.recv() => match item {
                    Some(ShellInput::Data(bytes)) => {
                        self.channel.data(&bytes[..]).await?;
                    }
                    Some(ShellInput::Resize { width, height }) => {
                        self.channel.window_change(width, height, 0, 0).await?;
                    }
                    Some(ShellInput::Signal(signal)) => {
                        let byte = [signal.control_byte()];
                        self.channel.data(&byte[..]).await?;
                    }
                    Some(ShellInput::Exit) | None => {
                        let _ = self.channel.eof().await;
                        break;
                    }
                },
                msg = self.channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => on_output(data),
                    Some(ChannelMsg::ExtendedData { ref data, .. }) => on_output(data),
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        self.exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        self.eof_seen = true;
                        break;
                    }
                    Some(_) => {}
                },
                _ = poll.tick() => {
                    if self.abort.load(Ordering::Relaxed) {
                        return Err(Error::Aborted);
                    }
                }
            }
        }
        Ok(self.exit_code)
    }

    /// Sends EOF and drops the channel.
    pub async fn close(mut self) -> Result<Option<u32>> {
        let _ = self.channel.eof().await;
        self.eof_seen = true;
        Ok(self.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_signals_map_to_control_bytes() {
        assert_eq!(ShellSignal::Interrupt.control_byte(), 0x03);
        assert_eq!(ShellSignal::Quit.control_byte(), 0x1c);
        assert_eq!(ShellSignal::Suspend.control_byte(), 0x1a);
        assert_eq!(ShellSignal::Eof.control_byte(), 0x04);
    }

    #[test]
    fn signal_names_resolve_case_insensitively() {
        assert_eq!(
            ShellSignal::from_name("int").expect("int"),
            ShellSignal::Interrupt
        );
        assert_eq!(
            ShellSignal::from_name("SIGQUIT").expect("sigquit"),
            ShellSignal::Quit
        );
        let err = ShellSignal::from_name("KILL").expect_err("unsupported");
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn default_pty_is_xterm_80x24() {
        let config = ShellConfig::default();
        assert_eq!(config.term, "xterm");
        assert_eq!((config.width, config.height), (80, 24));
    }
}
