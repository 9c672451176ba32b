//! SFTP file transfer subsystem on a connected SSH session.
//!
//! Wraps the `russh-sftp` client: file handles with read/write/seek,
//! directory listing, and buffered whole-file transfers that stream in
//! 4 KiB chunks and yield the scheduler between chunks so long copies
//! do not starve the rule evaluator.

use std::io::SeekFrom;
use std::path::Path;

use log::debug;
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

pub use russh_sftp::protocol::OpenFlags;

use crate::error::{Error, Result};
use crate::ssh::{SshSession, SFTP_CHUNK_SIZE};

/// Progress sample delivered to transfer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes: u64,
    /// Total size when known; 0 for streams of unknown length.
    pub total: u64,
}

/// Decoded file metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub permissions: u32,
    pub is_dir: bool,
    pub is_link: bool,
    pub atime: u32,
    pub mtime: u32,
}

impl FileStat {
    fn from_attrs(attrs: &russh_sftp::protocol::FileAttributes) -> Self {
        let permissions = attrs.permissions.unwrap_or(0);
        Self {
            size: attrs.size.unwrap_or(0),
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
            permissions,
            is_dir: permissions & 0o170000 == 0o040000,
            is_link: permissions & 0o170000 == 0o120000,
            atime: attrs.atime.unwrap_or(0),
            mtime: attrs.mtime.unwrap_or(0),
        }
    }
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub stat: FileStat,
}

/// An open remote file.
pub struct SftpFile {
    inner: File,
}

impl SftpFile {
    /// Reads up to `buf.len()` bytes. Returns 0 at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.inner.read(buf).await?)
    }

    /// Writes the whole buffer.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf).await?;
        Ok(())
    }

    /// Repositions the file cursor.
    pub async fn seek(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    /// Flushes and closes the remote handle.
    pub async fn close(mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Open directory handle.
pub struct SftpDir {
    inner: russh_sftp::client::fs::ReadDir,
}

impl SftpDir {
    /// Next entry, or `None` when the listing is exhausted.
    pub fn read(&mut self) -> Option<DirEntryInfo> {
        self.inner.next().map(|entry| DirEntryInfo {
            stat: FileStat::from_attrs(&entry.metadata()),
            name: entry.file_name(),
        })
    }
}

/// SFTP subsystem bound to one session channel.
pub struct Sftp {
    session: SftpSession,
}

impl Sftp {
    /// Initializes the subsystem on a connected session.
    pub async fn open(session: &SshSession) -> Result<Self> {
        let channel = session.open_channel().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        // The library default of 10s is too short for slow links.
        sftp.set_timeout(session.config().timeout_ms / 1000);
        debug!("sftp subsystem opened on {}", session.config().target());
        Ok(Self { session: sftp })
    }

    /// Opens a remote file with the given flag set.
    pub async fn file_open(&self, path: &str, flags: OpenFlags) -> Result<SftpFile> {
        let inner = self.session.open_with_flags(path, flags).await?;
        Ok(SftpFile { inner })
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        let attrs = self.session.metadata(path).await?;
        Ok(FileStat::from_attrs(&attrs))
    }

    pub async fn unlink(&self, path: &str) -> Result<()> {
        Ok(self.session.remove_file(path).await?)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(self.session.rename(from, to).await?)
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        Ok(self.session.create_dir(path).await?)
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        Ok(self.session.remove_dir(path).await?)
    }

    pub async fn dir_open(&self, path: &str) -> Result<SftpDir> {
        let inner = self.session.read_dir(path).await?;
        Ok(SftpDir { inner })
    }

    /// Downloads `remote` to `local`, streaming in 4 KiB chunks.
    pub async fn get(
        &self,
        remote: &str,
        local: &Path,
        mut progress: impl FnMut(TransferProgress),
    ) -> Result<u64> {
        let total = self.stat(remote).await?.size;
        let mut src = self.file_open(remote, OpenFlags::READ).await?;
        let mut dst = tokio::fs::File::create(local).await?;

        let mut buf = vec![0u8; SFTP_CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n]).await?;
            transferred += n as u64;
            progress(TransferProgress {
                bytes: transferred,
                total,
            });
            tokio::task::yield_now().await;
        }
        dst.flush().await?;
        src.close().await?;
        debug!("sftp get {remote} -> {} ({transferred} bytes)", local.display());
        Ok(transferred)
    }

    /// Uploads `local` to `remote`, streaming in 4 KiB chunks.
    pub async fn put(
        &self,
        local: &Path,
        remote: &str,
        mut progress: impl FnMut(TransferProgress),
    ) -> Result<u64> {
        let total = tokio::fs::metadata(local).await?.len();
        let mut src = tokio::fs::File::open(local).await?;
        let mut dst = self
            .file_open(
                remote,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            )
            .await?;

        let mut buf = vec![0u8; SFTP_CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            dst.write(&buf[..n]).await?;
            transferred += n as u64;
            progress(TransferProgress {
                bytes: transferred,
                total,
            });
            tokio::task::yield_now().await;
        }
        dst.close().await?;
        debug!("sftp put {} -> {remote} ({transferred} bytes)", local.display());
        Ok(transferred)
    }

    /// Downloads `remote` into memory, refusing files larger than `max`.
    pub async fn get_to_buffer(&self, remote: &str, max: u64) -> Result<Vec<u8>> {
        let size = self.stat(remote).await?.size;
        if size > max {
            return Err(Error::Exhausted(format!(
                "remote file is {size} bytes, ceiling is {max}"
            )));
        }
        let mut src = self.file_open(remote, OpenFlags::READ).await?;
        let mut out = Vec::with_capacity(size as usize);
        let mut buf = vec![0u8; SFTP_CHUNK_SIZE];
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            if out.len() as u64 > max {
                return Err(Error::Exhausted(format!(
                    "remote file exceeded ceiling of {max} bytes while reading"
                )));
            }
            tokio::task::yield_now().await;
        }
        src.close().await?;
        Ok(out)
    }

    /// Uploads an in-memory buffer to `remote`.
    pub async fn put_from_buffer(&self, buf: &[u8], remote: &str) -> Result<()> {
        let mut dst = self
            .file_open(
                remote,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            )
            .await?;
        for chunk in buf.chunks(SFTP_CHUNK_SIZE) {
            dst.write(chunk).await?;
            tokio::task::yield_now().await;
        }
        dst.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stat_decodes_type_bits() {
        let attrs = russh_sftp::protocol::FileAttributes {
            size: Some(42),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o040755),
            ..Default::default()
        };
        let stat = FileStat::from_attrs(&attrs);
        assert!(stat.is_dir);
        assert!(!stat.is_link);
        assert_eq!(stat.size, 42);

        let attrs = russh_sftp::protocol::FileAttributes {
            permissions: Some(0o120777),
            ..Default::default()
        };
        assert!(FileStat::from_attrs(&attrs).is_link);
    }

    #[test]
    fn missing_attributes_default_to_zero() {
        let stat = FileStat::from_attrs(&russh_sftp::protocol::FileAttributes::default());
        assert_eq!(stat.size, 0);
        assert!(!stat.is_dir);
    }
}
