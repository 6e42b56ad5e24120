//! SFTP-backed [`RemoteSession`] over libssh2

use std::io::{self, Read};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ssh2::{ErrorCode, FileStat, Session, Sftp};

use crate::config::Config;
use crate::error::RemoteError;
use crate::session::{join_remote, RemoteEntry, RemoteSession, RemoteStat};

pub struct SftpSession {
    // Keeps the transport alive for the lifetime of the SFTP channel
    _session: Session,
    sftp: Sftp,
}

impl SftpSession {
    /// Connect, authenticate with the configured password and open SFTP.
    ///
    /// The host key is not checked against `known_hosts`.
    pub fn connect(config: &Config) -> Result<Self> {
        let addr = format!("{}:{}", config.hostname, config.port);
        let tcp = TcpStream::connect(&addr).with_context(|| format!("TCP connect to {addr} failed"))?;
        let mut session = Session::new().context("failed to create SSH session")?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .with_context(|| format!("SSH handshake with {addr} failed"))?;
        session
            .userauth_password(&config.username, &config.password)
            .with_context(|| format!("authentication as {} failed", config.username))?;
        if !session.authenticated() {
            return Err(anyhow!("server did not accept credentials for {}", config.username));
        }
        let sftp = session
            .sftp()
            .with_context(|| format!("failed to start SFTP subsystem on {addr}"))?;
        Ok(Self {
            _session: session,
            sftp,
        })
    }
}

impl RemoteSession for SftpSession {
    fn list_entries(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let entries = self.sftp.readdir(Path::new(path)).map_err(remote_error)?;
        Ok(entries
            .into_iter()
            .filter_map(|(child, stat)| {
                let name = child.file_name()?.to_string_lossy().into_owned();
                Some(RemoteEntry {
                    path: join_remote(path, &name),
                    name,
                    is_directory: stat.is_dir(),
                    size: stat.size.unwrap_or(0),
                    mtime: stat.mtime.unwrap_or(0),
                })
            })
            .collect())
    }

    fn stat_entry(&mut self, path: &str) -> Result<RemoteStat, RemoteError> {
        let stat = self.sftp.stat(Path::new(path)).map_err(remote_error)?;
        Ok(to_remote_stat(&stat))
    }

    fn open_stream(&mut self, path: &str) -> Result<Box<dyn Read + '_>, RemoteError> {
        let file = self
            .sftp
            .open(&PathBuf::from(path))
            .map_err(remote_error)?;
        Ok(Box::new(SftpReader { inner: file }))
    }
}

/// Re-tags libssh2 read failures so the transfer loop can tell a dead
/// session from a failed read.
struct SftpReader<R> {
    inner: R,
}

impl<R: Read> Read for SftpReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| {
            let is_ssh = e.get_ref().is_some_and(|inner| inner.is::<ssh2::Error>());
            if !is_ssh {
                return e;
            }
            let kind = e.kind();
            match e.into_inner().map(|inner| inner.downcast::<ssh2::Error>()) {
                Some(Ok(ssh)) => io::Error::new(kind, remote_error(*ssh)),
                Some(Err(inner)) => io::Error::new(kind, inner),
                None => io::Error::from(kind),
            }
        })
    }
}

fn to_remote_stat(stat: &FileStat) -> RemoteStat {
    RemoteStat {
        size: stat.size.unwrap_or(0),
        mtime: stat.mtime.unwrap_or(0),
        is_directory: stat.is_dir(),
    }
}

/// libssh2 session-level codes mean the transport is gone; SFTP status
/// codes (no such file, permission denied, ...) are per-operation.
fn remote_error(err: ssh2::Error) -> RemoteError {
    match err.code() {
        ErrorCode::Session(code) => {
            RemoteError::disconnected(format!("ssh session error {code}: {}", err.message()))
        }
        ErrorCode::SFTP(code) => {
            RemoteError::operation(format!("sftp status {code}: {}", err.message()))
        }
    }
}
