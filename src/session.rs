//! Remote session boundary
//!
//! The mirroring engine only ever talks to the remote side through
//! [`RemoteSession`]. The SSH transport lives in `sftp`; `memory` provides an
//! in-process tree for tests.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use crate::error::RemoteError;

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    /// Forward-slash separated remote path
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    /// Unix seconds
    pub mtime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: u64,
    pub is_directory: bool,
}

pub trait RemoteSession {
    fn list_entries(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    fn stat_entry(&mut self, path: &str) -> Result<RemoteStat, RemoteError>;

    fn open_stream(&mut self, path: &str) -> Result<Box<dyn Read + '_>, RemoteError>;

    /// Bulk copy of a whole remote file into `local`. Returns bytes written.
    fn fetch_whole(&mut self, remote: &str, local: &Path) -> Result<u64, RemoteError> {
        let mut reader = self.open_stream(remote)?;
        let mut file = File::create(local)
            .map_err(|e| RemoteError::operation(format!("create {}: {e}", local.display())))?;
        let copied = io::copy(&mut reader, &mut file)
            .map_err(|e| RemoteError::operation(format!("copy {remote}: {e}")))?;
        file.sync_all()
            .map_err(|e| RemoteError::operation(format!("sync {}: {e}", local.display())))?;
        Ok(copied)
    }
}

impl<S: RemoteSession + ?Sized> RemoteSession for &mut S {
    fn list_entries(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        (**self).list_entries(path)
    }

    fn stat_entry(&mut self, path: &str) -> Result<RemoteStat, RemoteError> {
        (**self).stat_entry(path)
    }

    fn open_stream(&mut self, path: &str) -> Result<Box<dyn Read + '_>, RemoteError> {
        (**self).open_stream(path)
    }

    fn fetch_whole(&mut self, remote: &str, local: &Path) -> Result<u64, RemoteError> {
        (**self).fetch_whole(remote, local)
    }
}

/// Recover the [`RemoteError`] behind a failed stream read.
///
/// Readers that know better wrap a `RemoteError` in the `io::Error`;
/// otherwise a broken transport shows up only as the I/O error kind.
pub fn read_error(err: &io::Error) -> RemoteError {
    if let Some(remote) = err.get_ref().and_then(|e| e.downcast_ref::<RemoteError>()) {
        return remote.clone();
    }
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::TimedOut => RemoteError::disconnected(err.to_string()),
        _ => RemoteError::operation(err.to_string()),
    }
}

/// Join a remote directory and a child name with a single `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Local mtime in whole unix seconds; `None` when the path does not exist.
pub(crate) fn local_mtime(path: &Path) -> Option<(u64, u64)> {
    let meta = fs::metadata(path).ok()?;
    let mtime = filetime::FileTime::from_last_modification_time(&meta).unix_seconds();
    Some((mtime.max(0) as u64, meta.len()))
}
