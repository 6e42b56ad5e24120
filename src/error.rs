//! Error taxonomy for the mirroring engine
//!
//! Per-entry and per-directory failures are recovered by the orchestrator;
//! `Session` and `Interrupted` are fatal and unwind to the run lifecycle.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a [`RemoteSession`](crate::session::RemoteSession) call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The single operation failed (missing file, permission, bad handle).
    Operation,
    /// The session itself is gone; nothing else will succeed.
    Disconnected,
}

impl RemoteError {
    pub fn operation(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Operation,
            message: message.into(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Disconnected,
            message: message.into(),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.kind == RemoteErrorKind::Disconnected
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to list remote directory {path}: {source}")]
    ListFailed { path: String, source: RemoteError },
    #[error("failed to stat remote entry {path}: {source}")]
    StatFailed { path: String, source: RemoteError },
    #[error("size mismatch for {}: expected {expected} bytes, got {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("remote read failed for {path}: {source}")]
    Remote { path: String, source: RemoteError },
    #[error("local I/O failed for {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("remote session failed: {0}")]
    Session(RemoteError),
    #[error("interrupted by user")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ListFailed,
    StatFailed,
    SizeMismatch,
    Remote,
    Io,
    Session,
    Interrupted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ListFailed => "list_failed",
            ErrorKind::StatFailed => "stat_failed",
            ErrorKind::SizeMismatch => "size_mismatch",
            ErrorKind::Remote => "remote",
            ErrorKind::Io => "io",
            ErrorKind::Session => "session",
            ErrorKind::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::ListFailed { .. } => ErrorKind::ListFailed,
            TransferError::StatFailed { .. } => ErrorKind::StatFailed,
            TransferError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            TransferError::Remote { .. } => ErrorKind::Remote,
            TransferError::Io { .. } => ErrorKind::Io,
            TransferError::Session(_) => ErrorKind::Session,
            TransferError::Interrupted => ErrorKind::Interrupted,
        }
    }

    /// Fatal errors abort the whole run instead of a single entry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::Session(_) | TransferError::Interrupted
        )
    }

    /// Classify a remote failure on `path`: a dropped session is fatal,
    /// anything else is wrapped by `per_entry`.
    pub(crate) fn from_remote(
        err: RemoteError,
        per_entry: impl FnOnce(RemoteError) -> TransferError,
    ) -> Self {
        if err.is_disconnected() {
            TransferError::Session(err)
        } else {
            per_entry(err)
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }
}
