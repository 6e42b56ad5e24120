//! Single-file download: one bulk fetch for small files, a sequential
//! chunk loop for large ones, then a size check.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use filetime::{set_file_mtime, FileTime};

use crate::error::{RemoteError, TransferError};
use crate::ledger::RunLedger;
use crate::progress::TransferProgress;
use crate::session::{read_error, RemoteSession};

/// Files up to this size are fetched whole; larger ones in chunks of it.
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 512;

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: u64,
    pub preserve_mtime: bool,
    pub show_progress: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            preserve_mtime: false,
            show_progress: false,
        }
    }
}

pub struct TransferEngine {
    options: TransferOptions,
    interrupt: Arc<AtomicBool>,
}

impl TransferEngine {
    pub fn new(options: TransferOptions, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            options: TransferOptions {
                chunk_size: options.chunk_size.max(1),
                ..options
            },
            interrupt,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.options.chunk_size
    }

    /// Download `remote_path` to `local_path` and verify its size.
    ///
    /// `local_path` is registered in the ledger before any byte is written
    /// and cleared only once the size matches. On error the caller owns
    /// cleanup.
    pub fn fetch<S: RemoteSession + ?Sized>(
        &self,
        session: &mut S,
        remote_path: &str,
        local_path: &Path,
        remote_size: u64,
        remote_mtime: u64,
        ledger: &RunLedger,
    ) -> Result<u64, TransferError> {
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
        }

        ledger.begin_attempt(local_path);

        if remote_size <= self.options.chunk_size {
            session
                .fetch_whole(remote_path, local_path)
                .map_err(|e| remote_failure(remote_path, e))?;
        } else {
            self.chunked_fetch(session, remote_path, local_path, remote_size)?;
        }

        let actual = fs::metadata(local_path)
            .map_err(|e| TransferError::io(local_path, e))?
            .len();
        if actual != remote_size {
            return Err(TransferError::SizeMismatch {
                path: local_path.to_path_buf(),
                expected: remote_size,
                actual,
            });
        }

        if self.options.preserve_mtime {
            set_file_mtime(local_path, FileTime::from_unix_time(remote_mtime as i64, 0))
                .map_err(|e| TransferError::io(local_path, e))?;
        }

        ledger.attempt_verified();
        Ok(actual)
    }

    fn chunked_fetch<S: RemoteSession + ?Sized>(
        &self,
        session: &mut S,
        remote_path: &str,
        local_path: &Path,
        remote_size: u64,
    ) -> Result<u64, TransferError> {
        let mut reader = session
            .open_stream(remote_path)
            .map_err(|e| remote_failure(remote_path, e))?;
        let mut writer = File::create(local_path).map_err(|e| TransferError::io(local_path, e))?;
        let progress = TransferProgress::new(remote_size, remote_path, self.options.show_progress);

        let mut buffer = vec![0u8; self.options.chunk_size as usize];
        let mut total_bytes = 0u64;

        let result = loop {
            // Honoured between chunks only; a started read always completes
            if self.interrupt.load(Ordering::SeqCst) {
                break Err(TransferError::Interrupted);
            }
            let bytes_read = match reader.read(&mut buffer) {
                Ok(n) => n,
                Err(e) => break Err(remote_failure(remote_path, read_error(&e))),
            };
            if bytes_read == 0 {
                break Ok(total_bytes);
            }
            if let Err(e) = writer.write_all(&buffer[..bytes_read]) {
                break Err(TransferError::io(local_path, e));
            }
            total_bytes += bytes_read as u64;
            progress.set_position(total_bytes);
        };

        match &result {
            Ok(_) => {
                writer.flush().map_err(|e| TransferError::io(local_path, e))?;
                progress.finish();
            }
            Err(_) => progress.abandon(),
        }
        result
    }
}

fn remote_failure(remote_path: &str, err: RemoteError) -> TransferError {
    TransferError::from_remote(err, |source| TransferError::Remote {
        path: remote_path.to_string(),
        source,
    })
}
