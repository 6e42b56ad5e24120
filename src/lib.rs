//! sftp-mirror library
//!
//! One-way incremental mirror of a remote SFTP directory tree. The engine
//! is written against [`session::RemoteSession`] so it runs the same over
//! `ssh2` or the in-memory tree used by tests.

pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logger;
pub mod memory;
pub mod mirror;
pub mod planner;
pub mod progress;
pub mod run;
pub mod session;
pub mod sftp;
pub mod transfer;

pub use error::{ErrorKind, RemoteError, TransferError};
pub use ledger::RunLedger;
pub use mirror::{Mirror, RunCounters};
pub use session::{RemoteEntry, RemoteSession, RemoteStat};
pub use transfer::{TransferEngine, TransferOptions};
