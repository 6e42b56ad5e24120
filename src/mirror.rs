//! Recursive remote -> local mirror
//!
//! Per directory level: plan, download stale files, then descend into
//! subdirectories. Single session, depth first, one file at a time.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TransferError;
use crate::ledger::RunLedger;
use crate::logger::Logger;
use crate::planner::{plan, WorkItem};
use crate::session::RemoteSession;
use crate::transfer::TransferEngine;

/// Tallies for one directory level, or a whole subtree once merged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunCounters {
    /// Entries considered. A descended directory is counted through its children.
    pub seen: u64,
    pub directories: u64,
    pub files: u64,
    pub skipped: u64,
    pub downloaded: u64,
    pub failed: u64,
}

impl RunCounters {
    /// Fold a recursed child's counters in, replacing the directory entry
    /// itself with the child's entries.
    pub fn absorb(&mut self, child: RunCounters) {
        self.seen = self.seen.saturating_sub(1) + child.seen;
        self.directories += child.directories;
        self.files += child.files;
        self.skipped += child.skipped;
        self.downloaded += child.downloaded;
        self.failed += child.failed;
    }
}

pub struct Mirror<'a, S: RemoteSession> {
    session: S,
    engine: TransferEngine,
    excluded: BTreeSet<String>,
    ledger: RunLedger,
    logger: &'a dyn Logger,
    interrupt: Arc<AtomicBool>,
    dry_run: bool,
}

impl<'a, S: RemoteSession> Mirror<'a, S> {
    pub fn new(
        session: S,
        engine: TransferEngine,
        excluded: BTreeSet<String>,
        logger: &'a dyn Logger,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session,
            engine,
            excluded,
            ledger: RunLedger::new(),
            logger,
            interrupt,
            dry_run: false,
        }
    }

    /// Use a ledger created earlier, e.g. one whose slot an interrupt
    /// handler already holds.
    pub fn with_ledger(mut self, ledger: RunLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Plan and log only; nothing is downloaded or recorded.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn into_ledger(self) -> RunLedger {
        self.ledger
    }

    /// Remove whatever file was mid-transfer.
    pub fn cleanup(&self) {
        self.ledger.cleanup(self.logger);
    }

    /// Mirror `remote_dir` into `local_dir`.
    ///
    /// Only fatal errors (`Session`, `Interrupted`) come back as `Err`; a
    /// root listing failure is reported as `ListFailed` too so the caller
    /// can tell an empty tree from an unreadable one.
    pub fn mirror(&mut self, remote_dir: &str, local_dir: &Path) -> Result<RunCounters, TransferError> {
        self.check_interrupt()?;
        fs::create_dir_all(local_dir).map_err(|e| TransferError::io(local_dir, e))?;
        self.logger.enter_dir(remote_dir);

        let level = plan(
            &mut self.session,
            remote_dir,
            local_dir,
            &self.excluded,
            self.logger,
        )?;
        self.logger.planned(remote_dir, &level.counters);

        let mut counters = level.counters;
        let (dirs, files): (Vec<WorkItem>, Vec<WorkItem>) =
            level.items.into_iter().partition(|item| item.is_directory);

        let total = files.len() as u64;
        for (idx, item) in files.iter().enumerate() {
            self.check_interrupt()?;
            self.mirror_file(item, idx as u64 + 1, total, &mut counters)?;
        }

        for item in &dirs {
            self.check_interrupt()?;
            match self.mirror(&item.remote_path, &item.local_path) {
                Ok(child) => counters.absorb(child),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.logger
                        .error("directory", &item.remote_path, &e.to_string());
                    counters.skipped += 1;
                }
            }
        }

        Ok(counters)
    }

    // Pending -> Transferring -> Verified | Failed
    fn mirror_file(
        &mut self,
        item: &WorkItem,
        position: u64,
        total: u64,
        counters: &mut RunCounters,
    ) -> Result<(), TransferError> {
        self.logger.file_start(item, position, total);
        if self.dry_run {
            self.logger.skip(&item.remote_path, "dry run");
            return Ok(());
        }

        let result = self.engine.fetch(
            &mut self.session,
            &item.remote_path,
            &item.local_path,
            item.remote_size,
            item.remote_mtime,
            &self.ledger,
        );

        match result {
            Ok(bytes) => {
                self.ledger.record_download(&item.remote_path);
                counters.downloaded += 1;
                self.logger.file_done(item, bytes);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.logger.file_failed(item, &e.to_string());
                self.ledger.cleanup(self.logger);
                counters.failed += 1;
                Ok(())
            }
        }
    }

    fn check_interrupt(&self) -> Result<(), TransferError> {
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(TransferError::Interrupted);
        }
        Ok(())
    }
}
