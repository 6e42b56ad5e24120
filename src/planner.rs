//! One directory level: which entries to fetch, which to descend into

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::TransferError;
use crate::logger::Logger;
use crate::mirror::RunCounters;
use crate::session::{join_remote, local_mtime, RemoteSession};

/// Local counterpart of a remote entry. Missing files have mtime 0 so any
/// remote mtime is newer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub mtime: u64,
    pub size: u64,
    pub exists: bool,
}

impl LocalEntry {
    pub fn probe(path: PathBuf) -> Self {
        match local_mtime(&path) {
            Some((mtime, size)) => Self {
                path,
                mtime,
                size,
                exists: true,
            },
            None => Self {
                path,
                mtime: 0,
                size: 0,
                exists: false,
            },
        }
    }
}

/// Unit of work handed to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub name: String,
    pub remote_path: String,
    pub remote_mtime: u64,
    pub remote_size: u64,
    pub is_directory: bool,
    pub local_path: PathBuf,
    pub local_mtime: u64,
}

#[derive(Debug, Default)]
pub struct Plan {
    /// Listing order, directories and files interleaved
    pub items: Vec<WorkItem>,
    pub counters: RunCounters,
}

impl Plan {
    pub fn files(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|i| !i.is_directory)
    }

    pub fn directories(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|i| i.is_directory)
    }
}

/// Directories are always stale; files only when strictly newer remotely.
pub fn needs_action(is_directory: bool, remote_mtime: u64, local_mtime: u64) -> bool {
    is_directory || remote_mtime > local_mtime
}

/// Classify one remote directory level against `local_dir`.
///
/// A failed listing is returned as `ListFailed` (or `Session` when the
/// connection is gone). Failed stats only skip the entry.
pub fn plan<S: RemoteSession + ?Sized>(
    session: &mut S,
    remote_dir: &str,
    local_dir: &Path,
    excluded: &BTreeSet<String>,
    logger: &dyn Logger,
) -> Result<Plan, TransferError> {
    let listing = session.list_entries(remote_dir).map_err(|e| {
        TransferError::from_remote(e, |source| TransferError::ListFailed {
            path: remote_dir.to_string(),
            source,
        })
    })?;

    let mut plan = Plan::default();

    for entry in listing {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        plan.counters.seen += 1;

        if excluded.contains(&entry.name) {
            logger.skip(&join_remote(remote_dir, &entry.name), "excluded");
            plan.counters.skipped += 1;
            continue;
        }

        let remote_path = join_remote(remote_dir, &entry.name);
        let stat = match session.stat_entry(&remote_path) {
            Ok(stat) => stat,
            Err(e) if e.is_disconnected() => return Err(TransferError::Session(e)),
            Err(e) => {
                let err = TransferError::StatFailed {
                    path: remote_path.clone(),
                    source: e,
                };
                logger.error("stat", &remote_path, &err.to_string());
                plan.counters.skipped += 1;
                continue;
            }
        };

        let local = LocalEntry::probe(local_dir.join(&entry.name));

        if !needs_action(stat.is_directory, stat.mtime, local.mtime) {
            logger.skip(&remote_path, "up to date");
            plan.counters.skipped += 1;
            continue;
        }

        if stat.is_directory {
            plan.counters.directories += 1;
        } else {
            plan.counters.files += 1;
        }
        plan.items.push(WorkItem {
            name: entry.name,
            remote_path,
            remote_mtime: stat.mtime,
            remote_size: stat.size,
            is_directory: stat.is_directory,
            local_path: local.path,
            local_mtime: local.mtime,
        });
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::logger::NoopLogger;
    use crate::memory::MemorySession;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;

    fn excluded(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn staleness_is_strictly_newer() {
        assert!(needs_action(false, 101, 100));
        assert!(!needs_action(false, 100, 100));
        assert!(!needs_action(false, 99, 100));
        assert!(needs_action(true, 0, 500));
        assert!(needs_action(false, 1, 0));
    }

    #[test]
    fn up_to_date_files_are_skipped() {
        let local = tempfile::tempdir().unwrap();
        for (name, mtime) in [("same.txt", 100), ("older.txt", 300)] {
            let p = local.path().join(name);
            fs::write(&p, b"x").unwrap();
            set_file_mtime(&p, FileTime::from_unix_time(mtime, 0)).unwrap();
        }
        let mut session = MemorySession::new();
        session
            .add_file("/r/same.txt", 100, b"y".to_vec())
            .add_file("/r/older.txt", 200, b"y".to_vec());

        let plan = plan(&mut session, "/r", local.path(), &excluded(&[]), &NoopLogger).unwrap();
        assert!(plan.items.is_empty());
        assert_eq!(plan.counters.seen, 2);
        assert_eq!(plan.counters.skipped, 2);
    }

    #[test]
    fn missing_local_files_are_always_planned() {
        let local = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session.add_file("/r/epoch.txt", 1, b"y".to_vec());

        let plan = plan(&mut session, "/r", local.path(), &excluded(&[]), &NoopLogger).unwrap();
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].local_mtime, 0);
        assert_eq!(plan.items[0].local_path, local.path().join("epoch.txt"));
    }

    #[test]
    fn excluded_names_are_never_stat() {
        let local = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session
            .add_file("/r/keep.txt", 5, b"k".to_vec())
            .add_file("/r/cache/stale.bin", 9, b"s".to_vec());

        let plan = plan(&mut session, "/r", local.path(), &excluded(&["cache"]), &NoopLogger)
            .unwrap();
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].name, "keep.txt");
        assert_eq!(plan.counters.skipped, 1);
        assert!(!session.calls.stats.iter().any(|p| p.contains("cache")));
    }

    #[test]
    fn listing_order_is_preserved_with_dirs_interleaved() {
        let local = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session
            .add_file("/r/a.txt", 5, b"a".to_vec())
            .add_dir("/r/b", 5)
            .add_file("/r/c.txt", 5, b"c".to_vec());

        let plan = plan(&mut session, "/r", local.path(), &excluded(&[]), &NoopLogger).unwrap();
        let names: Vec<_> = plan.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b", "c.txt"]);
        assert_eq!(plan.files().count(), 2);
        assert_eq!(plan.directories().count(), 1);
        assert_eq!(plan.counters.directories, 1);
        assert_eq!(plan.counters.files, 2);
    }

    #[test]
    fn stat_failure_skips_entry_only() {
        let local = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session
            .add_file("/r/bad.txt", 5, b"a".to_vec())
            .add_file("/r/good.txt", 5, b"b".to_vec())
            .fail_stat("/r/bad.txt");

        let plan = plan(&mut session, "/r", local.path(), &excluded(&[]), &NoopLogger).unwrap();
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].name, "good.txt");
        assert_eq!(plan.counters.skipped, 1);
    }

    #[test]
    fn listing_failure_is_reported() {
        let local = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session.add_dir("/r", 1).fail_list("/r");

        let err = plan(&mut session, "/r", local.path(), &excluded(&[]), &NoopLogger).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ListFailed);
    }

    #[test]
    fn lost_session_during_stat_is_fatal() {
        let local = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session
            .add_file("/r/a.txt", 5, b"a".to_vec())
            .disconnect_on("/r/a.txt");

        let err = plan(&mut session, "/r", local.path(), &excluded(&[]), &NoopLogger).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Session);
    }
}
