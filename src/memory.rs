//! In-memory remote tree implementing [`RemoteSession`].
//!
//! Records every call it serves so tests can assert on traffic, and can be
//! told to misbehave (short reads, failing stat/list, dropped connection).

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::RemoteError;
use crate::session::{join_remote, RemoteEntry, RemoteSession, RemoteStat};

#[derive(Debug, Clone)]
enum Node {
    Dir { mtime: u64 },
    File { mtime: u64, data: Vec<u8> },
}

/// Call counters, shared with readers handed out by `open_stream`.
#[derive(Debug, Default)]
pub struct CallLog {
    pub lists: Vec<String>,
    pub stats: Vec<String>,
    pub bulk_fetches: Vec<String>,
    pub streams_opened: Vec<String>,
    chunk_reads: Arc<AtomicUsize>,
}

impl CallLog {
    /// Non-empty reads served by streams.
    pub fn chunk_reads(&self) -> usize {
        self.chunk_reads.load(Ordering::SeqCst)
    }
}

/// Misbehaviour of a stream once it has served a number of chunks.
#[derive(Debug, Clone)]
enum ReadFault {
    RaiseFlag(Arc<AtomicBool>),
    Disconnect,
}

#[derive(Debug, Default)]
pub struct MemorySession {
    nodes: BTreeMap<String, Node>,
    truncate: BTreeMap<String, usize>,
    fail_stat: HashSet<String>,
    fail_list: HashSet<String>,
    disconnect_on: HashSet<String>,
    read_faults: BTreeMap<String, (usize, ReadFault)>,
    pub calls: CallLog,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory (and any missing parents).
    pub fn add_dir(&mut self, path: &str, mtime: u64) -> &mut Self {
        let path = normalize(path);
        self.ensure_parents(&path, mtime);
        self.nodes.insert(path, Node::Dir { mtime });
        self
    }

    /// Add a file (and any missing parent directories).
    pub fn add_file(&mut self, path: &str, mtime: u64, data: impl Into<Vec<u8>>) -> &mut Self {
        let path = normalize(path);
        self.ensure_parents(&path, mtime);
        self.nodes.insert(
            path,
            Node::File {
                mtime,
                data: data.into(),
            },
        );
        self
    }

    /// Serve at most `limit` bytes of `path` while still reporting its full size.
    pub fn truncate_reads(&mut self, path: &str, limit: usize) -> &mut Self {
        self.truncate.insert(normalize(path), limit);
        self
    }

    pub fn fail_stat(&mut self, path: &str) -> &mut Self {
        self.fail_stat.insert(normalize(path));
        self
    }

    pub fn fail_list(&mut self, path: &str) -> &mut Self {
        self.fail_list.insert(normalize(path));
        self
    }

    /// Any operation touching `path` reports a lost session.
    pub fn disconnect_on(&mut self, path: &str) -> &mut Self {
        self.disconnect_on.insert(normalize(path));
        self
    }

    /// Set `flag` once a stream of `path` has served `reads` chunks, the way
    /// a Ctrl-C landing mid-transfer would.
    pub fn raise_after_reads(&mut self, path: &str, reads: usize, flag: Arc<AtomicBool>) -> &mut Self {
        self.read_faults
            .insert(normalize(path), (reads, ReadFault::RaiseFlag(flag)));
        self
    }

    /// Streams of `path` fail with a lost session after `reads` chunks.
    pub fn disconnect_after_reads(&mut self, path: &str, reads: usize) -> &mut Self {
        self.read_faults
            .insert(normalize(path), (reads, ReadFault::Disconnect));
        self
    }

    fn ensure_parents(&mut self, path: &str, mtime: u64) {
        let mut parent = parent_of(path);
        while let Some(p) = parent {
            self.nodes
                .entry(p.clone())
                .or_insert(Node::Dir { mtime });
            parent = parent_of(&p);
        }
    }

    fn check_connected(&self, path: &str) -> Result<(), RemoteError> {
        if self.disconnect_on.contains(path) {
            return Err(RemoteError::disconnected(format!(
                "connection lost while accessing {path}"
            )));
        }
        Ok(())
    }

    fn served_bytes(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        match self.nodes.get(path) {
            Some(Node::File { data, .. }) => {
                let limit = self.truncate.get(path).copied().unwrap_or(data.len());
                Ok(data[..limit.min(data.len())].to_vec())
            }
            Some(Node::Dir { .. }) => Err(RemoteError::operation(format!("{path} is a directory"))),
            None => Err(RemoteError::operation(format!("no such file: {path}"))),
        }
    }
}

impl RemoteSession for MemorySession {
    fn list_entries(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let path = normalize(path);
        self.calls.lists.push(path.clone());
        self.check_connected(&path)?;
        if self.fail_list.contains(&path) {
            return Err(RemoteError::operation(format!("permission denied: {path}")));
        }
        match self.nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            _ => return Err(RemoteError::operation(format!("no such directory: {path}"))),
        }

        let mut entries = vec![dot_entry(&path, "."), dot_entry(&path, "..")];
        for (child, node) in &self.nodes {
            if parent_of(child).as_deref() != Some(path.as_str()) {
                continue;
            }
            let name = child.rsplit('/').next().unwrap_or(child).to_string();
            let (is_directory, size, mtime) = match node {
                Node::Dir { mtime } => (true, 0, *mtime),
                Node::File { mtime, data } => (false, data.len() as u64, *mtime),
            };
            entries.push(RemoteEntry {
                name,
                path: child.clone(),
                is_directory,
                size,
                mtime,
            });
        }
        Ok(entries)
    }

    fn stat_entry(&mut self, path: &str) -> Result<RemoteStat, RemoteError> {
        let path = normalize(path);
        self.calls.stats.push(path.clone());
        self.check_connected(&path)?;
        if self.fail_stat.contains(&path) {
            return Err(RemoteError::operation(format!("stat refused: {path}")));
        }
        match self.nodes.get(&path) {
            Some(Node::Dir { mtime }) => Ok(RemoteStat {
                size: 0,
                mtime: *mtime,
                is_directory: true,
            }),
            Some(Node::File { mtime, data }) => Ok(RemoteStat {
                size: data.len() as u64,
                mtime: *mtime,
                is_directory: false,
            }),
            None => Err(RemoteError::operation(format!("no such file: {path}"))),
        }
    }

    fn open_stream(&mut self, path: &str) -> Result<Box<dyn Read + '_>, RemoteError> {
        let path = normalize(path);
        self.calls.streams_opened.push(path.clone());
        self.check_connected(&path)?;
        let data = self.served_bytes(&path)?;
        Ok(Box::new(CountingReader {
            inner: io::Cursor::new(data),
            reads: Arc::clone(&self.calls.chunk_reads),
            served: 0,
            fault: self.read_faults.get(&path).cloned(),
        }))
    }

    fn fetch_whole(&mut self, remote: &str, local: &Path) -> Result<u64, RemoteError> {
        let remote = normalize(remote);
        self.calls.bulk_fetches.push(remote.clone());
        self.check_connected(&remote)?;
        let data = self.served_bytes(&remote)?;
        std::fs::write(local, &data)
            .map_err(|e| RemoteError::operation(format!("write {}: {e}", local.display())))?;
        Ok(data.len() as u64)
    }
}

struct CountingReader {
    inner: io::Cursor<Vec<u8>>,
    reads: Arc<AtomicUsize>,
    served: usize,
    fault: Option<(usize, ReadFault)>,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some((after, ReadFault::Disconnect)) = &self.fault {
            if self.served >= *after {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    RemoteError::disconnected("connection lost mid-transfer"),
                ));
            }
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.served += 1;
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
        if let Some((after, ReadFault::RaiseFlag(flag))) = &self.fault {
            if self.served >= *after {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(n)
    }
}

fn dot_entry(dir: &str, name: &str) -> RemoteEntry {
    RemoteEntry {
        name: name.to_string(),
        path: join_remote(dir, name),
        is_directory: true,
        size: 0,
        mtime: 0,
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}
