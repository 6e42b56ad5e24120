//! Run ledger: what this run downloaded, and which file is mid-flight.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::config::Config;
use crate::logger::Logger;

/// Key holding the total in the persisted record.
pub const COUNT_KEY: &str = "downloaded_count";

/// The local path currently being written and not yet verified.
///
/// Shared with the interrupt handler so a hard exit can still remove a
/// truncated file.
#[derive(Debug, Clone, Default)]
pub struct AttemptSlot(Arc<Mutex<Option<PathBuf>>>);

impl AttemptSlot {
    pub fn set(&self, path: &Path) {
        *self.0.lock() = Some(path.to_path_buf());
    }

    pub fn clear(&self) {
        self.0.lock().take();
    }

    pub fn get(&self) -> Option<PathBuf> {
        self.0.lock().clone()
    }

    /// Remove the marked file if it exists. Never fails; the slot is emptied.
    pub fn cleanup(&self, logger: &dyn Logger) -> Option<PathBuf> {
        let path = self.0.lock().take()?;
        match fs::remove_file(&path) {
            Ok(()) => {
                logger.cleanup(&path, "removed");
                Some(path)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                logger.cleanup(&path, "not created yet");
                None
            }
            Err(e) => {
                logger.cleanup(&path, &format!("remove failed: {e}"));
                None
            }
        }
    }
}

/// Ordered `timestamp -> remote path` audit trail.
#[derive(Debug, Default, Clone)]
pub struct DownloadRecord {
    entries: Vec<(String, String)>,
}

impl DownloadRecord {
    pub fn push(&mut self, stamp: String, remote_path: &str) {
        let key = self.unique_key(stamp);
        self.entries.push((key, remote_path.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // Same-millisecond downloads get ` #2`, ` #3`, ...
    fn unique_key(&self, stamp: String) -> String {
        if !self.entries.iter().any(|(k, _)| *k == stamp) {
            return stamp;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{stamp} #{n}");
            if !self.entries.iter().any(|(k, _)| *k == candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

impl Serialize for DownloadRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len() + 1))?;
        for (stamp, path) in &self.entries {
            map.serialize_entry(stamp, path)?;
        }
        map.serialize_entry(COUNT_KEY, &self.entries.len())?;
        map.end()
    }
}

/// Run state that must survive every way out of the process.
///
/// Clones share the same slot, record and config, so the interrupt handler
/// can conclude the run from its own thread.
#[derive(Debug, Clone)]
pub struct RunLedger {
    pub run_id: String,
    started: String,
    slot: AttemptSlot,
    record: Arc<Mutex<DownloadRecord>>,
    config: Arc<Mutex<Option<(PathBuf, Config)>>>,
    concluded: Arc<AtomicBool>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started: Local::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
            slot: AttemptSlot::default(),
            record: Arc::default(),
            config: Arc::default(),
            concluded: Arc::default(),
        }
    }

    /// Remember the loaded config so it is written back on conclusion.
    pub fn keep_config(&self, path: &Path, config: Config) {
        *self.config.lock() = Some((path.to_path_buf(), config));
    }

    pub fn begin_attempt(&self, local: &Path) {
        self.slot.set(local);
    }

    pub fn attempt_verified(&self) {
        self.slot.clear();
    }

    pub fn last_attempted(&self) -> Option<PathBuf> {
        self.slot.get()
    }

    pub fn record_download(&self, remote_path: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        self.record.lock().push(stamp, remote_path);
    }

    /// Snapshot of the downloads so far.
    pub fn record(&self) -> DownloadRecord {
        self.record.lock().clone()
    }

    pub fn cleanup(&self, logger: &dyn Logger) -> Option<PathBuf> {
        self.slot.cleanup(logger)
    }

    /// Run-stamped file the record is written to.
    pub fn record_path(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{} downloaded.json", self.started))
    }

    pub fn error_report_path(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{} error.log", self.started))
    }

    pub fn write_record(&self, log_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let path = self.record_path(log_dir);
        let mut json = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut json, formatter);
        self.record()
            .serialize(&mut ser)
            .context("failed to serialize download record")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write download record {}", path.display()))?;
        Ok(path)
    }

    /// Best-effort write of the record; failures are logged only.
    pub fn persist(&self, log_dir: &Path, logger: &dyn Logger) -> Option<PathBuf> {
        match self.write_record(log_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                logger.error("persist", &log_dir.display().to_string(), &format!("{e:#}"));
                None
            }
        }
    }
}

impl RunLedger {
    /// Last step of a run, taken by whichever exit path gets here first.
    /// Later calls do nothing and return `None`.
    pub fn conclude(&self, log_dir: &Path, logger: &dyn Logger) -> Option<PathBuf> {
        if self.concluded.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.cleanup(logger);
        let record = self.persist(log_dir, logger);
        if let Some((path, config)) = self.config.lock().as_ref() {
            if let Err(e) = config.save(path) {
                logger.error("config", &path.display().to_string(), &format!("{e:#}"));
            }
        }
        record
    }
}

impl Default for RunLedger {
    fn default() -> Self {
        Self::new()
    }
}
