use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::mirror::RunCounters;
use crate::planner::WorkItem;

/// Rotate the daily log once it grows past this many bytes.
pub const DEFAULT_ROTATE_BYTES: u64 = 5 * 1024 * 1024;

pub trait Logger: Send + Sync {
    fn run_start(&self, _run_id: &str, _remote: &str, _local: &Path) {}
    fn enter_dir(&self, _remote: &str) {}
    fn planned(&self, _remote: &str, _counters: &RunCounters) {}
    fn skip(&self, _remote: &str, _reason: &str) {}
    fn file_start(&self, _item: &WorkItem, _position: u64, _total: u64) {}
    fn file_done(&self, _item: &WorkItem, _bytes: u64) {}
    fn file_failed(&self, _item: &WorkItem, _msg: &str) {}
    fn cleanup(&self, _path: &Path, _outcome: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _context: &str, _target: &str, _msg: &str) {}
    fn done(&self, _counters: &RunCounters, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

struct LogFile {
    path: PathBuf,
    file: File,
    written: u64,
}

pub struct TextLogger {
    inner: Mutex<LogFile>,
    rotate_bytes: u64,
    echo: bool,
}

impl TextLogger {
    /// Append to `<dir>/<YYYY-MM-DD>.log`.
    pub fn daily(dir: &Path, echo: bool) -> Result<Self> {
        let name = format!("{}.log", Local::now().format("%Y-%m-%d"));
        Self::new(dir.join(name), DEFAULT_ROTATE_BYTES, echo)
    }

    pub fn new<P: AsRef<Path>>(path: P, rotate_bytes: u64, echo: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let file = open_append(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            inner: Mutex::new(LogFile {
                path,
                file,
                written,
            }),
            rotate_bytes,
            echo,
        })
    }

    fn line(&self, level: &str, s: &str) {
        let stamp: DateTime<Utc> = Utc::now();
        let text = format!("[{}] {:<5} {}\n", stamp.to_rfc3339(), level, s);
        if self.echo {
            eprint!("{text}");
        }
        if let Ok(mut log) = self.inner.lock() {
            if log.written + text.len() as u64 > self.rotate_bytes && log.written > 0 {
                rotate(&mut log);
            }
            if log.file.write_all(text.as_bytes()).is_ok() {
                log.written += text.len() as u64;
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

// Current file moves to `<name>.1`; a fresh file takes its place.
fn rotate(log: &mut LogFile) {
    let mut rotated = log.path.clone().into_os_string();
    rotated.push(".1");
    let _ = log.file.flush();
    if fs::rename(&log.path, &rotated).is_err() {
        return;
    }
    if let Ok(file) = open_append(&log.path) {
        log.file = file;
        log.written = 0;
    }
}

fn fmt_time(secs: u64) -> String {
    DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

impl Logger for TextLogger {
    fn run_start(&self, run_id: &str, remote: &str, local: &Path) {
        self.line(
            "INFO",
            &format!("START run={} remote={} local={}", run_id, remote, local.display()),
        );
    }
    fn enter_dir(&self, remote: &str) {
        self.line("INFO", &format!("DIR remote={remote}"));
    }
    fn planned(&self, remote: &str, c: &RunCounters) {
        self.line(
            "INFO",
            &format!(
                "PLAN remote={} seen={} dirs={} files={} skipped={}",
                remote, c.seen, c.directories, c.files, c.skipped
            ),
        );
    }
    fn skip(&self, remote: &str, reason: &str) {
        self.line("DEBUG", &format!("SKIP remote={remote} reason={reason}"));
    }
    fn file_start(&self, item: &WorkItem, position: u64, total: u64) {
        let mut msg = format!(
            "FETCH remote={} remote_mtime={} size_kb={:.2} n={}/{}",
            item.remote_path,
            fmt_time(item.remote_mtime),
            item.remote_size as f64 / 1024.0,
            position,
            total
        );
        if item.local_mtime > 0 {
            msg.push_str(&format!(" local_mtime={}", fmt_time(item.local_mtime)));
        }
        self.line("INFO", &msg);
    }
    fn file_done(&self, item: &WorkItem, bytes: u64) {
        self.line(
            "INFO",
            &format!("OK remote={} local={} bytes={}", item.remote_path, item.local_path.display(), bytes),
        );
    }
    fn file_failed(&self, item: &WorkItem, msg: &str) {
        self.line("ERROR", &format!("FAIL remote={} msg={}", item.remote_path, msg));
    }
    fn cleanup(&self, path: &Path, outcome: &str) {
        self.line("WARN", &format!("CLEANUP path={} {}", path.display(), outcome));
    }
    fn warn(&self, msg: &str) {
        self.line("WARN", msg);
    }
    fn error(&self, context: &str, target: &str, msg: &str) {
        self.line("ERROR", &format!("ERROR ctx={context} target={target} msg={msg}"));
    }
    fn done(&self, c: &RunCounters, seconds: f64) {
        self.line(
            "INFO",
            &format!(
                "DONE seen={} dirs={} files={} skipped={} downloaded={} failed={} seconds={:.3}",
                c.seen, c.directories, c.files, c.skipped, c.downloaded, c.failed, seconds
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_leveled_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let logger = TextLogger::new(&path, DEFAULT_ROTATE_BYTES, false).unwrap();
        logger.warn("disk almost full");
        logger.error("list", "/backup", "permission denied");

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("WARN  disk almost full"));
        assert!(lines[1].contains("ctx=list target=/backup"));
    }

    #[test]
    fn rotates_when_limit_is_crossed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let logger = TextLogger::new(&path, 120, false).unwrap();
        for i in 0..6 {
            logger.warn(&format!("message number {i} with some padding"));
        }

        assert!(dir.path().join("run.log.1").exists());
        assert!(fs::metadata(&path).unwrap().len() <= 120);
    }
}
