//! One run from config to exit: connect, mirror, and on every path out
//! clean up the in-flight file, persist the record and write the config back.
//!
//! The last three steps live in [`RunLedger::conclude`] so the Ctrl-C
//! handler can run them too.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};

use crate::cli::Args;
use crate::config::Config;
use crate::error::TransferError;
use crate::ledger::RunLedger;
use crate::logger::Logger;
use crate::mirror::{Mirror, RunCounters};
use crate::session::RemoteSession;
use crate::sftp::SftpSession;
use crate::transfer::{TransferEngine, TransferOptions};

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub remote_root: String,
    pub local_root: PathBuf,
    pub excluded: BTreeSet<String>,
    pub transfer: TransferOptions,
    pub dry_run: bool,
}

impl RunSettings {
    /// Merge the config file with command-line overrides.
    pub fn resolve(config: &Config, args: &Args) -> Result<Self> {
        let chunk_size = args.chunk_size.unwrap_or(config.chunk_size);
        if chunk_size == 0 {
            return Err(anyhow!("chunk size must be greater than zero"));
        }
        let mut excluded = config.excluded_names();
        excluded.extend(args.exclude.iter().cloned());
        Ok(Self {
            remote_root: config.remote_path.clone(),
            local_root: config.local_root()?,
            excluded,
            transfer: TransferOptions {
                chunk_size,
                preserve_mtime: config.preserve_mtime,
                show_progress: args.progress,
            },
            dry_run: args.dry_run,
        })
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunCounters),
    Interrupted,
    Failed(anyhow::Error),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(_) => 0,
            RunOutcome::Interrupted => 130,
            RunOutcome::Failed(_) => 1,
        }
    }
}

/// Mirror with an already-open session. Cleans up after a fatal error but
/// does not persist; see [`finish`].
pub fn run_mirror<S: RemoteSession>(
    session: S,
    settings: &RunSettings,
    ledger: RunLedger,
    logger: &dyn Logger,
    interrupt: Arc<AtomicBool>,
) -> (RunLedger, RunOutcome) {
    logger.run_start(&ledger.run_id, &settings.remote_root, &settings.local_root);
    let started = Instant::now();

    let engine = TransferEngine::new(settings.transfer.clone(), Arc::clone(&interrupt));
    let mut mirror = Mirror::new(session, engine, settings.excluded.clone(), logger, interrupt)
        .with_ledger(ledger)
        .dry_run(settings.dry_run);

    let outcome = match mirror.mirror(&settings.remote_root, &settings.local_root) {
        Ok(counters) => {
            logger.done(&counters, started.elapsed().as_secs_f64());
            RunOutcome::Completed(counters)
        }
        Err(TransferError::Interrupted) => {
            logger.warn("interrupted by user");
            mirror.cleanup();
            RunOutcome::Interrupted
        }
        // An unreadable root is an empty mirror, not a failed run
        Err(e @ TransferError::ListFailed { .. }) => {
            logger.error("list", &settings.remote_root, &e.to_string());
            let counters = RunCounters {
                skipped: 1,
                ..RunCounters::default()
            };
            logger.done(&counters, started.elapsed().as_secs_f64());
            RunOutcome::Completed(counters)
        }
        Err(e) => {
            logger.error("run", &settings.remote_root, &e.to_string());
            mirror.cleanup();
            let kind = e.kind();
            RunOutcome::Failed(anyhow::Error::new(e).context(format!("mirror run failed ({kind})")))
        }
    };

    (mirror.into_ledger(), outcome)
}

/// Full run: load config, connect over SFTP, mirror. The config is handed to
/// the ledger and written back by [`finish`].
pub fn run(
    args: &Args,
    ledger: RunLedger,
    logger: &dyn Logger,
    interrupt: Arc<AtomicBool>,
) -> (RunLedger, RunOutcome) {
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            logger.error("config", &args.config.display().to_string(), &format!("{e:#}"));
            return (ledger, RunOutcome::Failed(e));
        }
    };

    ledger.keep_config(&args.config, config.clone());
    connect_and_mirror(&config, args, ledger, logger, interrupt)
}

fn connect_and_mirror(
    config: &Config,
    args: &Args,
    ledger: RunLedger,
    logger: &dyn Logger,
    interrupt: Arc<AtomicBool>,
) -> (RunLedger, RunOutcome) {
    let settings = match prepare(config, args, logger) {
        Ok(settings) => settings,
        Err(e) => return (ledger, RunOutcome::Failed(e)),
    };

    let session = match SftpSession::connect(config) {
        Ok(session) => session,
        Err(e) => {
            logger.error("connect", &config.hostname, &format!("{e:#}"));
            return (ledger, RunOutcome::Failed(e));
        }
    };

    run_mirror(session, &settings, ledger, logger, interrupt)
}

fn prepare(config: &Config, args: &Args, logger: &dyn Logger) -> Result<RunSettings> {
    let settings = RunSettings::resolve(config, args)?;
    if !settings.local_root.exists() {
        logger.warn(&format!(
            "local root {} does not exist, creating it",
            settings.local_root.display()
        ));
        fs::create_dir_all(&settings.local_root).with_context(|| {
            format!("failed to create local root {}", settings.local_root.display())
        })?;
    }
    Ok(settings)
}

/// Exit path shared by every outcome: an error report for failures, then
/// [`RunLedger::conclude`]. Returns the record path if it was written.
pub fn finish(
    ledger: &RunLedger,
    outcome: &RunOutcome,
    log_dir: &Path,
    logger: &dyn Logger,
) -> Option<PathBuf> {
    if let RunOutcome::Failed(err) = outcome {
        write_error_report(ledger, err, log_dir, logger);
    }
    ledger.conclude(log_dir, logger)
}

fn write_error_report(ledger: &RunLedger, err: &anyhow::Error, log_dir: &Path, logger: &dyn Logger) {
    let path = ledger.error_report_path(log_dir);
    let written = fs::create_dir_all(log_dir).and_then(|_| fs::write(&path, format!("{err:?}\n")));
    if let Err(e) = written {
        logger.error("error-report", &path.display().to_string(), &e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::memory::MemorySession;
    use clap::Parser;

    fn settings(local: &Path) -> RunSettings {
        RunSettings {
            remote_root: "/backup".into(),
            local_root: local.to_path_buf(),
            excluded: BTreeSet::new(),
            transfer: TransferOptions::default(),
            dry_run: false,
        }
    }

    fn chunked(local: &Path, chunk_size: u64) -> RunSettings {
        RunSettings {
            transfer: TransferOptions {
                chunk_size,
                ..TransferOptions::default()
            },
            ..settings(local)
        }
    }

    fn record_count(path: PathBuf) -> serde_json::Value {
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        value["downloaded_count"].clone()
    }

    #[test]
    fn resolve_merges_cli_overrides() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "hostname": "h", "username": "u", "remote_path": "/backup",
            "local_path": "/tmp/mirror", "ignore_directories": ["tmp"]
        }))
        .unwrap();
        let args = Args::parse_from(["sftp-mirror", "--exclude", "cache", "--chunk-size", "4096"]);

        let settings = RunSettings::resolve(&config, &args).unwrap();
        assert_eq!(settings.transfer.chunk_size, 4096);
        assert!(settings.excluded.contains("tmp"));
        assert!(settings.excluded.contains("cache"));
    }

    #[test]
    fn session_lost_while_planning_fails_the_run() {
        let local = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session
            .add_file("/backup/a.txt", 5, b"a".to_vec())
            .add_file("/backup/sub/b.txt", 5, b"b".to_vec())
            .disconnect_on("/backup/sub/b.txt");

        let (ledger, outcome) = run_mirror(
            &mut session,
            &settings(local.path()),
            RunLedger::new(),
            &NoopLogger,
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(outcome.exit_code(), 1);

        let record = finish(&ledger, &outcome, logs.path(), &NoopLogger).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(record).unwrap()).unwrap();
        assert_eq!(value["downloaded_count"], 1);
        assert!(ledger.error_report_path(logs.path()).exists());
    }

    #[test]
    fn interrupt_mid_transfer_removes_partial_file() {
        let local = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let interrupt = Arc::new(AtomicBool::new(false));
        let mut session = MemorySession::new();
        session
            .add_file("/backup/big.bin", 5, vec![3u8; 1000])
            .raise_after_reads("/backup/big.bin", 1, Arc::clone(&interrupt));

        let (ledger, outcome) = run_mirror(
            &mut session,
            &chunked(local.path(), 100),
            RunLedger::new(),
            &NoopLogger,
            interrupt,
        );

        assert!(matches!(outcome, RunOutcome::Interrupted));
        assert_eq!(session.calls.chunk_reads(), 1);
        assert!(!local.path().join("big.bin").exists());
        assert_eq!(ledger.last_attempted(), None);

        let record = finish(&ledger, &outcome, logs.path(), &NoopLogger).unwrap();
        assert_eq!(record_count(record), 0);
    }

    #[test]
    fn connection_drop_mid_transfer_removes_partial_file() {
        let local = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session
            .add_file("/backup/a.txt", 5, b"a".to_vec())
            .add_file("/backup/big.bin", 5, vec![3u8; 1000])
            .disconnect_after_reads("/backup/big.bin", 2);

        let (ledger, outcome) = run_mirror(
            &mut session,
            &chunked(local.path(), 100),
            RunLedger::new(),
            &NoopLogger,
            Arc::new(AtomicBool::new(false)),
        );

        match &outcome {
            RunOutcome::Failed(e) => assert!(format!("{e:#}").contains("session")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(session.calls.chunk_reads(), 2);
        assert!(local.path().join("a.txt").exists());
        assert!(!local.path().join("big.bin").exists());

        let record = finish(&ledger, &outcome, logs.path(), &NoopLogger).unwrap();
        assert_eq!(record_count(record), 1);
        assert!(ledger.error_report_path(logs.path()).exists());
    }

    #[test]
    fn unreadable_root_completes_empty() {
        let local = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session
            .add_file("/backup/a.txt", 5, b"a".to_vec())
            .fail_list("/backup");

        let (_, outcome) = run_mirror(
            &mut session,
            &settings(local.path()),
            RunLedger::new(),
            &NoopLogger,
            Arc::new(AtomicBool::new(false)),
        );
        match outcome {
            RunOutcome::Completed(counters) => {
                assert_eq!(counters.skipped, 1);
                assert_eq!(counters.downloaded, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn config_is_written_back_when_the_run_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let config_path = dir.path().join("config.json");
        fs::write(
            &config_path,
            r#"{"hostname":"h","username":"u","remote_path":"/backup","local_path":"mirror","skip_directories":["tmp"]}"#,
        )
        .unwrap();
        let args = Args::parse_from([
            "sftp-mirror",
            "--config",
            config_path.to_str().unwrap(),
            "--chunk-size",
            "0",
        ]);

        let (ledger, outcome) = run(&args, RunLedger::new(), &NoopLogger, Arc::new(AtomicBool::new(false)));
        assert_eq!(outcome.exit_code(), 1);
        fs::remove_file(&config_path).unwrap();

        finish(&ledger, &outcome, &logs, &NoopLogger).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(written["skip_directories"][0], "tmp");
        assert!(ledger.error_report_path(&logs).exists());
    }

    #[test]
    fn interrupted_run_has_no_error_report() {
        let local = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let mut session = MemorySession::new();
        session.add_file("/backup/a.txt", 5, b"a".to_vec());

        let (ledger, outcome) = run_mirror(
            &mut session,
            &settings(local.path()),
            RunLedger::new(),
            &NoopLogger,
            Arc::new(AtomicBool::new(true)),
        );
        assert!(matches!(outcome, RunOutcome::Interrupted));
        assert_eq!(outcome.exit_code(), 130);

        finish(&ledger, &outcome, logs.path(), &NoopLogger).unwrap();
        assert!(!ledger.error_report_path(logs.path()).exists());
    }

    #[test]
    fn missing_config_fails_without_touching_anything() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::parse_from([
            "sftp-mirror",
            "--config",
            dir.path().join("absent.json").to_str().unwrap(),
        ]);
        let (_, outcome) = run(&args, RunLedger::new(), &NoopLogger, Arc::new(AtomicBool::new(false)));
        match outcome {
            RunOutcome::Failed(e) => assert!(format!("{e:#}").contains("absent.json")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
