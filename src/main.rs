//! sftp-mirror - pull a remote SFTP tree onto local storage
//!
//! Only files whose remote mtime is newer than the local copy are fetched.
//! Every path out of the process removes a half-written file and writes
//! the download record.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use sftp_mirror::cli::Args;
use sftp_mirror::ledger::RunLedger;
use sftp_mirror::logger::{Logger, NoopLogger, TextLogger};
use sftp_mirror::run::{finish, run, RunOutcome};

fn main() -> Result<()> {
    let args = Args::parse();

    // Choose logger once; a log dir we cannot write must not stop the run
    let logger: Arc<dyn Logger> = match TextLogger::daily(&args.log_dir, args.verbose) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            eprintln!("warning: file logging disabled: {e:#}");
            Arc::new(NoopLogger)
        }
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    let ledger = RunLedger::new();

    // First Ctrl-C: stop at the next chunk/file boundary. Second: conclude
    // the run from here (cleanup, record, config) and leave now.
    {
        let interrupt = Arc::clone(&interrupt);
        let ledger = ledger.clone();
        let log_dir = args.log_dir.clone();
        let logger = Arc::clone(&logger);
        let presses = AtomicUsize::new(0);
        ctrlc::set_handler(move || {
            if presses.fetch_add(1, Ordering::SeqCst) == 0 {
                eprintln!("\nInterrupted by user. Finishing current chunk (Ctrl-C again to abort)...");
                interrupt.store(true, Ordering::SeqCst);
            } else {
                eprintln!("\nAborting.");
                ledger.conclude(&log_dir, logger.as_ref());
                std::process::exit(130);
            }
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let (ledger, outcome) = run(&args, ledger, logger.as_ref(), interrupt);
    let record = finish(&ledger, &outcome, &args.log_dir, logger.as_ref());

    match &outcome {
        RunOutcome::Completed(c) => {
            println!();
            println!("=== Mirror Complete ===");
            println!("Entries seen: {}", c.seen);
            println!("Files downloaded: {}", c.downloaded);
            println!("Up to date / skipped: {}", c.skipped);
            if c.failed > 0 {
                println!("Failed: {}", c.failed);
            }
        }
        RunOutcome::Interrupted => {
            println!("Interrupted after {} downloads", ledger.record().len());
        }
        RunOutcome::Failed(e) => {
            eprintln!("Error: {e:#}");
            eprintln!(
                "Details: {}",
                ledger.error_report_path(&args.log_dir).display()
            );
        }
    }
    if let Some(path) = record {
        println!("Download record: {}", path.display());
    }

    std::process::exit(outcome.exit_code());
}
