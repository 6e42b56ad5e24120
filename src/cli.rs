//! Command-line arguments

use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Clone, Debug, Parser)]
#[command(
    author,
    version,
    about = "sftp-mirror - one-way incremental mirror of a remote SFTP tree"
)]
pub struct Args {
    /// JSON configuration file (read at start, written back at exit)
    #[arg(short = 'c', long, default_value = "config.json")]
    pub config: PathBuf,

    /// Directory for the daily log, download records and error reports
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Bulk/chunk threshold in bytes (overrides the config file)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Extra entry names to exclude for this run
    #[arg(long = "exclude", action = ArgAction::Append)]
    pub exclude: Vec<String>,

    /// Echo log lines to stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Show byte progress for chunked downloads
    #[arg(short, long)]
    pub progress: bool,

    /// Plan only: report what would be downloaded
    #[arg(long)]
    pub dry_run: bool,
}
