use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Admin CLI for QuiverLevel databases. Options come from QL_* env vars.
#[derive(Parser, Debug)]
#[command(name = "quiverlevel", version, about = "QuiverLevel admin CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Put key/value
    Put {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        key: String,
        /// Literal UTF-8, `hex:<digits>`, `@file` or `-` for stdin
        #[arg(long)]
        value: String,
        /// Column family (default column if omitted)
        #[arg(long)]
        column: Option<String>,
        /// fsync the WAL before returning
        #[arg(long)]
        sync: bool,
    },
    /// Get key
    Get {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        column: Option<String>,
        /// Optional file to write the raw value into
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete key
    Del {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        column: Option<String>,
    },
    /// Range scan with optional regex filters. --json prints one JSON object per line.
    Scan(ScanArgs),
    /// Print committed batches after --since
    Updates {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = 0)]
        since: u64,
        /// Keep waiting for new commits (Ctrl-C to stop)
        #[arg(long)]
        follow: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print an engine property (e.g. quiverlevel.stats)
    Property {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
    },
    /// Checkpoint and prune covered WAL segments
    Compact {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        column: Option<String>,
    },
    /// List live WAL segments
    WalFiles {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    #[arg(long)]
    pub path: PathBuf,
    #[arg(long)]
    pub column: Option<String>,
    #[arg(long)]
    pub gt: Option<String>,
    #[arg(long)]
    pub gte: Option<String>,
    #[arg(long)]
    pub lt: Option<String>,
    #[arg(long)]
    pub lte: Option<String>,
    #[arg(long)]
    pub reverse: bool,
    #[arg(long)]
    pub limit: Option<usize>,
    /// Regex over keys; prefix with (?i) for case-insensitive
    #[arg(long)]
    pub key_filter: Option<String>,
    #[arg(long)]
    pub value_filter: Option<String>,
    #[arg(long)]
    pub json: bool,
}
