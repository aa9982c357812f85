use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ledgit_sync::Direction;

#[derive(Parser)]
#[command(
    name = "ledgit",
    about = "Ledgit: content-addressed storage with local and remote copies",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Repository root (the directory holding `.ledgit/`).
    #[arg(short = 'C', long, global = true, default_value = ".")]
    pub repo: PathBuf,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create `.ledgit/` with an empty object store and default config
    Init(InitArgs),
    /// Blob storage maintenance
    Storage(StorageArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Mirror remote copies into this directory.
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct StorageArgs {
    #[command(subcommand)]
    pub action: StorageCommand,
}

#[derive(Subcommand)]
pub enum StorageCommand {
    /// Re-hash stored copies and optionally repair them
    Verify(VerifyArgs),
    /// Copy blobs between local and remote storage
    Sync(SyncArgs),
    /// Deduplicate legacy objects, recompress, clean
    Optimize(OptimizeArgs),
    /// Show blob counts and sizes
    Stats,
    /// Show network health, breakers and failure patterns
    Health(HealthArgs),
    /// Store a file as a blob
    Put(PutArgs),
    /// Print or save a blob's content
    Get(GetArgs),
    /// Rebuild the metadata index from the local object store
    Rebuild,
}

#[derive(Args)]
pub struct VerifyArgs {
    /// Rewrite corrupt copies from a valid one.
    #[arg(long)]
    pub repair: bool,
    /// Only these blob hashes (hex).
    #[arg(long, num_args = 1..)]
    pub blobs: Vec<String>,
    /// Also populate configured locations missing a copy.
    #[arg(long)]
    pub sync: bool,
}

#[derive(Args)]
pub struct SyncArgs {
    #[arg(long, default_value = "both")]
    pub direction: Direction,
    /// Simultaneous transfers (defaults to the configured value).
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Leave verified destination copies alone.
    #[arg(long)]
    pub skip_existing: bool,
    /// Only these blob hashes (hex).
    #[arg(long, num_args = 1..)]
    pub blobs: Vec<String>,
}

#[derive(Args)]
pub struct OptimizeArgs {
    #[arg(long)]
    pub deduplicate: bool,
    #[arg(long)]
    pub recompress: bool,
    #[arg(long)]
    pub clean: bool,
}

impl OptimizeArgs {
    /// No flag selects every pass.
    pub fn selects_all(&self) -> bool {
        !(self.deduplicate || self.recompress || self.clean)
    }
}

#[derive(Args)]
pub struct HealthArgs {
    /// Round trips to the remote before reporting.
    #[arg(long, default_value = "3")]
    pub probe: usize,
}

#[derive(Args)]
pub struct PutArgs {
    pub path: PathBuf,
    /// Also store a remote copy.
    #[arg(long)]
    pub remote: bool,
    #[arg(long)]
    pub content_type: Option<String>,
}

#[derive(Args)]
pub struct GetArgs {
    pub hash: String,
    /// Write to this file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Read the remote copy first.
    #[arg(long)]
    pub prefer_remote: bool,
}
