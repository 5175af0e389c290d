use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "shard",
    about = "shardstore -- sharded chunk storage",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store root; overrides the root from the configuration file
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

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
    /// Store a named record
    Put(PutArgs),
    /// Store a content-addressed blob
    PutBlob(PutBlobArgs),
    /// Print a named record or blob
    Get(GetArgs),
    /// Delete a named record or blob
    Rm(RmArgs),
    /// List stored chunks in an address range
    Ls(LsArgs),
    /// Show store layout, shard usage and cache statistics
    Stat(StatArgs),
    /// Parse every chunk file and report damage
    Fsck(FsckArgs),
}

/// Where a payload comes from. Standard input when neither flag is given.
#[derive(Args)]
pub struct Source {
    /// Read the payload from a file
    #[arg(long, conflicts_with = "text")]
    pub file: Option<PathBuf>,
    /// Use the given text as the payload
    #[arg(long)]
    pub text: Option<String>,
}

#[derive(Args)]
pub struct PutArgs {
    pub name: String,
    #[command(flatten)]
    pub source: Source,
    /// Overwrite even if the stored record is identical
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct PutBlobArgs {
    #[command(flatten)]
    pub source: Source,
}

#[derive(Args)]
pub struct GetArgs {
    /// Record name, or blob address with --blob
    pub key: String,
    #[arg(long)]
    pub blob: bool,
}

#[derive(Args)]
pub struct RmArgs {
    /// Record name, or blob address with --blob
    pub key: String,
    #[arg(long)]
    pub blob: bool,
}

#[derive(Args)]
pub struct LsArgs {
    /// Lowest address, in hex
    #[arg(long)]
    pub min: Option<String>,
    /// Highest address, in hex
    #[arg(long)]
    pub max: Option<String>,
}

#[derive(Args)]
pub struct StatArgs {}

#[derive(Args)]
pub struct FsckArgs {}
