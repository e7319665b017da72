use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Move DigitaltMuseum pictures to Wikimedia Commons
#[derive(Parser)]
#[command(name = "dmcommons", version)]
#[command(about = "Fetch artifacts from DigitaltMuseum and upload them to Wikimedia Commons", long_about = None)]
pub struct Cli {
    /// Database URL (defaults to a SQLite file in the user data directory)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// TOML configuration file (overrides DMCOMMONS_CONFIG)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch an artifact and show a summary
    Fetch {
        /// Artifact identifier or DigitaltMuseum URL
        reference: String,
        /// Bypass the response cache
        #[arg(long)]
        refresh: bool,
    },
    /// Show the files an upload would create
    Preview {
        reference: String,
        /// Print the full file description page text
        #[arg(long)]
        wikitext: bool,
    },
    /// Upload an artifact's freely licensed pictures
    Upload {
        reference: String,
        /// Plan only; nothing is uploaded or recorded
        #[arg(long)]
        dry_run: bool,
        /// Only these picture identifiers (repeatable)
        #[arg(long = "media", value_name = "ID")]
        media: Vec<String>,
        /// Retry uploads Commons warned about (duplicates are never overridden)
        #[arg(long)]
        ignore_warnings: bool,
    },
    /// List upload jobs
    Jobs {
        /// pending, uploading, uploaded, duplicate, skipped or failed
        #[arg(long)]
        status: Option<String>,
    },
    /// Re-run failed upload jobs
    Retry,
    /// Manage the Commons OAuth authorization
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// Response cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Counts of stored artifacts, jobs and cache entries
    Stats,
}

#[derive(Subcommand)]
pub enum AuthCommand {
    /// Request a token and print the approval URL
    Begin,
    /// Finish authorization with the verifier code shown after approval
    Complete { verifier: String },
    /// Show the authorized account
    Status,
    /// Forget stored tokens
    Logout,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Delete cached responses, optionally only keys starting with a prefix
    Clear {
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Delete expired entries
    Purge,
}

#[derive(Subcommand)]
pub enum DbCommand {
    /// Compact the SQLite file
    Vacuum,
}
