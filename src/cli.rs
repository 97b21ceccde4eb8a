use clap::{Parser, Subcommand};
use rk_core::{ItemId, JobId, JobKind, LibraryId, MatchStatus, SortKey};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reelkeep")]
#[command(author, version, about = "Local media library organizer")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool until interrupted, resuming unfinished jobs
    Run {
        /// Exit once the job queue is empty instead of waiting for Ctrl-C
        #[arg(long)]
        until_idle: bool,

        /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9184)
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },

    /// Manage libraries
    Library {
        #[command(subcommand)]
        command: LibraryCommands,
    },

    /// Scan a library for new media files and wait for the result
    Scan {
        /// Library id
        library: LibraryId,
    },

    /// List a window of a library's items
    Ls {
        /// Library id
        library: LibraryId,

        /// First row to show
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Number of rows to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Sort order: title, year or added
        #[arg(long, default_value = "title")]
        sort: SortKey,

        /// Only items with this match status (matched, unmatched)
        #[arg(long)]
        status: Option<MatchStatus>,

        /// Only items whose title contains this text
        #[arg(long)]
        title: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Count a library's items
    Count {
        /// Library id
        library: LibraryId,

        /// Only items with this match status (matched, unmatched)
        #[arg(long)]
        status: Option<MatchStatus>,
    },

    /// Show one item with its credits, artwork, subtitles and history
    Show {
        /// Item id
        item: ItemId,
    },

    /// Delete an item, its child rows and its stored assets
    Remove {
        /// Item id
        item: ItemId,
    },

    /// Inspect jobs
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show job counts and metrics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate,

    /// Display version information
    Version,
}

#[derive(Subcommand)]
pub enum LibraryCommands {
    /// Register a library root
    Add {
        /// Display name
        name: String,

        /// Root directory to scan
        path: PathBuf,
    },

    /// List libraries
    List,
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Queue a job and wait for it to finish
    Submit {
        /// Job kind: scan, match, artwork_fetch or subtitle_fetch
        kind: JobKind,

        /// Library id for scan jobs, item id otherwise
        target: i64,

        /// Provider to query instead of the primary one
        #[arg(long)]
        provider: Option<String>,

        /// Ignore cached provider answers
        #[arg(long)]
        refresh: bool,

        /// Subtitle language
        #[arg(long)]
        language: Option<String>,

        /// Return once queued instead of running the job
        #[arg(long)]
        detach: bool,
    },

    /// Cancel a queued job
    Cancel {
        /// Job id
        id: JobId,
    },

    /// Show one job
    Status {
        /// Job id
        id: JobId,
    },

    /// Drop finished jobs older than the retention period
    Gc,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Purge expired entries
    Sweep,
}
