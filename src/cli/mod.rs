//! CLI module for Rettelse.

pub mod commands;
mod output;
pub mod preflight;

pub use output::Output;

use clap::{Parser, Subcommand};

/// Rettelse - Transcript correction queue
///
/// Queues audio chunks for AI transcription and translation, runs the worker,
/// and coordinates annotators reviewing the results through chunk locks.
/// The name "Rettelse" is Norwegian for "correction."
#[derive(Parser, Debug)]
#[command(name = "rettelse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check configuration, database and API key
    Doctor,

    /// Start the HTTP API together with the worker and the status stream
    Serve {
        /// Host to bind to (defaults to server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (defaults to server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Serve the API without running the transcription worker
        #[arg(long)]
        no_worker: bool,
    },

    /// Register a split video from a manifest JSON file
    Import {
        /// Path to the manifest ({videoId, title, chunks: [...]})
        manifest: String,

        /// Queue the pending chunks right away
        #[arg(long)]
        enqueue: bool,
    },

    /// Queue transcription jobs for the pending chunks of videos
    Enqueue {
        /// Video IDs
        #[arg(required = true)]
        video_ids: Vec<String>,
    },

    /// Show queue counts
    Status {
        /// Only show this video
        #[arg(long)]
        video: Option<String>,
    },

    /// Requeue failed jobs of a video
    Retry {
        /// Video ID
        video_id: String,
    },

    /// Process queued jobs in the foreground until the queue is empty
    Process,

    /// Fail jobs stuck in PROCESSING longer than worker.stale_after_secs
    Reclaim,

    /// Show the job history of a video
    Jobs {
        /// Video ID
        video_id: String,
    },

    /// Show a chunk with its lock and segments
    Chunk {
        /// Chunk ID
        chunk_id: i64,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Acquire, renew or release chunk locks
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Move a locked chunk through review (reviewed, exported, rejected)
    Review {
        /// Chunk ID
        chunk_id: i64,

        /// Annotator holding the lock
        #[arg(short, long)]
        user: String,

        /// Target state
        state: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum LockAction {
    /// Take the lock on a chunk
    Acquire {
        chunk_id: i64,
        #[arg(short, long)]
        user: String,
        /// Lock duration in seconds (clamped to lock.min_ttl_secs..lock.max_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Restart the TTL of a held lock
    Renew {
        chunk_id: i64,
        #[arg(short, long)]
        user: String,
    },

    /// Give a lock back
    Release {
        chunk_id: i64,
        #[arg(short, long)]
        user: String,
    },

    /// Show who holds a chunk
    Status { chunk_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Open configuration file in editor
    Edit,

    /// Show configuration file path
    Path,
}
