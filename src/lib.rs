//! Rettelse - Transcript Correction Queue
//!
//! Backend for a collaborative tool that corrects and translates machine
//! transcripts of recorded speech.
//!
//! The name "Rettelse" is Norwegian for "correction."
//!
//! # Overview
//!
//! Recordings arrive already split into fixed-duration audio chunks. Rettelse:
//! - Queues one transcription job per chunk and runs them through a single worker
//! - Falls back to a secondary model when the primary one runs out of quota
//! - Streams live queue counts to connected annotators
//! - Arbitrates which annotator may edit a chunk through expiring locks
//!
//! # Architecture
//!
//! - `store` - SQLite persistence of videos, chunks, jobs and segments
//! - `queue` - Job queue with one active job per chunk
//! - `lock` - Time-bounded exclusive chunk locks
//! - `transcription` - Transcription service, model cascade and response parsing
//! - `worker` - The single queue consumer
//! - `notifier` - Push of queue status to subscribers
//! - `app` - Wiring shared by the CLI and the HTTP API
//!
//! # Example
//!
//! ```rust,no_run
//! use rettelse::app::App;
//! use rettelse::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::open(Settings::load()?)?;
//!     let outcome = app.queue().enqueue("lecture-01")?;
//!     println!("Queued {} jobs", outcome.queued);
//!
//!     let worker = app.openai_worker()?;
//!     let summary = worker.drain(|_| {}).await?;
//!     println!("{} done, {} failed", summary.done, summary.failed);
//!
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod notifier;
pub mod openai;
pub mod queue;
pub mod store;
pub mod transcription;
pub mod worker;

pub use error::{Result, RettelseError};
