//! Chunk store for Rettelse.
//!
//! Persisted records of videos, their audio chunks, transcription jobs and the
//! segments produced for each chunk. State columns are stored as text and mapped
//! onto closed enums here; unknown values are rejected when a row is read.

pub(crate) mod sqlite;

pub use sqlite::Database;

use crate::error::{Result, RettelseError};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Review/processing lifecycle of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    Pending,
    Transcribed,
    Reviewed,
    Exported,
    Rejected,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Transcribed => "transcribed",
            ProcessingState::Reviewed => "reviewed",
            ProcessingState::Exported => "exported",
            ProcessingState::Rejected => "rejected",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// pending -> transcribed -> reviewed -> exported, with `rejected` reachable
    /// from transcribed or reviewed.
    pub fn can_transition_to(&self, next: ProcessingState) -> bool {
        use ProcessingState::*;
        matches!(
            (self, next),
            (Pending, Transcribed)
                | (Transcribed, Reviewed)
                | (Reviewed, Exported)
                | (Transcribed, Rejected)
                | (Reviewed, Rejected)
        )
    }
}

impl FromStr for ProcessingState {
    type Err = RettelseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingState::Pending),
            "transcribed" => Ok(ProcessingState::Transcribed),
            "reviewed" => Ok(ProcessingState::Reviewed),
            "exported" => Ok(ProcessingState::Exported),
            "rejected" => Ok(ProcessingState::Rejected),
            _ => Err(RettelseError::InvalidInput(format!(
                "Unknown processing state: {}",
                s
            ))),
        }
    }
}

/// Background-noise removal flag, independent of the processing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenoiseState {
    None,
    Flagged,
    Processed,
}

impl DenoiseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenoiseState::None => "none",
            DenoiseState::Flagged => "flagged",
            DenoiseState::Processed => "processed",
        }
    }

    pub fn can_transition_to(&self, next: DenoiseState) -> bool {
        matches!(
            (self, next),
            (DenoiseState::None, DenoiseState::Flagged)
                | (DenoiseState::Flagged, DenoiseState::Processed)
        )
    }
}

impl FromStr for DenoiseState {
    type Err = RettelseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(DenoiseState::None),
            "flagged" => Ok(DenoiseState::Flagged),
            "processed" => Ok(DenoiseState::Processed),
            _ => Err(RettelseError::InvalidInput(format!(
                "Unknown denoise state: {}",
                s
            ))),
        }
    }
}

/// Status of a transcription job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for JobStatus {
    type Err = RettelseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "PROCESSING" => Ok(JobStatus::Processing),
            "DONE" => Ok(JobStatus::Done),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(RettelseError::InvalidInput(format!("Unknown job status: {}", s))),
        }
    }
}

macro_rules! text_enum_sql {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: RettelseError| FromSqlError::Other(Box::new(e)))
            }
        }
    )*};
}

text_enum_sql!(ProcessingState, DenoiseState, JobStatus);

/// A source recording that has been split into chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// A fixed-duration slice of a recording; the unit of transcription and review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: i64,
    pub video_id: String,
    /// Ordinal position within the video.
    pub index: u32,
    pub start_seconds: f64,
    pub end_seconds: f64,
    /// Local path or http(s) URL of the chunk audio.
    pub audio_path: String,
    pub processing_state: ProcessingState,
    pub denoise_state: DenoiseState,
    /// Stored lock fields. May describe an expired lock; use [`Chunk::active_lock`].
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_ttl_ms: Option<i64>,
}

impl Chunk {
    pub fn duration_seconds(&self) -> f64 {
        (self.end_seconds - self.start_seconds).max(0.0)
    }

    /// The lock on this chunk, if one is still valid at `now`.
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<LockInfo> {
        let (holder, at, ttl) = match (&self.locked_by, self.locked_at, self.lock_ttl_ms) {
            (Some(holder), Some(at), Some(ttl)) => (holder, at, ttl),
            _ => return None,
        };
        let expires_at = at + chrono::Duration::milliseconds(ttl);
        if now < expires_at {
            Some(LockInfo {
                chunk_id: self.id,
                locked_by: holder.clone(),
                locked_at: at,
                expires_at,
            })
        } else {
            None
        }
    }
}

/// A valid lock held by an annotator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub chunk_id: i64,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One attempt to transcribe one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub chunk_id: i64,
    pub video_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub model_used: Option<String>,
}

/// A single timestamped transcript/translation entry, on the chunk-local clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
    pub translation: String,
}

impl Segment {
    pub fn new(start_seconds: f64, end_seconds: f64, text: String, translation: String) -> Self {
        Self {
            start_seconds,
            end_seconds,
            text,
            translation,
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.done + self.failed
    }

    /// Jobs still waiting for or holding the worker.
    pub fn outstanding(&self) -> u64 {
        self.queued + self.processing
    }
}

/// Counts for one video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    pub video_id: String,
    #[serde(flatten)]
    pub counts: StatusCounts,
}

/// Derived view of the queue: counts by status, globally and per video.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    #[serde(flatten)]
    pub totals: StatusCounts,
    pub per_video: Vec<VideoSummary>,
}

/// A chunk as described by the splitter's manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChunk {
    pub index: u32,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub audio_path: String,
}

/// A split video handed over for transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoManifest {
    pub video_id: String,
    #[serde(default)]
    pub title: String,
    pub chunks: Vec<NewChunk>,
}

impl VideoManifest {
    /// Check the manifest before anything is written.
    pub fn validate(&self) -> Result<()> {
        if self.video_id.trim().is_empty() {
            return Err(RettelseError::InvalidInput("videoId must not be empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for chunk in &self.chunks {
            if !seen.insert(chunk.index) {
                return Err(RettelseError::InvalidInput(format!(
                    "Duplicate chunk index {} in manifest for {}",
                    chunk.index, self.video_id
                )));
            }
            if !(chunk.start_seconds >= 0.0 && chunk.end_seconds > chunk.start_seconds) {
                return Err(RettelseError::InvalidInput(format!(
                    "Chunk {} has an invalid time range {}..{}",
                    chunk.index, chunk.start_seconds, chunk.end_seconds
                )));
            }
            if chunk.audio_path.trim().is_empty() {
                return Err(RettelseError::InvalidInput(format!(
                    "Chunk {} has no audio path",
                    chunk.index
                )));
            }
        }
        Ok(())
    }
}
