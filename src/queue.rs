//! Durable transcription job queue.
//!
//! Jobs live in the `jobs` table. Every operation runs as one immediate SQLite
//! transaction, so concurrent enqueue/dequeue/complete/retry calls from HTTP
//! handlers, the CLI and the worker are serialized. At most one job per chunk is
//! ever QUEUED or PROCESSING; a partial unique index backs that up.

use crate::clock::{from_millis, Clock};
use crate::error::{Result, RettelseError};
use crate::notifier::ChangeSignal;
use crate::store::{Database, Job, JobStatus, QueueSummary, Segment, StatusCounts, VideoSummary};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

const JOB_SELECT: &str = r#"
    SELECT j.id, j.chunk_id, c.video_id, j.status, j.created_at_ms, j.started_at_ms,
           j.finished_at_ms, j.attempt_count, j.last_error, j.model_used
    FROM jobs j
    JOIN chunks c ON c.id = j.chunk_id
"#;

/// Result of an enqueue request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    /// Jobs created.
    pub queued: usize,
    /// Pending chunks skipped because a job for them is already queued or running.
    pub skipped_duplicate: usize,
}

impl std::ops::AddAssign for EnqueueOutcome {
    fn add_assign(&mut self, other: Self) {
        self.queued += other.queued;
        self.skipped_duplicate += other.skipped_duplicate;
    }
}

/// How a PROCESSING job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Transcription succeeded; segments are on the chunk-local clock.
    Succeeded { segments: Vec<Segment>, model: String },
    /// Transcription failed for this attempt.
    Failed { reason: String },
}

/// The job queue service.
pub struct JobQueue {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    signal: ChangeSignal,
    work_available: Notify,
    summary_ttl: Duration,
    summary_cache: Mutex<Option<(Instant, QueueSummary)>>,
    /// Bumped on every change; a summary computed under an older value is not cached.
    generation: AtomicU64,
}

impl JobQueue {
    pub fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        signal: ChangeSignal,
        summary_ttl: Duration,
    ) -> Self {
        Self {
            db,
            clock,
            signal,
            work_available: Notify::new(),
            summary_ttl,
            summary_cache: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Queue a job for every pending chunk of `video_id` that has no active job.
    pub fn enqueue(&self, video_id: &str) -> Result<EnqueueOutcome> {
        self.enqueue_many(&[video_id.to_string()])
    }

    /// Enqueue several videos in one transaction. Unknown videos fail the whole request.
    #[instrument(skip(self))]
    pub fn enqueue_many(&self, video_ids: &[String]) -> Result<EnqueueOutcome> {
        let now_ms = self.clock.now().timestamp_millis();
        let mut outcome = EnqueueOutcome::default();

        {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            for video_id in video_ids {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM videos WHERE id = ?1)",
                    params![video_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(RettelseError::NotFound(format!("video {}", video_id)));
                }

                let pending: usize = tx.query_row(
                    "SELECT COUNT(*) FROM chunks WHERE video_id = ?1 AND processing_state = 'pending'",
                    params![video_id],
                    |row| row.get(0),
                )?;

                let queued = tx.execute(
                    r#"
                    INSERT INTO jobs (chunk_id, status, created_at_ms, attempt_count)
                    SELECT c.id, 'QUEUED', ?2, 0
                    FROM chunks c
                    WHERE c.video_id = ?1
                      AND c.processing_state = 'pending'
                      AND NOT EXISTS (
                          SELECT 1 FROM jobs a
                          WHERE a.chunk_id = c.id AND a.status IN ('QUEUED', 'PROCESSING')
                      )
                    ORDER BY c.chunk_index
                    "#,
                    params![video_id, now_ms],
                )?;

                let video_outcome = EnqueueOutcome {
                    queued,
                    skipped_duplicate: pending.saturating_sub(queued),
                };
                debug!(
                    "Video {}: {} queued, {} already active",
                    video_id, video_outcome.queued, video_outcome.skipped_duplicate
                );
                outcome += video_outcome;
            }

            tx.commit()?;
        }

        info!(
            "Enqueued {} jobs ({} duplicates skipped)",
            outcome.queued, outcome.skipped_duplicate
        );

        if outcome.queued > 0 {
            self.changed();
            self.work_available.notify_one();
        }
        Ok(outcome)
    }

    /// Claim the oldest QUEUED job (by creation time, then id) and mark it PROCESSING.
    #[instrument(skip(self))]
    pub fn dequeue(&self) -> Result<Option<Job>> {
        let now_ms = self.clock.now().timestamp_millis();

        let job = {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let claimed: Option<i64> = tx
                .query_row(
                    r#"
                    UPDATE jobs
                    SET status = 'PROCESSING', started_at_ms = ?1
                    WHERE id = (
                        SELECT id FROM jobs
                        WHERE status = 'QUEUED'
                        ORDER BY created_at_ms, id
                        LIMIT 1
                    ) AND status = 'QUEUED'
                    RETURNING id
                    "#,
                    params![now_ms],
                    |row| row.get(0),
                )
                .optional()?;

            let job = match claimed {
                Some(id) => Some(tx.query_row(
                    &format!("{} WHERE j.id = ?1", JOB_SELECT),
                    params![id],
                    read_job,
                )?),
                None => None,
            };
            tx.commit()?;
            job
        };

        if let Some(ref job) = job {
            info!("Dequeued job {} (chunk {}, video {})", job.id, job.chunk_id, job.video_id);
            self.changed();
        }
        Ok(job)
    }

    /// Record the outcome of a PROCESSING job.
    ///
    /// Success replaces the chunk's segments, moves a pending chunk to
    /// `transcribed` and marks the job DONE. Failure bumps `attempt_count`,
    /// stores the reason and marks the job FAILED; nothing is requeued.
    #[instrument(skip(self, outcome))]
    pub fn complete(&self, job_id: i64, outcome: JobOutcome) -> Result<Job> {
        let now_ms = self.clock.now().timestamp_millis();

        let job = {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<(i64, JobStatus)> = tx
                .query_row(
                    "SELECT chunk_id, status FROM jobs WHERE id = ?1",
                    params![job_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (chunk_id, status) =
                current.ok_or_else(|| RettelseError::NotFound(format!("job {}", job_id)))?;

            if status != JobStatus::Processing {
                return Err(RettelseError::InvalidState(format!(
                    "job {} is {}, expected PROCESSING",
                    job_id, status
                )));
            }

            match &outcome {
                JobOutcome::Succeeded { segments, model } => {
                    tx.execute("DELETE FROM segments WHERE chunk_id = ?1", params![chunk_id])?;
                    {
                        let mut insert = tx.prepare(
                            r#"
                            INSERT INTO segments (chunk_id, position, start_seconds, end_seconds, text, translation)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                            "#,
                        )?;
                        for (position, segment) in segments.iter().enumerate() {
                            insert.execute(params![
                                chunk_id,
                                position as i64,
                                segment.start_seconds,
                                segment.end_seconds,
                                segment.text,
                                segment.translation,
                            ])?;
                        }
                    }
                    tx.execute(
                        r#"
                        UPDATE chunks SET processing_state = 'transcribed', updated_at_ms = ?2
                        WHERE id = ?1 AND processing_state = 'pending'
                        "#,
                        params![chunk_id, now_ms],
                    )?;
                    tx.execute(
                        r#"
                        UPDATE jobs SET status = 'DONE', finished_at_ms = ?2, model_used = ?3, last_error = NULL
                        WHERE id = ?1 AND status = 'PROCESSING'
                        "#,
                        params![job_id, now_ms, model],
                    )?;
                }
                JobOutcome::Failed { reason } => {
                    tx.execute(
                        r#"
                        UPDATE jobs
                        SET status = 'FAILED', finished_at_ms = ?2, last_error = ?3,
                            attempt_count = attempt_count + 1
                        WHERE id = ?1 AND status = 'PROCESSING'
                        "#,
                        params![job_id, now_ms, reason],
                    )?;
                }
            }

            let job = tx.query_row(&format!("{} WHERE j.id = ?1", JOB_SELECT), params![job_id], read_job)?;
            tx.commit()?;
            job
        };

        match &outcome {
            JobOutcome::Succeeded { segments, model } => info!(
                "Job {} done: {} segments via {}",
                job.id,
                segments.len(),
                model
            ),
            JobOutcome::Failed { reason } => warn!(
                "Job {} failed (attempt {}): {}",
                job.id, job.attempt_count, reason
            ),
        }

        self.changed();
        Ok(job)
    }

    /// Move FAILED jobs of a video back to QUEUED, keeping their attempt counts.
    ///
    /// Per chunk only the newest FAILED job is requeued, and only while the chunk
    /// is still pending and has no other active job.
    #[instrument(skip(self))]
    pub fn retry_failed(&self, video_id: &str) -> Result<usize> {
        let retried = {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let retried = tx.execute(
                r#"
                UPDATE jobs
                SET status = 'QUEUED', started_at_ms = NULL, finished_at_ms = NULL
                WHERE id IN (
                    SELECT MAX(j.id)
                    FROM jobs j
                    JOIN chunks c ON c.id = j.chunk_id
                    WHERE c.video_id = ?1
                      AND c.processing_state = 'pending'
                      AND j.status = 'FAILED'
                      AND NOT EXISTS (
                          SELECT 1 FROM jobs a
                          WHERE a.chunk_id = j.chunk_id AND a.status IN ('QUEUED', 'PROCESSING')
                      )
                    GROUP BY j.chunk_id
                )
                "#,
                params![video_id],
            )?;
            tx.commit()?;
            retried
        };

        info!("Requeued {} failed jobs for video {}", retried, video_id);
        if retried > 0 {
            self.changed();
            self.work_available.notify_one();
        }
        Ok(retried)
    }

    /// Fail every job that has been PROCESSING for longer than `window`.
    ///
    /// This is how a crashed worker's claim is released: the job becomes FAILED
    /// and is eligible for an explicit retry.
    #[instrument(skip(self))]
    pub fn reclaim_stale(&self, window: Duration) -> Result<usize> {
        let now = self.clock.now();
        let cutoff_ms = now.timestamp_millis() - window.as_millis() as i64;
        let reason = format!("worker stale: no completion within {}s", window.as_secs());

        let reclaimed = {
            let conn = self.db.connection()?;
            conn.execute(
                r#"
                UPDATE jobs
                SET status = 'FAILED', finished_at_ms = ?1, last_error = ?2,
                    attempt_count = attempt_count + 1
                WHERE status = 'PROCESSING' AND started_at_ms <= ?3
                "#,
                params![now.timestamp_millis(), reason, cutoff_ms],
            )?
        };

        if reclaimed > 0 {
            warn!("Reclaimed {} stale PROCESSING jobs", reclaimed);
            self.changed();
        }
        Ok(reclaimed)
    }

    /// Counts per status, globally and per video. `video_id` narrows both to one video.
    pub fn summary(&self, video_id: Option<&str>) -> Result<QueueSummary> {
        let full = self.full_summary()?;

        Ok(match video_id {
            None => full,
            Some(id) => {
                let per_video: Vec<VideoSummary> =
                    full.per_video.into_iter().filter(|v| v.video_id == id).collect();
                let totals = per_video.first().map(|v| v.counts).unwrap_or_default();
                QueueSummary { totals, per_video }
            }
        })
    }

    fn full_summary(&self) -> Result<QueueSummary> {
        {
            let cache = self.summary_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, summary)) = cache.as_ref() {
                if at.elapsed() < self.summary_ttl {
                    return Ok(summary.clone());
                }
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let summary = {
            let conn = self.db.connection()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT c.video_id, j.status, COUNT(*)
                FROM jobs j
                JOIN chunks c ON c.id = j.chunk_id
                GROUP BY c.video_id, j.status
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, JobStatus>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut totals = StatusCounts::default();
            let mut by_video: BTreeMap<String, StatusCounts> = BTreeMap::new();
            for row in rows {
                let (video_id, status, count) = row?;
                totals.add(status, count as u64);
                by_video.entry(video_id).or_default().add(status, count as u64);
            }

            QueueSummary {
                totals,
                per_video: by_video
                    .into_iter()
                    .map(|(video_id, counts)| VideoSummary { video_id, counts })
                    .collect(),
            }
        };

        let mut cache = self.summary_cache.lock().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::SeqCst) == generation {
            *cache = Some((Instant::now(), summary.clone()));
        }
        Ok(summary)
    }

    /// Get a job by ID.
    pub fn job(&self, job_id: i64) -> Result<Option<Job>> {
        let conn = self.db.connection()?;
        let job = conn
            .query_row(&format!("{} WHERE j.id = ?1", JOB_SELECT), params![job_id], read_job)
            .optional()?;
        Ok(job)
    }

    /// Job history of a video, oldest first.
    pub fn jobs_for_video(&self, video_id: &str) -> Result<Vec<Job>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE c.video_id = ?1 ORDER BY j.created_at_ms, j.id",
            JOB_SELECT
        ))?;
        let rows = stmt.query_map(params![video_id], read_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Wait until new work may be available, or `max_wait` passes.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.work_available.notified()).await;
    }

    /// Report a change made outside the queue, such as a deleted video.
    pub fn signal_change(&self) {
        self.changed();
    }

    fn changed(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut cache = self.summary_cache.lock().unwrap_or_else(|e| e.into_inner());
            *cache = None;
        }
        self.signal.notify();
    }
}

fn read_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let started: Option<i64> = row.get(5)?;
    let finished: Option<i64> = row.get(6)?;
    Ok(Job {
        id: row.get(0)?,
        chunk_id: row.get(1)?,
        video_id: row.get(2)?,
        status: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        started_at: started.map(from_millis),
        finished_at: finished.map(from_millis),
        attempt_count: row.get(7)?,
        last_error: row.get(8)?,
        model_used: row.get(9)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;

    pub fn start() -> chrono::DateTime<chrono::Utc> {
        from_millis(1_700_000_000_000)
    }

    /// Queue over an in-memory database with a manual clock and no summary cache.
    pub fn queue() -> (Arc<JobQueue>, Arc<ManualClock>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(start()));
        let queue = Arc::new(JobQueue::new(
            db,
            clock.clone(),
            ChangeSignal::new(),
            Duration::ZERO,
        ));
        (queue, clock)
    }

    /// Number of QUEUED/PROCESSING jobs per chunk.
    pub fn active_per_chunk(queue: &JobQueue) -> Vec<(i64, i64)> {
        let conn = queue.database().connection().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT c.id, (SELECT COUNT(*) FROM jobs j
                              WHERE j.chunk_id = c.id AND j.status IN ('QUEUED', 'PROCESSING'))
                FROM chunks c
                "#,
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    }
}
