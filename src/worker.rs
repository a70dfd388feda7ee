//! The transcription worker: the single consumer of the job queue.

use crate::config::{Prompts, Settings, WorkerSettings};
use crate::error::Result;
use crate::queue::{JobOutcome, JobQueue};
use crate::store::{Chunk, Job, JobStatus};
use crate::transcription::{ModelCascade, ResponseParser, TranscriptionRequest, TranscriptionService};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// What happened to one processed job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: Job,
    /// Segments stored for the chunk, zero on failure.
    pub segments: usize,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.job.status == JobStatus::Done
    }
}

/// Totals from a [`Worker::drain`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub done: usize,
    pub failed: usize,
    pub reclaimed: usize,
}

/// Pulls jobs off the queue and runs them through the model cascade.
pub struct Worker {
    queue: Arc<JobQueue>,
    cascade: ModelCascade,
    parser: ResponseParser,
    prompts: Prompts,
    settings: WorkerSettings,
    poll_interval: Duration,
    source_language: Option<String>,
    target_language: String,
}

impl Worker {
    pub fn new(
        queue: Arc<JobQueue>,
        service: Arc<dyn TranscriptionService>,
        settings: &Settings,
        prompts: Prompts,
    ) -> Self {
        Self {
            queue,
            cascade: ModelCascade::new(service, &settings.transcription, &settings.worker),
            parser: ResponseParser::new(),
            prompts,
            settings: settings.worker.clone(),
            poll_interval: Duration::from_millis(settings.queue.poll_interval_ms.max(10)),
            source_language: settings.transcription.source_language.clone(),
            target_language: settings.transcription.target_language.clone(),
        }
    }

    /// Run until `shutdown` flips to true. The in-flight job is always finished.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Worker started (models: {})", self.cascade.models().join(" -> "));
        self.reclaim_stale();
        let mut last_reclaim = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reclaim.elapsed() >= self.settings.health_check_interval() {
                self.reclaim_stale();
                last_reclaim = Instant::now();
            }

            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => debug!("Queue empty, waiting"),
                Err(e) => error!("Worker iteration failed: {}", e),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.queue.wait_for_work(self.poll_interval) => {}
            }
        }

        info!("Worker stopped");
    }

    /// Process jobs until the queue is empty. `on_job` sees every finished job.
    pub async fn drain<F>(&self, mut on_job: F) -> Result<DrainSummary>
    where
        F: FnMut(&JobReport),
    {
        let mut summary = DrainSummary {
            reclaimed: self.reclaim_stale(),
            ..Default::default()
        };

        while let Some(report) = self.process_next().await? {
            if report.succeeded() {
                summary.done += 1;
            } else {
                summary.failed += 1;
            }
            on_job(&report);
        }

        info!(
            "Drained queue: {} done, {} failed, {} reclaimed",
            summary.done, summary.failed, summary.reclaimed
        );
        Ok(summary)
    }

    /// Claim and process the next job, if there is one.
    pub async fn process_next(&self) -> Result<Option<JobReport>> {
        match self.queue.dequeue()? {
            Some(job) => self.process_job(job).await.map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, job), fields(job_id = job.id, chunk_id = job.chunk_id))]
    async fn process_job(&self, job: Job) -> Result<JobReport> {
        let chunk = match self.queue.database().chunk(job.chunk_id)? {
            Some(chunk) => chunk,
            None => return self.fail(job.id, format!("chunk {} not found", job.chunk_id)),
        };

        if let Some(reason) = unusable_audio(&chunk.audio_path) {
            return self.fail(job.id, reason);
        }

        let request = self.build_request(&chunk)?;

        let success = match self.cascade.run(&request).await {
            Ok(success) => success,
            Err(failure) => return self.fail(job.id, failure.reason),
        };

        match self.parser.parse_for_chunk(&success.raw, &chunk) {
            Ok(segments) => {
                let count = segments.len();
                let job = self.queue.complete(
                    job.id,
                    JobOutcome::Succeeded {
                        segments,
                        model: success.model,
                    },
                )?;
                Ok(JobReport { job, segments: count })
            }
            Err(e) => self.fail(job.id, format!("{}: {}", success.model, e)),
        }
    }

    fn fail(&self, job_id: i64, reason: String) -> Result<JobReport> {
        let job = self.queue.complete(job_id, JobOutcome::Failed { reason })?;
        Ok(JobReport { job, segments: 0 })
    }

    fn build_request(&self, chunk: &Chunk) -> Result<TranscriptionRequest> {
        let title = self
            .queue
            .database()
            .video(&chunk.video_id)?
            .map(|v| v.title)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| chunk.video_id.clone());

        let mut vars = HashMap::new();
        vars.insert("target_language".to_string(), self.target_language.clone());
        vars.insert("title".to_string(), title);
        vars.insert("chunk_index".to_string(), chunk.index.to_string());
        vars.insert(
            "chunk_range".to_string(),
            format!(
                "{} - {}",
                format_clock(chunk.start_seconds),
                format_clock(chunk.end_seconds)
            ),
        );

        Ok(TranscriptionRequest {
            audio_path: chunk.audio_path.clone(),
            system_prompt: self
                .prompts
                .render_with_custom(&self.prompts.transcription.system, &vars),
            user_prompt: self
                .prompts
                .render_with_custom(&self.prompts.transcription.user, &vars),
            source_language: self.source_language.clone(),
        })
    }

    fn reclaim_stale(&self) -> usize {
        match self.queue.reclaim_stale(self.settings.stale_after()) {
            Ok(n) => n,
            Err(e) => {
                warn!("Stale job reclamation failed: {}", e);
                0
            }
        }
    }
}

/// Why a chunk's audio reference cannot be used, if it cannot.
fn unusable_audio(audio_path: &str) -> Option<String> {
    if audio_path.trim().is_empty() {
        return Some("chunk has no audio reference".to_string());
    }
    if let Ok(url) = url::Url::parse(audio_path) {
        return match url.scheme() {
            "http" | "https" => None,
            "file" => match url.to_file_path() {
                Ok(path) if path.exists() => None,
                _ => Some(format!("audio not found: {}", audio_path)),
            },
            // Windows drive letters parse as a one-letter scheme.
            scheme if scheme.len() == 1 => local_missing(audio_path),
            scheme => Some(format!("unsupported audio scheme {}: {}", scheme, audio_path)),
        };
    }
    local_missing(audio_path)
}

fn local_missing(audio_path: &str) -> Option<String> {
    if Path::new(audio_path).exists() {
        None
    } else {
        Some(format!("audio not found: {}", audio_path))
    }
}

fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
