//! Wiring of the shared services.
//!
//! One `App` owns the database, the clock and the queue/lock/notifier services
//! that the HTTP handlers, the CLI commands and the worker share.

use crate::clock::{Clock, SystemClock};
use crate::config::{Prompts, Settings};
use crate::error::Result;
use crate::lock::LockManager;
use crate::notifier::StatusNotifier;
use crate::queue::JobQueue;
use crate::store::{Chunk, Database, DenoiseState, ProcessingState, VideoManifest};
use crate::transcription::{OpenAiService, TranscriptionService};
use crate::worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub struct App {
    settings: Settings,
    prompts: Prompts,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    queue: Arc<JobQueue>,
    locks: Arc<LockManager>,
    notifier: Arc<StatusNotifier>,
}

impl App {
    /// Open the configured database with the system clock.
    pub fn open(settings: Settings) -> Result<Self> {
        let db = Arc::new(Database::new(&settings.sqlite_path())?);
        Self::with_database(settings, db, Arc::new(SystemClock))
    }

    /// Build the services over an existing database and clock.
    pub fn with_database(settings: Settings, db: Arc<Database>, clock: Arc<dyn Clock>) -> Result<Self> {
        let prompts = Prompts::load(
            settings.prompts.custom_dir.as_deref(),
            Some(&settings.prompts.variables),
        )?;

        let notifier = Arc::new(StatusNotifier::new(settings.notifier.clone()));
        let queue = Arc::new(JobQueue::new(
            db.clone(),
            clock.clone(),
            notifier.signal(),
            Duration::from_millis(settings.queue.summary_cache_ms),
        ));
        let locks = Arc::new(LockManager::new(db.clone(), clock.clone(), settings.lock.clone()));

        Ok(Self {
            settings,
            prompts,
            db,
            clock,
            queue,
            locks,
            notifier,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn notifier(&self) -> &Arc<StatusNotifier> {
        &self.notifier
    }

    /// A worker over the given service.
    pub fn worker(&self, service: Arc<dyn TranscriptionService>) -> Worker {
        Worker::new(self.queue.clone(), service, &self.settings, self.prompts.clone())
    }

    /// A worker backed by the OpenAI service.
    pub fn openai_worker(&self) -> Result<Worker> {
        let service = OpenAiService::new(&self.settings.transcription, self.settings.worker.call_timeout())?;
        Ok(self.worker(Arc::new(service)))
    }

    /// Register a video handed over by the splitter.
    #[instrument(skip(self, manifest), fields(video_id = %manifest.video_id))]
    pub fn import(&self, manifest: &VideoManifest) -> Result<Vec<Chunk>> {
        let chunks = self.db.import_video(manifest, self.clock.now())?;
        info!("Video {} has {} chunks", manifest.video_id, chunks.len());
        Ok(chunks)
    }

    /// Remove a video with its chunks, jobs and segments.
    pub fn delete_video(&self, video_id: &str) -> Result<bool> {
        let deleted = self.db.delete_video(video_id)?;
        if deleted {
            self.queue.signal_change();
        }
        Ok(deleted)
    }

    /// Advance the denoise flag of a chunk.
    pub fn set_denoise(&self, chunk_id: i64, to: DenoiseState) -> Result<Chunk> {
        self.db.set_denoise_state(chunk_id, to, self.clock.now())?;
        self.queue.signal_change();
        self.db.require_chunk(chunk_id)
    }

    /// Move a chunk through review on behalf of a lock holder.
    pub fn review(&self, chunk_id: i64, user_id: &str, to: ProcessingState) -> Result<Chunk> {
        let chunk = self.db.review_transition(chunk_id, user_id, to, self.clock.now())?;
        self.queue.signal_change();
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_millis, ManualClock};
    use crate::notifier::{QueueEvent, Subscription};
    use crate::queue::JobOutcome;
    use crate::store::{NewChunk, Segment};
    use tokio::sync::watch;

    /// Swallow whatever is already in flight for the subscriber.
    async fn settle(sub: &mut Subscription) {
        while tokio::time::timeout(Duration::from_millis(100), sub.recv()).await.is_ok() {}
    }

    async fn expect_update(sub: &mut Subscription) {
        match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
            Ok(Some(QueueEvent::QueueUpdate(_))) => {}
            other => panic!("expected a queue update, got {:?}", other),
        }
    }

    #[test]
    fn test_import_enqueue_and_review_flow() {
        let clock = Arc::new(ManualClock::new(from_millis(1_700_000_000_000)));
        let app = App::with_database(
            Settings::default(),
            Arc::new(Database::in_memory().unwrap()),
            clock,
        )
        .unwrap();

        let chunks = app
            .import(&VideoManifest {
                video_id: "V".to_string(),
                title: "Opptak".to_string(),
                chunks: vec![NewChunk {
                    index: 0,
                    start_seconds: 0.0,
                    end_seconds: 30.0,
                    audio_path: "https://media.example.org/V/000.wav".to_string(),
                }],
            })
            .unwrap();
        assert_eq!(app.queue().enqueue("V").unwrap().queued, 1);

        let chunk = chunks[0].id;
        app.locks().acquire(chunk, "alice", None).unwrap();
        // Still pending: only the worker may move it on.
        assert!(app.review(chunk, "alice", ProcessingState::Transcribed).is_err());
    }

    #[test]
    fn test_denoise_and_delete() {
        let app = App::with_database(
            Settings::default(),
            Arc::new(Database::in_memory().unwrap()),
            Arc::new(SystemClock),
        )
        .unwrap();
        let chunks = app
            .import(&VideoManifest {
                video_id: "V".to_string(),
                title: String::new(),
                chunks: vec![NewChunk {
                    index: 0,
                    start_seconds: 0.0,
                    end_seconds: 30.0,
                    audio_path: "https://media.example.org/V/000.wav".to_string(),
                }],
            })
            .unwrap();
        app.queue().enqueue("V").unwrap();

        let chunk = app.set_denoise(chunks[0].id, DenoiseState::Flagged).unwrap();
        assert_eq!(chunk.denoise_state, DenoiseState::Flagged);
        assert!(app.set_denoise(chunk.id, DenoiseState::None).is_err());

        assert!(app.delete_video("V").unwrap());
        assert_eq!(app.queue().summary(None).unwrap().totals.total(), 0);
        assert!(app.database().chunk(chunk.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunk_transitions_push_queue_updates() {
        let app = App::with_database(
            Settings::default(),
            Arc::new(Database::in_memory().unwrap()),
            Arc::new(ManualClock::new(from_millis(1_700_000_000_000))),
        )
        .unwrap();
        let chunks = app
            .import(&VideoManifest {
                video_id: "V".to_string(),
                title: String::new(),
                chunks: vec![NewChunk {
                    index: 0,
                    start_seconds: 0.0,
                    end_seconds: 30.0,
                    audio_path: "https://media.example.org/V/000.wav".to_string(),
                }],
            })
            .unwrap();
        let chunk = chunks[0].id;
        app.queue().enqueue("V").unwrap();
        let job = app.queue().dequeue().unwrap().unwrap();
        app.queue()
            .complete(
                job.id,
                JobOutcome::Succeeded {
                    segments: vec![Segment::new(0.0, 2.5, "God kveld.".to_string(), "Good evening.".to_string())],
                    model: "gpt-4.1".to_string(),
                },
            )
            .unwrap();
        app.locks().acquire(chunk, "alice", None).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(app.notifier().clone().run(app.queue().clone(), stop_rx));
        let mut sub = app.notifier().subscribe(|| app.queue().summary(None)).unwrap();
        settle(&mut sub).await;

        app.review(chunk, "alice", ProcessingState::Reviewed).unwrap();
        expect_update(&mut sub).await;

        app.set_denoise(chunk, DenoiseState::Flagged).unwrap();
        expect_update(&mut sub).await;

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
