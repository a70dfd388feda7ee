//! SQLite persistence for videos, chunks, jobs and segments.
//!
//! One connection guarded by a mutex; every public operation is a single
//! statement or a single transaction, which makes them serializable with
//! respect to each other.

use super::{
    Chunk, DenoiseState, NewChunk, ProcessingState, Segment, Video, VideoManifest,
};
use crate::clock::from_millis;
use crate::error::{Result, RettelseError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS videos (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    video_id TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    start_seconds REAL NOT NULL,
    end_seconds REAL NOT NULL,
    audio_path TEXT NOT NULL,
    processing_state TEXT NOT NULL DEFAULT 'pending'
        CHECK (processing_state IN ('pending', 'transcribed', 'reviewed', 'exported', 'rejected')),
    denoise_state TEXT NOT NULL DEFAULT 'none'
        CHECK (denoise_state IN ('none', 'flagged', 'processed')),
    locked_by TEXT,
    locked_at_ms INTEGER,
    lock_ttl_ms INTEGER,
    updated_at_ms INTEGER NOT NULL,
    UNIQUE (video_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_video_id ON chunks(video_id);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id INTEGER NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
    status TEXT NOT NULL
        CHECK (status IN ('QUEUED', 'PROCESSING', 'DONE', 'FAILED')),
    created_at_ms INTEGER NOT NULL,
    started_at_ms INTEGER,
    finished_at_ms INTEGER,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    model_used TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at_ms, id);
CREATE INDEX IF NOT EXISTS idx_jobs_chunk_id ON jobs(chunk_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active_per_chunk
    ON jobs(chunk_id) WHERE status IN ('QUEUED', 'PROCESSING');

CREATE TABLE IF NOT EXISTS segments (
    chunk_id INTEGER NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    start_seconds REAL NOT NULL,
    end_seconds REAL NOT NULL,
    text TEXT NOT NULL,
    translation TEXT NOT NULL,
    PRIMARY KEY (chunk_id, position)
);
"#;

pub(crate) const CHUNK_COLUMNS: &str = "c.id, c.video_id, c.chunk_index, c.start_seconds, c.end_seconds, \
     c.audio_path, c.processing_state, c.denoise_state, c.locked_by, c.locked_at_ms, c.lock_ttl_ms";

/// SQLite-backed store shared by the queue, the lock manager and the worker.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(&conn)?;

        info!("Initialized database at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Exclusive access to the connection.
    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RettelseError::Store(format!("Failed to acquire lock: {}", e)))
    }

    /// Register a split video and its chunks. Re-importing an existing video
    /// updates its title and adds chunks with new indices only.
    #[instrument(skip(self, manifest), fields(video_id = %manifest.video_id))]
    pub fn import_video(&self, manifest: &VideoManifest, now: DateTime<Utc>) -> Result<Vec<Chunk>> {
        manifest.validate()?;

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now_ms = now.timestamp_millis();

        tx.execute(
            r#"
            INSERT INTO videos (id, title, created_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET title = excluded.title
            "#,
            params![manifest.video_id, manifest.title, now_ms],
        )?;

        let mut inserted = 0;
        for chunk in &manifest.chunks {
            inserted += insert_chunk(&tx, &manifest.video_id, chunk, now_ms)?;
        }

        tx.commit()?;
        drop(conn);

        info!(
            "Imported video {} ({} new chunks, {} in manifest)",
            manifest.video_id,
            inserted,
            manifest.chunks.len()
        );
        self.chunks_for_video(&manifest.video_id)
    }

    /// Get a video by ID.
    pub fn video(&self, video_id: &str) -> Result<Option<Video>> {
        let conn = self.connection()?;
        let video = conn
            .query_row(
                "SELECT id, title, created_at_ms FROM videos WHERE id = ?1",
                params![video_id],
                |row| {
                    Ok(Video {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(video)
    }

    /// List all videos, newest first.
    pub fn list_videos(&self) -> Result<Vec<Video>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT id, title, created_at_ms FROM videos ORDER BY created_at_ms DESC, id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Video {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: from_millis(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a video together with its chunks, jobs and segments.
    #[instrument(skip(self))]
    pub fn delete_video(&self, video_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        let deleted = conn.execute("DELETE FROM videos WHERE id = ?1", params![video_id])?;
        info!("Deleted video {} ({} rows)", video_id, deleted);
        Ok(deleted > 0)
    }

    /// Get a chunk by ID.
    pub fn chunk(&self, chunk_id: i64) -> Result<Option<Chunk>> {
        let conn = self.connection()?;
        let chunk = conn
            .query_row(
                &format!("SELECT {} FROM chunks c WHERE c.id = ?1", CHUNK_COLUMNS),
                params![chunk_id],
                read_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    /// Get a chunk by ID, failing with `NotFound` if it does not exist.
    pub fn require_chunk(&self, chunk_id: i64) -> Result<Chunk> {
        self.chunk(chunk_id)?
            .ok_or_else(|| RettelseError::NotFound(format!("chunk {}", chunk_id)))
    }

    /// All chunks of a video in ordinal order.
    pub fn chunks_for_video(&self, video_id: &str) -> Result<Vec<Chunk>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chunks c WHERE c.video_id = ?1 ORDER BY c.chunk_index",
            CHUNK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![video_id], read_chunk)?;
        let chunks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        debug!("Found {} chunks for video {}", chunks.len(), video_id);
        Ok(chunks)
    }

    /// Segments of a chunk in order.
    pub fn segments(&self, chunk_id: i64) -> Result<Vec<Segment>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT start_seconds, end_seconds, text, translation
            FROM segments
            WHERE chunk_id = ?1
            ORDER BY position
            "#,
        )?;
        let rows = stmt.query_map(params![chunk_id], |row| {
            Ok(Segment {
                start_seconds: row.get(0)?,
                end_seconds: row.get(1)?,
                text: row.get(2)?,
                translation: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Move a chunk along the review lifecycle on behalf of an annotator.
    ///
    /// The annotator must hold a valid lock on the chunk. The worker-driven
    /// pending -> transcribed move is not accepted here.
    #[instrument(skip(self))]
    pub fn review_transition(
        &self,
        chunk_id: i64,
        user_id: &str,
        to: ProcessingState,
        now: DateTime<Utc>,
    ) -> Result<Chunk> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let chunk = tx
            .query_row(
                &format!("SELECT {} FROM chunks c WHERE c.id = ?1", CHUNK_COLUMNS),
                params![chunk_id],
                read_chunk,
            )
            .optional()?
            .ok_or_else(|| RettelseError::NotFound(format!("chunk {}", chunk_id)))?;

        match chunk.active_lock(now) {
            Some(lock) if lock.locked_by == user_id => {}
            Some(lock) => {
                return Err(RettelseError::LockConflict {
                    chunk_id,
                    held_by: lock.locked_by,
                })
            }
            None => {
                return Err(RettelseError::LockNotHeld {
                    chunk_id,
                    user_id: user_id.to_string(),
                })
            }
        }

        let from = chunk.processing_state;
        if from == ProcessingState::Pending || !from.can_transition_to(to) {
            return Err(RettelseError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        tx.execute(
            r#"
            UPDATE chunks SET processing_state = ?2, updated_at_ms = ?3
            WHERE id = ?1 AND processing_state = ?4
            "#,
            params![chunk_id, to, now.timestamp_millis(), from],
        )?;
        let updated = tx.query_row(
            &format!("SELECT {} FROM chunks c WHERE c.id = ?1", CHUNK_COLUMNS),
            params![chunk_id],
            read_chunk,
        )?;
        tx.commit()?;

        info!("Chunk {} moved {} -> {} by {}", chunk_id, from, to, user_id);
        Ok(updated)
    }

    /// Advance the independent denoise flag.
    #[instrument(skip(self))]
    pub fn set_denoise_state(&self, chunk_id: i64, to: DenoiseState, now: DateTime<Utc>) -> Result<()> {
        let conn = self.connection()?;
        let from: DenoiseState = conn
            .query_row(
                "SELECT denoise_state FROM chunks WHERE id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RettelseError::NotFound(format!("chunk {}", chunk_id)))?;

        if !from.can_transition_to(to) {
            return Err(RettelseError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        conn.execute(
            "UPDATE chunks SET denoise_state = ?2, updated_at_ms = ?3 WHERE id = ?1 AND denoise_state = ?4",
            params![chunk_id, to, now.timestamp_millis(), from],
        )?;
        Ok(())
    }
}

fn insert_chunk(tx: &rusqlite::Transaction<'_>, video_id: &str, chunk: &NewChunk, now_ms: i64) -> Result<usize> {
    let inserted = tx.execute(
        r#"
        INSERT INTO chunks (video_id, chunk_index, start_seconds, end_seconds, audio_path, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(video_id, chunk_index) DO NOTHING
        "#,
        params![
            video_id,
            chunk.index,
            chunk.start_seconds,
            chunk.end_seconds,
            chunk.audio_path,
            now_ms,
        ],
    )?;
    Ok(inserted)
}

/// Map a row selected with [`CHUNK_COLUMNS`].
pub(crate) fn read_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let locked_at: Option<i64> = row.get(9)?;
    Ok(Chunk {
        id: row.get(0)?,
        video_id: row.get(1)?,
        index: row.get(2)?,
        start_seconds: row.get(3)?,
        end_seconds: row.get(4)?,
        audio_path: row.get(5)?,
        processing_state: row.get(6)?,
        denoise_state: row.get(7)?,
        locked_by: row.get(8)?,
        locked_at: locked_at.map(from_millis),
        lock_ttl_ms: row.get(10)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::store::NewChunk;

    /// Import a video with `count` 30-second chunks.
    pub fn seed_video(db: &Database, video_id: &str, count: u32, now: DateTime<Utc>) -> Vec<Chunk> {
        let manifest = VideoManifest {
            video_id: video_id.to_string(),
            title: format!("Recording {}", video_id),
            chunks: (0..count)
                .map(|i| NewChunk {
                    index: i,
                    start_seconds: i as f64 * 30.0,
                    end_seconds: (i + 1) as f64 * 30.0,
                    audio_path: format!("/audio/{}/{:03}.wav", video_id, i),
                })
                .collect(),
        };
        db.import_video(&manifest, now).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::seed_video;
    use super::*;

    fn now() -> DateTime<Utc> {
        from_millis(1_700_000_000_000)
    }

    #[test]
    fn test_import_and_read_chunks() {
        let db = Database::in_memory().unwrap();
        let chunks = seed_video(&db, "v1", 3, now());

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].index, 1);
        assert_eq!(chunks[1].start_seconds, 30.0);
        assert_eq!(chunks[0].processing_state, ProcessingState::Pending);
        assert_eq!(chunks[0].denoise_state, DenoiseState::None);

        // Re-import is idempotent for existing indices.
        let again = seed_video(&db, "v1", 4, now());
        assert_eq!(again.len(), 4);
        assert_eq!(again[0].id, chunks[0].id);

        let video = db.video("v1").unwrap().unwrap();
        assert_eq!(video.title, "Recording v1");
    }

    #[test]
    fn test_unknown_state_rejected_on_read() {
        let db = Database::in_memory().unwrap();
        let chunks = seed_video(&db, "v1", 1, now());

        {
            let conn = db.connection().unwrap();
            conn.execute_batch("PRAGMA ignore_check_constraints = ON;").unwrap();
            conn.execute(
                "UPDATE chunks SET processing_state = 'archived' WHERE id = ?1",
                params![chunks[0].id],
            )
            .unwrap();
        }

        assert!(db.chunk(chunks[0].id).is_err());
    }

    #[test]
    fn test_delete_video_cascades() {
        let db = Database::in_memory().unwrap();
        let chunks = seed_video(&db, "v1", 2, now());

        assert!(db.delete_video("v1").unwrap());
        assert!(db.chunk(chunks[0].id).unwrap().is_none());
        assert!(!db.delete_video("v1").unwrap());
    }

    #[test]
    fn test_denoise_transitions() {
        let db = Database::in_memory().unwrap();
        let chunk = seed_video(&db, "v1", 1, now()).remove(0);

        assert!(db.set_denoise_state(chunk.id, DenoiseState::Processed, now()).is_err());
        db.set_denoise_state(chunk.id, DenoiseState::Flagged, now()).unwrap();
        db.set_denoise_state(chunk.id, DenoiseState::Processed, now()).unwrap();
        assert_eq!(
            db.require_chunk(chunk.id).unwrap().denoise_state,
            DenoiseState::Processed
        );
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rettelse.db");

        {
            let db = Database::new(&path).unwrap();
            seed_video(&db, "v1", 2, now());
        }

        let db = Database::new(&path).unwrap();
        assert_eq!(db.chunks_for_video("v1").unwrap().len(), 2);
    }
}
