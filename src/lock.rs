//! Time-bounded exclusive chunk locks for annotators.
//!
//! Lock fields live on the chunk row. Acquisition is a single compare-and-set
//! `UPDATE`, so two annotators racing for the same chunk cannot both win.
//! Expired locks are reclaimed lazily by the next acquire.

use crate::clock::Clock;
use crate::config::LockSettings;
use crate::error::{Result, RettelseError};
use crate::store::sqlite::{read_chunk, CHUNK_COLUMNS};
use crate::store::{Chunk, Database, LockInfo};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// A successfully acquired or renewed lock.
pub type LockGrant = LockInfo;

/// Arbitrates chunk locks between annotators.
pub struct LockManager {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, settings: LockSettings) -> Self {
        Self { db, clock, settings }
    }

    /// Take the lock on a chunk, or refresh it when `user_id` already holds it.
    ///
    /// `ttl` is clamped into the configured bounds; `None` uses the default TTL.
    #[instrument(skip(self))]
    pub fn acquire(&self, chunk_id: i64, user_id: &str, ttl: Option<Duration>) -> Result<LockGrant> {
        if user_id.trim().is_empty() {
            return Err(RettelseError::InvalidInput("userId must not be empty".to_string()));
        }

        let ttl = self.settings.clamp_ttl(ttl);
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let ttl_ms = ttl.as_millis() as i64;

        let conn = self.db.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE chunks
            SET locked_by = ?2, locked_at_ms = ?3, lock_ttl_ms = ?4
            WHERE id = ?1
              AND (locked_by IS NULL
                   OR locked_by = ?2
                   OR locked_at_ms IS NULL
                   OR lock_ttl_ms IS NULL
                   OR locked_at_ms + lock_ttl_ms <= ?3)
            "#,
            params![chunk_id, user_id, now_ms, ttl_ms],
        )?;

        if changed == 0 {
            let chunk = load_chunk(&conn, chunk_id)?;
            let held_by = chunk
                .active_lock(now)
                .map(|lock| lock.locked_by)
                .or(chunk.locked_by)
                .unwrap_or_default();
            debug!("Lock on chunk {} denied to {}: held by {}", chunk_id, user_id, held_by);
            return Err(RettelseError::LockConflict { chunk_id, held_by });
        }

        info!("Chunk {} locked by {} for {}s", chunk_id, user_id, ttl.as_secs());
        Ok(LockGrant {
            chunk_id,
            locked_by: user_id.to_string(),
            locked_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms),
        })
    }

    /// Extend a valid lock held by `user_id` by restarting its TTL window.
    #[instrument(skip(self))]
    pub fn renew(&self, chunk_id: i64, user_id: &str) -> Result<LockGrant> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        let conn = self.db.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE chunks
            SET locked_at_ms = ?3
            WHERE id = ?1 AND locked_by = ?2 AND locked_at_ms + lock_ttl_ms > ?3
            "#,
            params![chunk_id, user_id, now_ms],
        )?;

        let chunk = load_chunk(&conn, chunk_id)?;
        if changed == 0 {
            debug!("Renew of chunk {} by {} refused", chunk_id, user_id);
            return Err(RettelseError::LockNotHeld {
                chunk_id,
                user_id: user_id.to_string(),
            });
        }

        chunk.active_lock(now).ok_or_else(|| RettelseError::LockNotHeld {
            chunk_id,
            user_id: user_id.to_string(),
        })
    }

    /// Drop the lock held by `user_id`.
    ///
    /// Returns whether a lock was actually cleared. An unlocked chunk or an
    /// expired lock is a no-op; another annotator's valid lock is a conflict.
    #[instrument(skip(self))]
    pub fn release(&self, chunk_id: i64, user_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.db.connection()?;
        let chunk = load_chunk(&conn, chunk_id)?;

        match chunk.active_lock(now) {
            None => {
                debug!("Release of chunk {} by {}: not locked", chunk_id, user_id);
                Ok(false)
            }
            Some(lock) if lock.locked_by == user_id => {
                conn.execute(
                    r#"
                    UPDATE chunks SET locked_by = NULL, locked_at_ms = NULL, lock_ttl_ms = NULL
                    WHERE id = ?1 AND locked_by = ?2
                    "#,
                    params![chunk_id, user_id],
                )?;
                info!("Chunk {} released by {}", chunk_id, user_id);
                Ok(true)
            }
            Some(lock) => {
                debug!(
                    "Release of chunk {} by {} refused: held by {}",
                    chunk_id, user_id, lock.locked_by
                );
                Err(RettelseError::LockConflict {
                    chunk_id,
                    held_by: lock.locked_by,
                })
            }
        }
    }

    /// The valid lock on a chunk, if any.
    pub fn status(&self, chunk_id: i64) -> Result<Option<LockInfo>> {
        let chunk = self.db.require_chunk(chunk_id)?;
        Ok(chunk.active_lock(self.clock.now()))
    }
}

fn load_chunk(conn: &Connection, chunk_id: i64) -> Result<Chunk> {
    conn.query_row(
        &format!("SELECT {} FROM chunks c WHERE c.id = ?1", CHUNK_COLUMNS),
        params![chunk_id],
        read_chunk,
    )
    .optional()?
    .ok_or_else(|| RettelseError::NotFound(format!("chunk {}", chunk_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_millis, ManualClock};
    use crate::store::sqlite::test_support::seed_video;
    use crate::store::ProcessingState;

    fn setup() -> (LockManager, Arc<ManualClock>, i64) {
        let db = Arc::new(Database::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(from_millis(1_700_000_000_000)));
        let chunk = seed_video(&db, "V", 1, clock.now()).remove(0);
        let locks = LockManager::new(db, clock.clone(), LockSettings::default());
        (locks, clock, chunk.id)
    }

    #[test]
    fn test_conflict_then_expiry() {
        let (locks, clock, chunk) = setup();

        let grant = locks.acquire(chunk, "alice", Some(Duration::from_secs(300))).unwrap();
        assert_eq!(grant.locked_by, "alice");
        assert_eq!((grant.expires_at - grant.locked_at).num_seconds(), 300);

        clock.advance(chrono::Duration::seconds(100));
        match locks.acquire(chunk, "bob", None) {
            Err(RettelseError::LockConflict { held_by, .. }) => assert_eq!(held_by, "alice"),
            other => panic!("expected conflict, got {:?}", other),
        }

        clock.advance(chrono::Duration::seconds(210));
        let grant = locks.acquire(chunk, "bob", None).unwrap();
        assert_eq!(grant.locked_by, "bob");
        assert_eq!(locks.status(chunk).unwrap().unwrap().locked_by, "bob");
    }

    #[test]
    fn test_holder_reacquire_refreshes() {
        let (locks, clock, chunk) = setup();
        locks.acquire(chunk, "alice", Some(Duration::from_secs(60))).unwrap();
        clock.advance(chrono::Duration::seconds(50));
        let grant = locks.acquire(chunk, "alice", Some(Duration::from_secs(60))).unwrap();
        assert_eq!(grant.locked_at, clock.now());

        clock.advance(chrono::Duration::seconds(50));
        assert!(locks.acquire(chunk, "bob", None).is_err());
    }

    #[test]
    fn test_ttl_is_clamped() {
        let (locks, _, chunk) = setup();
        let grant = locks.acquire(chunk, "alice", Some(Duration::from_secs(5))).unwrap();
        assert_eq!((grant.expires_at - grant.locked_at).num_seconds(), 30);
    }

    #[test]
    fn test_renew() {
        let (locks, clock, chunk) = setup();
        assert!(matches!(
            locks.renew(chunk, "alice"),
            Err(RettelseError::LockNotHeld { .. })
        ));

        locks.acquire(chunk, "alice", Some(Duration::from_secs(60))).unwrap();
        clock.advance(chrono::Duration::seconds(45));
        let grant = locks.renew(chunk, "alice").unwrap();
        assert_eq!(grant.expires_at, clock.now() + chrono::Duration::seconds(60));

        assert!(locks.renew(chunk, "bob").is_err());

        clock.advance(chrono::Duration::seconds(61));
        assert!(locks.renew(chunk, "alice").is_err());
    }

    #[test]
    fn test_release_semantics() {
        let (locks, clock, chunk) = setup();

        assert!(!locks.release(chunk, "alice").unwrap());

        locks.acquire(chunk, "alice", None).unwrap();
        assert!(matches!(
            locks.release(chunk, "bob"),
            Err(RettelseError::LockConflict { .. })
        ));
        assert!(locks.release(chunk, "alice").unwrap());
        assert!(locks.status(chunk).unwrap().is_none());

        locks.acquire(chunk, "bob", Some(Duration::from_secs(30))).unwrap();
        clock.advance(chrono::Duration::seconds(31));
        assert!(!locks.release(chunk, "alice").unwrap());
    }

    #[test]
    fn test_unknown_chunk() {
        let (locks, _, _) = setup();
        assert!(matches!(
            locks.acquire(999, "alice", None),
            Err(RettelseError::NotFound(_))
        ));
        assert!(matches!(locks.release(999, "alice"), Err(RettelseError::NotFound(_))));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let (locks, _, chunk) = setup();
        let locks = Arc::new(locks);
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|user| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.acquire(chunk, user, None)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(e) if e.is_lock_contention())));
    }

    #[test]
    fn test_review_requires_lock() {
        let (locks, clock, chunk) = setup();
        let db = locks.db.clone();
        {
            let conn = db.connection().unwrap();
            conn.execute(
                "UPDATE chunks SET processing_state = 'transcribed' WHERE id = ?1",
                params![chunk],
            )
            .unwrap();
        }

        assert!(db
            .review_transition(chunk, "alice", ProcessingState::Reviewed, clock.now())
            .is_err());

        locks.acquire(chunk, "alice", None).unwrap();
        let reviewed = db
            .review_transition(chunk, "alice", ProcessingState::Reviewed, clock.now())
            .unwrap();
        assert_eq!(reviewed.processing_state, ProcessingState::Reviewed);

        assert!(matches!(
            db.review_transition(chunk, "bob", ProcessingState::Exported, clock.now()),
            Err(RettelseError::LockConflict { .. })
        ));
        assert!(matches!(
            db.review_transition(chunk, "alice", ProcessingState::Transcribed, clock.now()),
            Err(RettelseError::InvalidTransition { .. })
        ));
    }
}
