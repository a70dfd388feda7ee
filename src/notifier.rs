//! Live queue status fan-out.
//!
//! Writers (queue operations) only poke a [`ChangeSignal`]; a dedicated task
//! computes the summary and pushes it to every subscriber through its own
//! bounded channel. A subscriber whose channel is full or closed is dropped,
//! so a slow client can never hold up job completion or lock acquisition.

use crate::config::NotifierSettings;
use crate::error::Result;
use crate::queue::JobQueue;
use crate::store::QueueSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Event pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum QueueEvent {
    /// The queue changed; carries the full summary.
    QueueUpdate(QueueSummary),
    /// Nothing changed for a while; the connection is alive.
    Heartbeat { at: DateTime<Utc> },
}

impl QueueEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::QueueUpdate(_) => "queue_update",
            QueueEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Cheap, non-blocking "something changed" handle held by writers.
///
/// Signals raised while a summary is being computed coalesce into one push.
#[derive(Debug, Clone, Default)]
pub struct ChangeSignal(Arc<Notify>);

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_one();
    }

    async fn notified(&self) {
        self.0.notified().await
    }
}

/// A live subscription to queue events.
pub struct Subscription {
    pub id: u64,
    receiver: mpsc::Receiver<QueueEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<QueueEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Maintains subscriber channels and pushes queue state to them.
pub struct StatusNotifier {
    settings: NotifierSettings,
    signal: ChangeSignal,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<QueueEvent>>>,
    next_id: AtomicU64,
}

impl StatusNotifier {
    pub fn new(settings: NotifierSettings) -> Self {
        Self {
            settings,
            signal: ChangeSignal::new(),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Handle for writers to report a state transition.
    pub fn signal(&self) -> ChangeSignal {
        self.signal.clone()
    }

    /// Register a subscriber, then queue `current()` as its first event.
    ///
    /// The snapshot is taken after the channel is registered and while the
    /// subscriber map is held, so no broadcast can land between the two.
    pub fn subscribe<F>(&self, current: F) -> Result<Subscription>
    where
        F: FnOnce() -> Result<QueueSummary>,
    {
        let (tx, rx) = mpsc::channel(self.settings.subscriber_buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.insert(id, tx.clone());
        let summary = match current() {
            Ok(summary) => summary,
            Err(e) => {
                subscribers.remove(&id);
                return Err(e);
            }
        };
        // A fresh channel always has room for the first event.
        let _ = tx.try_send(QueueEvent::QueueUpdate(summary));
        debug!("Subscriber {} connected ({} total)", id, subscribers.len());

        Ok(Subscription { id, receiver: rx })
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if subscribers.remove(&id).is_some() {
            debug!("Subscriber {} removed ({} left)", id, subscribers.len());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Push an event to every subscriber without waiting. Returns how many received it.
    pub fn broadcast(&self, event: &QueueEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;

        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Dropping subscriber {}: not keeping up", id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Subscriber {} disconnected", id);
                false
            }
        });

        delivered
    }

    /// Run the push loop until `shutdown` flips or its sender goes away.
    pub async fn run(self: Arc<Self>, queue: Arc<JobQueue>, mut shutdown: watch::Receiver<bool>) {
        let heartbeat = Duration::from_secs(self.settings.heartbeat_secs.max(1));
        let mut last_push = Instant::now();

        info!("Status notifier started (heartbeat {}s)", heartbeat.as_secs());

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.signal.notified() => {
                    match queue.summary(None) {
                        Ok(summary) => {
                            let delivered = self.broadcast(&QueueEvent::QueueUpdate(summary));
                            debug!("Pushed queue update to {} subscribers", delivered);
                        }
                        Err(e) => warn!("Failed to compute queue summary: {}", e),
                    }
                    last_push = Instant::now();
                }
                _ = tokio::time::sleep_until(last_push + heartbeat) => {
                    self.broadcast(&QueueEvent::Heartbeat { at: Utc::now() });
                    last_push = Instant::now();
                }
            }
        }

        // Closing the channels ends every open stream.
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!("Status notifier stopped");
    }
}
