//! Priority queue with retry and acknowledgment tracking.
//!
//! Entries are kept in descending priority order, first-in-first-out among
//! equals. Each delivery tick takes a batch from the front and fans it out
//! through the [`Hub`]. A failed attempt moves the entry into a retry pool
//! with an exponential cool-down; the retry sweep moves cooled-down entries
//! back into the main queue. An entry is attempted at most
//! `max_retries + 1` times, then dropped and logged.
//!
//! When a [`QueueStore`] is attached, every pending entry is mirrored to it
//! and [`ReliableQueue::restore`] reloads them at startup. Without a store
//! the queue lives only in memory.

mod entry;
mod store;

pub use entry::{QueueEntry, backoff_delay};
pub use store::{MemoryQueueStore, QueueStore};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cartwire_core::{Envelope, MessageId, SessionId, UserId};
use cartwire_settings::QueueSettings;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::Hub;

/// Queue tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Delivery tick.
    pub tick_interval: Duration,
    /// Retry-pool sweep interval.
    pub retry_sweep_interval: Duration,
    /// Retry budget for [`ReliableQueue::enqueue`].
    pub max_retries: u32,
    /// Cool-down after the first failure.
    pub retry_base_delay: Duration,
    /// Cool-down cap.
    pub retry_max_delay: Duration,
    /// How long a delivered entry waits for its ack.
    pub ack_timeout: Duration,
    /// Main-queue capacity.
    pub max_queue_size: usize,
    /// Entries attempted per tick.
    pub batch_size: usize,
}

impl From<&QueueSettings> for QueueConfig {
    fn from(s: &QueueSettings) -> Self {
        Self {
            tick_interval: Duration::from_millis(s.tick_interval_ms),
            retry_sweep_interval: Duration::from_millis(s.retry_sweep_interval_ms),
            max_retries: s.max_retries,
            retry_base_delay: Duration::from_millis(s.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(s.retry_max_delay_ms),
            ack_timeout: Duration::from_millis(s.ack_timeout_ms),
            max_queue_size: s.max_queue_size.max(1),
            batch_size: s.batch_size.max(1),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

/// Queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Entries waiting in the main queue.
    pub depth: usize,
    /// Entries cooling down after a failure.
    pub retry_depth: usize,
    /// Delivered entries waiting for an ack.
    pub awaiting_ack: usize,
    /// Entries accepted since start.
    pub enqueued_total: u64,
    /// Entries delivered (and acknowledged, where required).
    pub delivered_total: u64,
    /// Failed attempts that were rescheduled.
    pub retried_total: u64,
    /// Entries dropped after exhausting their retries.
    pub failed_total: u64,
    /// Entries evicted because the queue was full.
    pub evicted_total: u64,
}

/// What became of an acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The pending entry is complete.
    Acknowledged,
    /// No entry awaits this ID, or it was already settled.
    Unknown,
    /// The sender is not an addressee of the pending entry; it stays
    /// pending.
    NotAddressee,
}

struct AwaitingAck {
    entry: QueueEntry,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    main: VecDeque<QueueEntry>,
    retry: Vec<QueueEntry>,
    awaiting_ack: HashMap<String, AwaitingAck>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    let _ = counter.fetch_add(1, Ordering::Relaxed);
}

/// At-least-once delivery on top of the [`Hub`].
pub struct ReliableQueue {
    config: QueueConfig,
    hub: Arc<Hub>,
    store: Option<Arc<dyn QueueStore>>,
    state: Mutex<QueueState>,
    counters: Counters,
}

impl ReliableQueue {
    /// Create an in-memory queue delivering through `hub`.
    pub fn new(config: QueueConfig, hub: Arc<Hub>) -> Self {
        Self {
            config,
            hub,
            store: None,
            state: Mutex::new(QueueState::default()),
            counters: Counters::default(),
        }
    }

    /// Mirror pending entries to `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ── Enqueue ─────────────────────────────────────────────────────

    /// Queue `envelope` with the configured retry budget.
    pub async fn enqueue(&self, envelope: Envelope) -> MessageId {
        self.enqueue_with_retries(envelope, self.config.max_retries)
            .await
    }

    /// Queue `envelope` with an explicit retry budget. Never fails; a full
    /// queue evicts its lowest-priority tail entry.
    pub async fn enqueue_with_retries(&self, envelope: Envelope, max_retries: u32) -> MessageId {
        let entry = QueueEntry::new(envelope, max_retries);
        let id = entry.id().clone();
        self.persist(&entry).await;
        bump(&self.counters.enqueued);
        debug!(
            message_id = %id,
            message_type = %entry.envelope.message_type(),
            priority = entry.priority.as_str(),
            scope = %entry.envelope.scope(),
            "message enqueued"
        );
        if let Some(evicted) = self.insert_entry(entry) {
            self.forget(evicted.id()).await;
        }
        id
    }

    /// Insert in priority order. Returns the entry evicted to make room.
    pub(crate) fn insert_entry(&self, entry: QueueEntry) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        let at = state.main.partition_point(|e| e.priority >= entry.priority);
        state.main.insert(at, entry);
        if state.main.len() <= self.config.max_queue_size {
            return None;
        }
        let evicted = state.main.pop_back()?;
        drop(state);
        bump(&self.counters.evicted);
        warn!(
            message_id = %evicted.id(),
            priority = evicted.priority.as_str(),
            max_queue_size = self.config.max_queue_size,
            "queue full, evicted lowest-priority entry"
        );
        Some(evicted)
    }

    /// Remove up to `n` entries from the front.
    pub(crate) fn take_batch(&self, n: usize) -> Vec<QueueEntry> {
        let mut state = self.state.lock();
        let n = n.min(state.main.len());
        state.main.drain(..n).collect()
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Attempt one batch. Returns the number of entries delivered.
    pub async fn process_tick(&self) -> usize {
        let batch = self.take_batch(self.config.batch_size);
        let mut delivered = 0;
        for entry in batch {
            let report = self.hub.broadcast(&entry.envelope);
            if !report.is_delivered(entry.envelope.scope()) {
                self.record_failure(entry, "no recipient accepted").await;
                continue;
            }
            delivered += 1;
            match entry.envelope.ack_id().map(str::to_owned) {
                Some(ack_id) if entry.envelope.requires_ack() => {
                    let deadline = Instant::now() + self.config.ack_timeout;
                    let _ = self
                        .state
                        .lock()
                        .awaiting_ack
                        .insert(ack_id, AwaitingAck { entry, deadline });
                }
                _ => {
                    bump(&self.counters.delivered);
                    self.forget(entry.id()).await;
                }
            }
        }
        delivered
    }

    async fn record_failure(&self, mut entry: QueueEntry, reason: &'static str) {
        if entry.is_exhausted() {
            bump(&self.counters.failed);
            warn!(
                message_id = %entry.id(),
                message_type = %entry.envelope.message_type(),
                scope = %entry.envelope.scope(),
                attempts = entry.attempts(),
                reason,
                "message dropped after exhausting retries"
            );
            self.forget(entry.id()).await;
            return;
        }

        entry.retry_count += 1;
        let delay = backoff_delay(
            entry.retry_count,
            self.config.retry_base_delay,
            self.config.retry_max_delay,
        );
        entry.not_before = Some(Instant::now() + delay);
        bump(&self.counters.retried);
        debug!(
            message_id = %entry.id(),
            retry = entry.retry_count,
            delay_ms = delay.as_millis() as u64,
            reason,
            "delivery failed, scheduled retry"
        );
        self.persist(&entry).await;
        self.state.lock().retry.push(entry);
    }

    /// Requeue cooled-down retries and fail overdue acks. Returns the number
    /// of entries moved back into the main queue.
    pub async fn sweep_retries(&self) -> usize {
        let now = Instant::now();
        let (ready, overdue) = {
            let mut state = self.state.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) =
                state.retry.drain(..).partition(|e| e.is_ready(now));
            state.retry = waiting;

            let overdue_keys: Vec<String> = state
                .awaiting_ack
                .iter()
                .filter(|(_, w)| w.deadline <= now)
                .map(|(k, _)| k.clone())
                .collect();
            let overdue: Vec<QueueEntry> = overdue_keys
                .iter()
                .filter_map(|k| state.awaiting_ack.remove(k))
                .map(|w| w.entry)
                .collect();
            (ready, overdue)
        };

        for entry in overdue {
            self.record_failure(entry, "ack timed out").await;
        }

        let requeued = ready.len();
        for mut entry in ready {
            entry.not_before = None;
            if let Some(evicted) = self.insert_entry(entry) {
                self.forget(evicted.id()).await;
            }
        }
        requeued
    }

    /// Complete an entry awaiting `ack_id`. Returns `false` for unknown or
    /// already-acknowledged IDs.
    pub async fn acknowledge(&self, ack_id: &str) -> bool {
        let Some(waiting) = self.state.lock().awaiting_ack.remove(ack_id) else {
            return false;
        };
        self.settle(waiting).await;
        true
    }

    /// Complete an entry awaiting `ack_id` on behalf of a connection of
    /// `session_id` signed in as `user_id`. Only an addressee of the
    /// entry's scope can settle it.
    pub async fn acknowledge_from(
        &self,
        ack_id: &str,
        session_id: &SessionId,
        user_id: Option<&UserId>,
    ) -> AckOutcome {
        let waiting = {
            let mut state = self.state.lock();
            let Some(covered) = state
                .awaiting_ack
                .get(ack_id)
                .map(|w| w.entry.envelope.scope().covers(session_id, user_id))
            else {
                return AckOutcome::Unknown;
            };
            if !covered {
                return AckOutcome::NotAddressee;
            }
            state.awaiting_ack.remove(ack_id)
        };
        match waiting {
            Some(waiting) => {
                self.settle(waiting).await;
                AckOutcome::Acknowledged
            }
            None => AckOutcome::Unknown,
        }
    }

    async fn settle(&self, waiting: AwaitingAck) {
        bump(&self.counters.delivered);
        debug!(message_id = %waiting.entry.id(), "message acknowledged");
        self.forget(waiting.entry.id()).await;
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Reload persisted entries into the main queue. Returns how many were
    /// restored.
    pub async fn restore(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let entries = match store.load().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to load persisted queue");
                return 0;
            }
        };
        let restored = entries.len();
        for entry in entries {
            if let Some(evicted) = self.insert_entry(entry) {
                self.forget(evicted.id()).await;
            }
        }
        if restored > 0 {
            info!(restored, "restored persisted queue entries");
        }
        restored
    }

    async fn persist(&self, entry: &QueueEntry) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(entry).await {
            warn!(message_id = %entry.id(), error = %e, "failed to persist queue entry");
        }
    }

    async fn forget(&self, id: &MessageId) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.delete(id).await {
            warn!(message_id = %id, error = %e, "failed to delete persisted queue entry");
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Entries waiting in the main queue.
    pub fn depth(&self) -> usize {
        self.state.lock().main.len()
    }

    /// Entries cooling down.
    pub fn retry_depth(&self) -> usize {
        self.state.lock().retry.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        let (depth, retry_depth, awaiting_ack) = {
            let state = self.state.lock();
            (state.main.len(), state.retry.len(), state.awaiting_ack.len())
        };
        QueueStats {
            depth,
            retry_depth,
            awaiting_ack,
            enqueued_total: self.counters.enqueued.load(Ordering::Relaxed),
            delivered_total: self.counters.delivered.load(Ordering::Relaxed),
            retried_total: self.counters.retried.load(Ordering::Relaxed),
            failed_total: self.counters.failed.load(Ordering::Relaxed),
            evicted_total: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    /// Spawn the delivery and retry loops.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut delivery = tokio::time::interval(queue.config.tick_interval);
            let mut retries = tokio::time::interval(queue.config.retry_sweep_interval);
            let _ = delivery.tick().await;
            let _ = retries.tick().await;
            loop {
                tokio::select! {
                    _ = delivery.tick() => {
                        let _ = queue.process_tick().await;
                    }
                    _ = retries.tick() => {
                        let _ = queue.sweep_retries().await;
                    }
                    () = cancel.cancelled() => break,
                }
            }
            debug!("queue loops stopped");
        })
    }
}
