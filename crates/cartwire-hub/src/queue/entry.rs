//! Queue entries and retry back-off.

use std::time::Duration;

use cartwire_core::{Envelope, MessageId, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// An envelope awaiting reliable delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The message.
    pub envelope: Envelope,
    /// Failed attempts so far. Never exceeds `max_retries`.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Ordering key, copied from the envelope.
    pub priority: Priority,
    /// When the entry was first queued.
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) not_before: Option<Instant>,
}

impl QueueEntry {
    /// Wrap an envelope with a retry budget.
    pub fn new(envelope: Envelope, max_retries: u32) -> Self {
        Self {
            priority: envelope.priority(),
            envelope,
            retry_count: 0,
            max_retries,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    /// Envelope ID.
    pub fn id(&self) -> &MessageId {
        self.envelope.id()
    }

    /// Attempts made, counting the one in flight.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Whether another failure would exceed the budget.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }
}

/// Cool-down after the `retry`-th failure: `base * 2^(retry-1)`, capped at
/// `max`.
pub fn backoff_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    let exponent = retry.saturating_sub(1).min(31);
    base.saturating_mul(1_u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartwire_core::Payload;
    use cartwire_core::payload::Empty;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(4, base, max), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, base, max), max);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn entry_copies_priority_and_tracks_budget() {
        let env = Envelope::new(Payload::Ping(Empty {})).with_priority(Priority::High);
        let mut entry = QueueEntry::new(env, 1);
        assert_eq!(entry.priority, Priority::High);
        assert_eq!(entry.attempts(), 1);
        assert!(!entry.is_exhausted());
        entry.retry_count = 1;
        assert!(entry.is_exhausted());
        assert_eq!(entry.attempts(), 2);
    }

    #[test]
    fn entry_persists_without_schedule() {
        let mut entry = QueueEntry::new(Envelope::new(Payload::Ping(Empty {})), 3);
        entry.not_before = Some(Instant::now());
        let json = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), entry.id());
        assert!(back.not_before.is_none());
    }
}
