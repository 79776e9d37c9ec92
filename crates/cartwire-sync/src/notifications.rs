//! User notifications with per-user delivery preferences.
//!
//! Every sent notification is recorded in an active index until it expires,
//! whether or not it was pushed. Pushes honour the recipient's
//! [`NotificationPreferences`]. High and critical notifications for a single
//! user go through the reliable queue; everything else fans out directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cartwire_core::{
    Envelope, Notification, NotificationId, NotificationType, Payload, Priority, Scope, SessionId,
    UserId,
};
use cartwire_hub::{ClientConnection, Hub, ReliableQueue};
use cartwire_settings::NotificationSettings;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const CHANNEL: &str = "notifications";

/// Notification manager settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Expiry for notifications sent without one.
    pub default_ttl: Duration,
    /// Expiry sweep interval.
    pub sweep_interval: Duration,
}

impl From<&NotificationSettings> for NotificationConfig {
    fn from(s: &NotificationSettings) -> Self {
        Self {
            default_ttl: Duration::from_millis(s.default_ttl_ms),
            sweep_interval: Duration::from_millis(s.sweep_interval_ms),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self::from(&NotificationSettings::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Preferences
// ─────────────────────────────────────────────────────────────────────────────

/// Daily window in the user's local time. Wraps past midnight when `end`
/// is earlier than `start`; `start == end` is an empty window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    /// Window start, inclusive.
    pub start: NaiveTime,
    /// Window end, exclusive.
    pub end: NaiveTime,
    /// User's offset from UTC in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl QuietHours {
    /// A window in UTC.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            utc_offset_minutes: 0,
        }
    }

    /// Whether `now` falls inside the window.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .map_or_else(|| now.time(), |tz| now.with_timezone(&tz).time());
        if self.start <= self.end {
            self.start <= local && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

/// What a user wants pushed. Categories and types not listed are enabled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationPreferences {
    /// Per-category switches.
    pub categories: HashMap<String, bool>,
    /// Per-type switches.
    pub types: HashMap<NotificationType, bool>,
    /// Lowest priority pushed.
    pub min_priority: Priority,
    /// Window in which only critical notifications are pushed.
    pub quiet_hours: Option<QuietHours>,
}

impl NotificationPreferences {
    /// Whether `category` is enabled.
    pub fn category_enabled(&self, category: &str) -> bool {
        self.categories.get(category).copied().unwrap_or(true)
    }

    /// Whether `notification_type` is enabled.
    pub fn type_enabled(&self, notification_type: NotificationType) -> bool {
        self.types.get(&notification_type).copied().unwrap_or(true)
    }

    /// Whether `notification` passes every check at `now`.
    ///
    /// Critical notifications ignore quiet hours but not the other checks.
    pub fn allows(&self, notification: &Notification, now: DateTime<Utc>) -> bool {
        if !self.category_enabled(&notification.category)
            || !self.type_enabled(notification.notification_type)
            || notification.priority < self.min_priority
        {
            return false;
        }
        match &self.quiet_hours {
            Some(quiet) if notification.priority < Priority::Critical => !quiet.contains(now),
            _ => true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
    /// Notifications in the active index.
    pub active: usize,
    /// Users with stored preferences.
    pub preferences: usize,
    /// Notifications sent since start.
    pub sent_total: u64,
    /// User-scoped pushes withheld by preferences.
    pub suppressed_total: u64,
    /// Notifications removed by expiry.
    pub expired_total: u64,
}

struct ActiveNotification {
    notification: Notification,
    scope: Scope,
    read_by: HashSet<UserId>,
    // anonymous readers
    read_by_session: HashSet<SessionId>,
}

impl ActiveNotification {
    fn visible_to(&self, session_id: Option<&SessionId>, user_id: Option<&UserId>) -> bool {
        match &self.scope {
            Scope::Broadcast => true,
            Scope::Session(target) => session_id == Some(target),
            Scope::User(target) => user_id == Some(target),
        }
    }

    fn is_read_by(&self, session_id: Option<&SessionId>, user_id: Option<&UserId>) -> bool {
        match user_id {
            Some(user_id) => self.read_by.contains(user_id),
            None => session_id.is_some_and(|s| self.read_by_session.contains(s)),
        }
    }
}

#[derive(Default)]
struct NotificationBook {
    active: HashMap<NotificationId, ActiveNotification>,
    preferences: HashMap<UserId, NotificationPreferences>,
}

/// Records, filters and delivers notifications.
pub struct NotificationManager {
    config: NotificationConfig,
    hub: Arc<Hub>,
    queue: Arc<ReliableQueue>,
    book: RwLock<NotificationBook>,
    sent_total: AtomicU64,
    suppressed_total: AtomicU64,
    expired_total: AtomicU64,
}

impl NotificationManager {
    /// Create a manager delivering through `hub` and `queue`.
    pub fn new(config: NotificationConfig, hub: Arc<Hub>, queue: Arc<ReliableQueue>) -> Self {
        Self {
            config,
            hub,
            queue,
            book: RwLock::new(NotificationBook::default()),
            sent_total: AtomicU64::new(0),
            suppressed_total: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
        }
    }

    // ── Preferences ─────────────────────────────────────────────────

    /// Replace a user's preferences.
    pub fn set_preferences(&self, user_id: &UserId, preferences: NotificationPreferences) {
        let _ = self
            .book
            .write()
            .preferences
            .insert(user_id.clone(), preferences);
    }

    /// A user's preferences, or the defaults.
    pub fn preferences(&self, user_id: &UserId) -> NotificationPreferences {
        self.book
            .read()
            .preferences
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `notification` may be pushed to `user_id` now.
    pub fn should_send_notification(&self, user_id: &UserId, notification: &Notification) -> bool {
        self.should_send_notification_at(user_id, notification, Utc::now())
    }

    /// Whether `notification` may be pushed to `user_id` at `now`.
    pub fn should_send_notification_at(
        &self,
        user_id: &UserId,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> bool {
        self.book
            .read()
            .preferences
            .get(user_id)
            .is_none_or(|p| p.allows(notification, now))
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Fill defaults, record, and deliver to `scope`. Returns the
    /// notification ID.
    #[instrument(skip_all, fields(scope = %scope, category = %notification.category))]
    pub async fn send_notification(
        &self,
        mut notification: Notification,
        scope: Scope,
    ) -> NotificationId {
        let now = Utc::now();
        let id = notification.id.get_or_insert_with(NotificationId::new).clone();
        let created_at = *notification.created_at.get_or_insert(now);
        if notification.expires_at.is_none() {
            let ttl = chrono::Duration::from_std(self.config.default_ttl).unwrap_or(chrono::Duration::MAX);
            notification.expires_at = created_at.checked_add_signed(ttl);
        }

        let _ = self.book.write().active.insert(
            id.clone(),
            ActiveNotification {
                notification: notification.clone(),
                scope: scope.clone(),
                read_by: HashSet::new(),
                read_by_session: HashSet::new(),
            },
        );
        let _ = self.sent_total.fetch_add(1, Ordering::Relaxed);

        let priority = notification.priority;
        let envelope = Envelope::new(Payload::Notification(notification.clone()))
            .with_priority(priority)
            .on_channel(CHANNEL);

        match &scope {
            Scope::User(user_id) => {
                if !self.should_send_notification_at(user_id, &notification, now) {
                    let _ = self.suppressed_total.fetch_add(1, Ordering::Relaxed);
                    debug!(notification_id = %id, user_id = %user_id, "notification withheld by preferences");
                    return id;
                }
                let envelope = envelope.to_user(user_id.clone());
                if priority >= Priority::High {
                    let _ = self.queue.enqueue(envelope).await;
                } else {
                    let _ = self.hub.broadcast(&envelope);
                }
            }
            Scope::Broadcast | Scope::Session(_) => {
                let envelope = envelope.with_scope(scope.clone());
                let allowed = |conn: &ClientConnection| {
                    conn.user_id()
                        .is_none_or(|u| self.should_send_notification_at(&u, &notification, now))
                };
                let report = self.hub.broadcast_where(&scope, &envelope, allowed);
                debug!(notification_id = %id, delivered = report.delivered, "notification fanned out");
            }
        }
        id
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Mark a notification read by a connection of `session_id`, signed in
    /// as `user_id` if any. Signed-in reads are recorded per user, others
    /// per session. Returns `false` if the notification is not active or
    /// the reader is not an addressee.
    pub fn mark_read(
        &self,
        session_id: &SessionId,
        user_id: Option<&UserId>,
        notification_id: &NotificationId,
    ) -> bool {
        let mut book = self.book.write();
        let Some(entry) = book.active.get_mut(notification_id) else {
            return false;
        };
        if !entry.visible_to(Some(session_id), user_id) {
            return false;
        }
        match user_id {
            Some(user_id) => {
                let _ = entry.read_by.insert(user_id.clone());
            }
            None => {
                let _ = entry.read_by_session.insert(session_id.clone());
            }
        }
        true
    }

    /// Unexpired notifications addressed to `user_id` or to everyone, newest
    /// first, with `read` reflecting this user.
    pub fn active_for_user(&self, user_id: &UserId) -> Vec<Notification> {
        self.active_for(None, Some(user_id))
    }

    /// Unexpired notifications a connection of `session_id` (signed in as
    /// `user_id` if any) can see, newest first.
    pub fn active_for_session(
        &self,
        session_id: &SessionId,
        user_id: Option<&UserId>,
    ) -> Vec<Notification> {
        self.active_for(Some(session_id), user_id)
    }

    fn active_for(&self, session_id: Option<&SessionId>, user_id: Option<&UserId>) -> Vec<Notification> {
        let now = Utc::now();
        let book = self.book.read();
        let mut out: Vec<Notification> = book
            .active
            .values()
            .filter(|a| a.visible_to(session_id, user_id) && !a.notification.is_expired_at(now))
            .map(|a| {
                let mut n = a.notification.clone();
                n.read = a.is_read_by(session_id, user_id);
                n
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    // ── Expiry ──────────────────────────────────────────────────────

    /// Remove notifications expired at `now`.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let removed = {
            let mut book = self.book.write();
            let before = book.active.len();
            book.active.retain(|_, a| !a.notification.is_expired_at(now));
            before - book.active.len()
        };
        if removed > 0 {
            let _ = self.expired_total.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "swept expired notifications");
        }
        removed
    }

    /// [`sweep_expired_at`](Self::sweep_expired_at) with the current time.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> NotificationStats {
        let (active, preferences) = {
            let book = self.book.read();
            (book.active.len(), book.preferences.len())
        };
        NotificationStats {
            active,
            preferences,
            sent_total: self.sent_total.load(Ordering::Relaxed),
            suppressed_total: self.suppressed_total.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
        }
    }

    /// Spawn the expiry sweep.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = manager.sweep_expired();
                    }
                    () = cancel.cancelled() => break,
                }
            }
            debug!("notification sweep stopped");
        })
    }
}
