//! Inventory update and alert broadcasts.
//!
//! Upstream stock systems tend to emit the same fact several times in a
//! burst. A short-lived dedup cache keyed by product, variant and event
//! kind suppresses repeats inside the window. Plain stock movements fan out
//! immediately through the hub; threshold alerts ride the reliable queue at
//! a priority derived from their severity.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cartwire_core::{
    AlertSeverity, AlertType, Envelope, InventoryAlert, InventoryUpdate, InventoryUpdateKind,
    Payload, Priority,
};
use cartwire_hub::{Hub, ReliableQueue};
use cartwire_settings::InventorySettings;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CHANNEL: &str = "inventory";

/// Inventory broadcast settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryConfig {
    /// Window in which a repeated event is suppressed.
    pub dedup_ttl: Duration,
    /// Dedup-cache janitor interval.
    pub sweep_interval: Duration,
}

impl From<&InventorySettings> for InventoryConfig {
    fn from(s: &InventorySettings) -> Self {
        Self {
            dedup_ttl: Duration::from_millis(s.dedup_ttl_ms),
            sweep_interval: Duration::from_millis(s.sweep_interval_ms),
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self::from(&InventorySettings::default())
    }
}

/// Identity of a stocked item.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProductRef {
    /// Product identifier.
    pub product_id: String,
    /// Variant identifier.
    pub variant_id: Option<String>,
    /// Warehouse or store location.
    pub location_id: Option<String>,
}

impl ProductRef {
    /// A product without variant or location.
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            variant_id: None,
            location_id: None,
        }
    }

    /// Set the variant.
    #[must_use]
    pub fn with_variant(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    /// Set the location.
    #[must_use]
    pub fn at_location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }
}

/// A quantity movement reported by the stock system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StockMovement {
    /// What moved.
    pub product: ProductRef,
    /// Quantity before.
    pub previous_quantity: i64,
    /// Quantity after.
    pub new_quantity: i64,
    /// Units held by reservations.
    pub reserved_quantity: Option<i64>,
    /// Upstream reason.
    pub reason: Option<String>,
}

impl StockMovement {
    /// A movement from `previous` to `new` units.
    pub fn new(product: ProductRef, previous_quantity: i64, new_quantity: i64) -> Self {
        Self {
            product,
            previous_quantity,
            new_quantity,
            reserved_quantity: None,
            reason: None,
        }
    }

    /// Record reserved units.
    #[must_use]
    pub fn with_reserved(mut self, reserved: i64) -> Self {
        self.reserved_quantity = Some(reserved);
        self
    }

    /// Record the upstream reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn into_update(self, kind: InventoryUpdateKind) -> InventoryUpdate {
        InventoryUpdate {
            product_id: self.product.product_id,
            variant_id: self.product.variant_id,
            location_id: self.product.location_id,
            kind,
            previous_quantity: self.previous_quantity,
            new_quantity: self.new_quantity,
            reserved_quantity: self.reserved_quantity,
            reason: self.reason,
            timestamp: Utc::now(),
        }
    }
}

/// Severity from the ratio of `current` to `threshold`.
///
/// Zero or less is critical, as is anything at or below 10% of the
/// threshold; up to 30% is high, up to 50% medium, anything above low.
/// Out-of-stock alerts are always critical.
pub fn alert_severity(alert_type: AlertType, current: i64, threshold: i64) -> AlertSeverity {
    if alert_type == AlertType::OutOfStock || current <= 0 {
        return AlertSeverity::Critical;
    }
    if threshold <= 0 {
        return AlertSeverity::Low;
    }
    let percent = current as f64 * 100.0 / threshold as f64;
    if percent <= 10.0 {
        AlertSeverity::Critical
    } else if percent <= 30.0 {
        AlertSeverity::High
    } else if percent <= 50.0 {
        AlertSeverity::Medium
    } else {
        AlertSeverity::Low
    }
}

/// Queue priority for an alert of `severity`.
pub fn alert_priority(severity: AlertSeverity) -> Priority {
    match severity {
        AlertSeverity::Critical => Priority::Critical,
        AlertSeverity::High => Priority::High,
        AlertSeverity::Medium => Priority::Normal,
        AlertSeverity::Low => Priority::Low,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DedupKey {
    product_id: String,
    variant_id: Option<String>,
    kind: String,
}

/// Remembers recently seen facts for a fixed window.
#[derive(Debug)]
struct DedupCache {
    ttl: Duration,
    seen: HashMap<DedupKey, Instant>,
}

impl DedupCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
        }
    }

    /// Record `key`; `false` if it was already seen inside the window.
    fn admit(&mut self, key: DedupKey, now: Instant) -> bool {
        match self.seen.get(&key) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            _ => {
                let _ = self.seen.insert(key, now);
                true
            }
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        let ttl = self.ttl;
        self.seen.retain(|_, at| now.duration_since(*at) < ttl);
        before - self.seen.len()
    }
}

/// Read-only counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryStats {
    /// Updates fanned out.
    pub updates_sent: u64,
    /// Alerts queued.
    pub alerts_sent: u64,
    /// Events suppressed as duplicates.
    pub suppressed: u64,
    /// Keys held in the dedup cache.
    pub cache_size: usize,
}

/// Publishes stock movements and threshold alerts.
pub struct InventoryManager {
    config: InventoryConfig,
    hub: Arc<Hub>,
    queue: Arc<ReliableQueue>,
    dedup: Mutex<DedupCache>,
    updates_sent: AtomicU64,
    alerts_sent: AtomicU64,
    suppressed: AtomicU64,
}

impl InventoryManager {
    /// Create a manager. Updates go through `hub`, alerts through `queue`.
    pub fn new(config: InventoryConfig, hub: Arc<Hub>, queue: Arc<ReliableQueue>) -> Self {
        Self {
            dedup: Mutex::new(DedupCache::new(config.dedup_ttl)),
            config,
            hub,
            queue,
            updates_sent: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    // ── Updates ─────────────────────────────────────────────────────

    /// On-hand quantity changed. Returns whether it was broadcast.
    pub fn broadcast_stock_change(&self, movement: StockMovement) -> bool {
        self.publish_update(movement.into_update(InventoryUpdateKind::StockChange))
    }

    /// Reserved quantity changed. Returns whether it was broadcast.
    pub fn broadcast_reservation_update(&self, movement: StockMovement) -> bool {
        self.publish_update(movement.into_update(InventoryUpdateKind::Reservation))
    }

    /// Stock was replenished. Returns whether it was broadcast.
    pub fn broadcast_restock(&self, movement: StockMovement) -> bool {
        self.publish_update(movement.into_update(InventoryUpdateKind::Restock))
    }

    fn publish_update(&self, update: InventoryUpdate) -> bool {
        let key = DedupKey {
            product_id: update.product_id.clone(),
            variant_id: update.variant_id.clone(),
            kind: format!("{}:{}", update.kind.as_str(), update.new_quantity),
        };
        if !self.admit(key) {
            return false;
        }

        let (kind, new_quantity) = (update.kind, update.new_quantity);
        let envelope = Envelope::new(Payload::InventoryUpdate(update)).on_channel(CHANNEL);
        let report = self.hub.broadcast_all(&envelope);
        let _ = self.updates_sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            kind = kind.as_str(),
            new_quantity,
            delivered = report.delivered,
            "inventory update broadcast"
        );
        true
    }

    // ── Alerts ──────────────────────────────────────────────────────

    /// Quantity fell to or below `threshold`. Returns whether it was queued.
    pub async fn broadcast_low_stock_alert(
        &self,
        product: ProductRef,
        current: i64,
        threshold: i64,
    ) -> bool {
        let message = format!(
            "Low stock: {} has {current} left (threshold {threshold})",
            product.product_id
        );
        self.publish_alert(AlertType::LowStock, product, current, threshold, message)
            .await
    }

    /// Quantity reached zero. Returns whether it was queued.
    pub async fn broadcast_out_of_stock_alert(&self, product: ProductRef) -> bool {
        let message = format!("Out of stock: {}", product.product_id);
        self.publish_alert(AlertType::OutOfStock, product, 0, 0, message)
            .await
    }

    /// Quantity rose above `threshold`. Returns whether it was queued.
    pub async fn broadcast_overstock_alert(
        &self,
        product: ProductRef,
        current: i64,
        threshold: i64,
    ) -> bool {
        let message = format!(
            "Overstock: {} has {current} units (threshold {threshold})",
            product.product_id
        );
        self.publish_alert(AlertType::Overstock, product, current, threshold, message)
            .await
    }

    async fn publish_alert(
        &self,
        alert_type: AlertType,
        product: ProductRef,
        current: i64,
        threshold: i64,
        message: String,
    ) -> bool {
        let key = DedupKey {
            product_id: product.product_id.clone(),
            variant_id: product.variant_id.clone(),
            kind: alert_type.as_str().to_owned(),
        };
        if !self.admit(key) {
            return false;
        }

        let severity = alert_severity(alert_type, current, threshold);
        let alert = InventoryAlert {
            product_id: product.product_id,
            variant_id: product.variant_id,
            location_id: product.location_id,
            alert_type,
            current_quantity: current,
            threshold,
            severity,
            message,
            timestamp: Utc::now(),
        };
        info!(
            product_id = %alert.product_id,
            alert_type = alert_type.as_str(),
            ?severity,
            current,
            threshold,
            "inventory alert"
        );
        let envelope = Envelope::new(Payload::InventoryAlert(alert))
            .with_priority(alert_priority(severity))
            .on_channel(CHANNEL);
        let _ = self.queue.enqueue(envelope).await;
        let _ = self.alerts_sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn admit(&self, key: DedupKey) -> bool {
        let admitted = self.dedup.lock().admit(key.clone(), Instant::now());
        if !admitted {
            let _ = self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(product_id = %key.product_id, kind = %key.kind, "duplicate inventory event suppressed");
        }
        admitted
    }

    // ── Janitor ─────────────────────────────────────────────────────

    /// Drop dedup entries older than the window.
    pub fn sweep_dedup(&self) -> usize {
        self.dedup.lock().sweep(Instant::now())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> InventoryStats {
        InventoryStats {
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            cache_size: self.dedup.lock().seen.len(),
        }
    }

    /// Spawn the dedup-cache janitor.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = manager.sweep_dedup();
                    }
                    () = cancel.cancelled() => break,
                }
            }
            debug!("inventory dedup janitor stopped");
        })
    }
}
