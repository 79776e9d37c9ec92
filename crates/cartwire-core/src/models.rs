//! Domain records carried inside envelopes.
//!
//! These are the shared vocabulary between the hub, the auth layer and the
//! domain managers: money, auth levels, cart lines and state, inventory
//! events and notifications. Behaviour that needs configuration (cart
//! recomputation, alert severity) lives with the owning manager.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Priority;
use crate::ids::{NotificationId, SessionId, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// Money
// ─────────────────────────────────────────────────────────────────────────────

/// An amount in minor currency units (cents).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Build from minor units.
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Minor units.
    #[must_use]
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Multiply by a rate, rounding half away from zero to the nearest cent.
    #[must_use]
    pub fn scale(self, rate: f64) -> Self {
        Self((self.0 as f64 * rate).round() as i64)
    }

    /// Sum, or `None` on overflow.
    #[must_use]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    /// Price of `quantity` units, or `None` on overflow.
    #[must_use]
    pub fn checked_mul(self, quantity: u32) -> Option<Self> {
        self.0.checked_mul(i64::from(quantity)).map(Self)
    }

    /// Sum of every amount, or `None` if any partial sum overflows.
    pub fn checked_sum<I: IntoIterator<Item = Self>>(amounts: I) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, Self::checked_add)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth level
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse authorization ordinal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    /// No credential presented.
    #[default]
    Anonymous,
    /// Valid credential for a regular user.
    Authenticated,
    /// Valid credential carrying the admin role.
    Admin,
}

impl AuthLevel {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cart
// ─────────────────────────────────────────────────────────────────────────────

/// One line of a cart. Lines are identified by `(product_id, variant_id)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Product identifier.
    pub product_id: String,
    /// Variant identifier (size, colour, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    /// Display name captured when the item was added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Units in the cart, always at least 1.
    pub quantity: u32,
    /// Price per unit.
    pub unit_price: Money,
    /// `quantity * unit_price`.
    pub line_total: Money,
}

impl CartItem {
    /// Whether this line has the given identity.
    pub fn matches(&self, product_id: &str, variant_id: Option<&str>) -> bool {
        self.product_id == product_id && self.variant_id.as_deref() == variant_id
    }
}

/// Item to add to a cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItemInput {
    /// Product identifier.
    pub product_id: String,
    /// Variant identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Units to add.
    pub quantity: u32,
    /// Price per unit.
    pub unit_price: Money,
}

impl CartItemInput {
    /// Build an input for a product without a variant.
    pub fn new(product_id: impl Into<String>, quantity: u32, unit_price: Money) -> Self {
        Self {
            product_id: product_id.into(),
            variant_id: None,
            name: None,
            quantity,
            unit_price,
        }
    }

    /// Set the variant.
    #[must_use]
    pub fn with_variant(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }
}

impl From<&CartItem> for CartItemInput {
    fn from(item: &CartItem) -> Self {
        Self {
            product_id: item.product_id.clone(),
            variant_id: item.variant_id.clone(),
            name: item.name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
        }
    }
}

/// Reference to a cart line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLineRef {
    /// Product identifier.
    pub product_id: String,
    /// Variant identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
}

/// New quantity for a cart line. Zero or negative removes the line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartQuantityChange {
    /// Product identifier.
    pub product_id: String,
    /// Variant identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    /// Requested quantity.
    pub quantity: i64,
}

/// Authoritative cart for one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartState {
    /// Owning session.
    pub session_id: SessionId,
    /// Linked user, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Cart lines in insertion order.
    pub items: Vec<CartItem>,
    /// Sum of line totals.
    pub subtotal: Money,
    /// Tax on the subtotal.
    pub tax: Money,
    /// Shipping fee.
    pub shipping: Money,
    /// `subtotal + tax + shipping`.
    pub total: Money,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl CartState {
    /// Create an empty cart.
    pub fn new(session_id: SessionId, currency: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id: None,
            items: Vec::new(),
            subtotal: Money::ZERO,
            tax: Money::ZERO,
            shipping: Money::ZERO,
            total: Money::ZERO,
            currency: currency.into(),
            updated_at: Utc::now(),
        }
    }

    /// Total units across all lines.
    pub fn item_count(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }

    /// Find a line by identity.
    pub fn find_item(&self, product_id: &str, variant_id: Option<&str>) -> Option<&CartItem> {
        self.items.iter().find(|i| i.matches(product_id, variant_id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inventory
// ─────────────────────────────────────────────────────────────────────────────

/// What changed in an inventory update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryUpdateKind {
    /// On-hand quantity changed.
    StockChange,
    /// Reserved quantity changed.
    Reservation,
    /// Stock was replenished.
    Restock,
}

impl InventoryUpdateKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StockChange => "stock_change",
            Self::Reservation => "reservation",
            Self::Restock => "restock",
        }
    }
}

/// A stock movement for a product/variant/location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUpdate {
    /// Product identifier.
    pub product_id: String,
    /// Variant identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    /// Warehouse or store location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    /// Kind of change.
    pub kind: InventoryUpdateKind,
    /// Quantity before the change.
    pub previous_quantity: i64,
    /// Quantity after the change.
    pub new_quantity: i64,
    /// Units held by open reservations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_quantity: Option<i64>,
    /// Free-form reason from the upstream system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the change was observed.
    pub timestamp: DateTime<Utc>,
}

/// Threshold breach category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Quantity fell to or below the low-stock threshold.
    LowStock,
    /// Quantity reached zero.
    OutOfStock,
    /// Quantity exceeded the overstock threshold.
    Overstock,
}

impl AlertType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowStock => "low_stock",
            Self::OutOfStock => "out_of_stock",
            Self::Overstock => "overstock",
        }
    }
}

/// Alert severity, ordered from least to most urgent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational.
    Low,
    /// Worth a look.
    Medium,
    /// Needs attention soon.
    High,
    /// Needs attention now.
    Critical,
}

/// A threshold breach for a product/variant/location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAlert {
    /// Product identifier.
    pub product_id: String,
    /// Variant identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    /// Warehouse or store location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    /// Breach category.
    pub alert_type: AlertType,
    /// Quantity at the time of the alert.
    pub current_quantity: i64,
    /// Threshold that was crossed.
    pub threshold: i64,
    /// Computed severity.
    pub severity: AlertSeverity,
    /// Human-readable summary.
    pub message: String,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Visual flavour of a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    /// Neutral information.
    Info,
    /// Something succeeded.
    Success,
    /// Something may need attention.
    Warning,
    /// Something failed.
    Error,
    /// Urgent alert.
    Alert,
}

/// Call to action attached to a notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    /// Button label.
    pub label: String,
    /// Target URL or client route.
    pub url: String,
}

/// A targeted, possibly expiring message for end users.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Filled on send when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NotificationId>,
    /// Flavour.
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
    /// Category used by preference filtering (e.g. `orders`, `promotions`).
    pub category: String,
    /// Short title.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Optional call to action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NotificationAction>,
    /// Filled on send when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Filled on send when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the recipient has read it.
    #[serde(default)]
    pub read: bool,
}

impl Notification {
    /// Build a notification with normal priority and no defaults filled yet.
    pub fn new(
        notification_type: NotificationType,
        category: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            notification_type,
            priority: Priority::Normal,
            category: category.into(),
            title: title.into(),
            message: message.into(),
            action: None,
            created_at: None,
            expires_at: None,
            read: false,
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a call to action.
    #[must_use]
    pub fn with_action(mut self, label: impl Into<String>, url: impl Into<String>) -> Self {
        self.action = Some(NotificationAction {
            label: label.into(),
            url: url.into(),
        });
        self
    }

    /// Whether the notification has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn money_display() {
        assert_eq!(Money::from_cents(599).to_string(), "5.99");
        assert_eq!(Money::from_cents(5).to_string(), "0.05");
        assert_eq!(Money::from_cents(-250).to_string(), "-2.50");
    }

    #[test]
    fn money_scale_rounds_to_cent() {
        // 8.5% of $40.00 = $3.40
        assert_eq!(Money::from_cents(4000).scale(0.085), Money::from_cents(340));
        // 8.5% of $0.10 = 0.85 cents -> 1 cent
        assert_eq!(Money::from_cents(10).scale(0.085), Money::from_cents(1));
    }

    #[test]
    fn money_checked_arithmetic() {
        assert_eq!(Money::from_cents(1000).checked_mul(3), Some(Money::from_cents(3000)));
        assert_eq!(Money::from_cents(i64::MAX / 2).checked_mul(3), None);
        assert_eq!(Money::from_cents(i64::MAX).checked_add(Money::from_cents(1)), None);

        let total = Money::checked_sum([Money::from_cents(1), Money::from_cents(2)]);
        assert_eq!(total, Some(Money::from_cents(3)));
        assert_eq!(Money::checked_sum([Money::from_cents(i64::MAX), Money::from_cents(1)]), None);
        assert_eq!(Money::checked_sum(Vec::new()), Some(Money::ZERO));
    }

    #[test]
    fn auth_levels_are_ordered() {
        assert!(AuthLevel::Anonymous < AuthLevel::Authenticated);
        assert!(AuthLevel::Authenticated < AuthLevel::Admin);
        assert_eq!(serde_json::to_string(&AuthLevel::Admin).unwrap(), "\"admin\"");
    }

    #[test]
    fn severity_is_ordered() {
        assert!(AlertSeverity::Critical > AlertSeverity::High);
        assert!(AlertSeverity::Medium > AlertSeverity::Low);
    }

    #[test]
    fn cart_item_identity_includes_variant() {
        let item = CartItem {
            product_id: "sku-1".into(),
            variant_id: Some("red".into()),
            name: None,
            quantity: 1,
            unit_price: Money::from_cents(100),
            line_total: Money::from_cents(100),
        };
        assert!(item.matches("sku-1", Some("red")));
        assert!(!item.matches("sku-1", None));
        assert!(!item.matches("sku-2", Some("red")));
    }

    #[test]
    fn notification_type_field_is_renamed() {
        let n = Notification::new(NotificationType::Warning, "orders", "Late", "Your order is late");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "warning");
        assert_eq!(json["priority"], "normal");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn notification_expiry() {
        let now = Utc::now();
        let mut n = Notification::new(NotificationType::Info, "c", "t", "m");
        assert!(!n.is_expired_at(now));
        n.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(n.is_expired_at(now));
    }

    proptest! {
        #[test]
        fn scale_stays_within_half_a_cent(cents in -1_000_000_000i64..1_000_000_000, rate in 0.0f64..1.0) {
            let exact = cents as f64 * rate;
            let scaled = Money::from_cents(cents).scale(rate).cents() as f64;
            prop_assert!((scaled - exact).abs() <= 0.5);
        }

        #[test]
        fn display_keeps_two_decimals(cents in -1_000_000_000_000i64..1_000_000_000_000) {
            let text = Money::from_cents(cents).to_string();
            let (whole, frac) = text.rsplit_once('.').unwrap();
            prop_assert_eq!(frac.len(), 2);
            let back = whole.trim_start_matches('-').parse::<i64>().unwrap() * 100
                + frac.parse::<i64>().unwrap();
            prop_assert_eq!(back, cents.abs());
        }
    }
}
