//! Per-session cart state with multi-device sync.
//!
//! One authoritative [`CartState`] per session. Every mutation recomputes
//! the totals under the manager's lock, then, with the lock released,
//! pushes the full state to the session's connections and, once the cart
//! is linked to a user, to every connection of that user.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cartwire_core::{
    CartItem, CartItemInput, CartState, Envelope, Money, Payload, Scope, SessionId, UserId,
};
use cartwire_hub::Hub;
use cartwire_settings::CartSettings;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::errors::{CartError, Result};

/// Cart pricing and janitor settings.
#[derive(Clone, Debug, PartialEq)]
pub struct CartConfig {
    /// Currency for new carts.
    pub currency: String,
    /// Tax rate applied to the subtotal.
    pub tax_rate: f64,
    /// Subtotal at or above which shipping is free.
    pub free_shipping_threshold: Money,
    /// Flat fee below the threshold.
    pub shipping_fee: Money,
    /// Carts untouched for this long are discarded.
    pub stale_ttl: Duration,
    /// Janitor interval.
    pub sweep_interval: Duration,
}

impl From<&CartSettings> for CartConfig {
    fn from(s: &CartSettings) -> Self {
        Self {
            currency: s.currency.clone(),
            tax_rate: s.tax_rate,
            free_shipping_threshold: Money::from_cents(s.free_shipping_threshold_cents),
            shipping_fee: Money::from_cents(s.shipping_fee_cents),
            stale_ttl: Duration::from_millis(s.stale_ttl_ms),
            sweep_interval: Duration::from_millis(s.sweep_interval_ms),
        }
    }
}

impl Default for CartConfig {
    fn default() -> Self {
        Self::from(&CartSettings::default())
    }
}

/// Largest quantity one cart line may hold.
pub const MAX_LINE_QUANTITY: u32 = 10_000;

/// Recompute line totals, subtotal, tax, shipping and total.
///
/// An empty cart ships free. Fails with [`CartError::TotalOverflow`] when a
/// total does not fit; `state` may then be partially updated, so callers
/// recompute a working copy.
pub fn recompute(state: &mut CartState, config: &CartConfig) -> Result<()> {
    for item in &mut state.items {
        item.line_total = item
            .unit_price
            .checked_mul(item.quantity)
            .ok_or(CartError::TotalOverflow)?;
    }
    state.subtotal = Money::checked_sum(state.items.iter().map(|i| i.line_total))
        .ok_or(CartError::TotalOverflow)?;
    state.tax = state.subtotal.scale(config.tax_rate);
    state.shipping = if state.items.is_empty() || state.subtotal >= config.free_shipping_threshold
    {
        Money::ZERO
    } else {
        config.shipping_fee
    };
    state.total = state
        .subtotal
        .checked_add(state.tax)
        .and_then(|t| t.checked_add(state.shipping))
        .ok_or(CartError::TotalOverflow)?;
    Ok(())
}

/// Read-only counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartStats {
    /// Carts held.
    pub carts: usize,
    /// Carts linked to a user.
    pub linked_carts: usize,
    /// Lines across all carts.
    pub line_items: usize,
    /// Units across all carts.
    pub units: u64,
}

struct OwnerLink {
    user_id: UserId,
    linked_at: DateTime<Utc>,
}

#[derive(Default)]
struct CartBook {
    carts: HashMap<SessionId, CartState>,
    owners: HashMap<SessionId, OwnerLink>,
}

impl CartBook {
    fn cart_mut(&mut self, session_id: &SessionId) -> Result<&mut CartState> {
        self.carts
            .get_mut(session_id)
            .ok_or_else(|| CartError::CartNotFound(session_id.clone()))
    }
}

fn validate_input(input: &CartItemInput) -> Result<()> {
    if input.quantity == 0 || input.quantity > MAX_LINE_QUANTITY {
        return Err(CartError::InvalidQuantity(i64::from(input.quantity)));
    }
    if input.unit_price < Money::ZERO {
        return Err(CartError::InvalidPrice(input.unit_price));
    }
    Ok(())
}

fn merge_line(state: &mut CartState, input: CartItemInput) -> Result<()> {
    let CartItemInput {
        product_id,
        variant_id,
        name,
        quantity,
        unit_price,
    } = input;
    if let Some(line) = state
        .items
        .iter_mut()
        .find(|i| i.matches(&product_id, variant_id.as_deref()))
    {
        let combined = line.quantity + quantity.min(MAX_LINE_QUANTITY);
        if combined > MAX_LINE_QUANTITY {
            return Err(CartError::InvalidQuantity(i64::from(combined)));
        }
        line.quantity = combined;
        line.unit_price = unit_price;
        if name.is_some() {
            line.name = name;
        }
        return Ok(());
    }
    state.items.push(CartItem {
        product_id,
        variant_id,
        name,
        quantity,
        unit_price,
        line_total: Money::ZERO,
    });
    Ok(())
}

fn item_not_found(product_id: &str, variant_id: Option<&str>) -> CartError {
    CartError::ItemNotFound {
        product_id: product_id.to_owned(),
        variant_id: variant_id.map(str::to_owned),
    }
}

/// Keeps carts consistent across a session's (and user's) devices.
pub struct CartManager {
    config: CartConfig,
    hub: Arc<Hub>,
    book: RwLock<CartBook>,
}

impl CartManager {
    /// Create a manager broadcasting through `hub`.
    pub fn new(config: CartConfig, hub: Arc<Hub>) -> Self {
        Self {
            config,
            hub,
            book: RwLock::new(CartBook::default()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &CartConfig {
        &self.config
    }

    /// An empty cart in the configured currency, for sessions without one.
    pub fn empty_state(&self, session_id: &SessionId) -> CartState {
        CartState::new(session_id.clone(), self.config.currency.clone())
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Add units of an item, combining with an existing line of the same
    /// identity. Creates the cart on first use. The incoming unit price
    /// replaces the line's price.
    ///
    /// A rejected add (bad quantity or price, or totals that would
    /// overflow) leaves the cart untouched.
    #[instrument(skip_all, fields(session_id = %session_id, product_id = %input.product_id))]
    pub fn add_item(&self, session_id: &SessionId, input: CartItemInput) -> Result<CartState> {
        validate_input(&input)?;
        self.mutate_or_create(session_id, |state| merge_line(state, input))
    }

    /// Remove a line.
    #[instrument(skip_all, fields(session_id = %session_id, product_id = %product_id))]
    pub fn remove_item(
        &self,
        session_id: &SessionId,
        product_id: &str,
        variant_id: Option<&str>,
    ) -> Result<CartState> {
        self.mutate(session_id, |state| {
            let before = state.items.len();
            state.items.retain(|i| !i.matches(product_id, variant_id));
            if state.items.len() == before {
                return Err(item_not_found(product_id, variant_id));
            }
            Ok(())
        })
    }

    /// Set a line's quantity. Zero or below removes the line.
    #[instrument(skip_all, fields(session_id = %session_id, product_id = %product_id, quantity))]
    pub fn update_quantity(
        &self,
        session_id: &SessionId,
        product_id: &str,
        variant_id: Option<&str>,
        quantity: i64,
    ) -> Result<CartState> {
        if quantity <= 0 {
            return self.remove_item(session_id, product_id, variant_id);
        }
        let quantity = u32::try_from(quantity)
            .ok()
            .filter(|q| *q <= MAX_LINE_QUANTITY)
            .ok_or(CartError::InvalidQuantity(quantity))?;
        self.mutate(session_id, |state| {
            let line = state
                .items
                .iter_mut()
                .find(|i| i.matches(product_id, variant_id))
                .ok_or_else(|| item_not_found(product_id, variant_id))?;
            line.quantity = quantity;
            Ok(())
        })
    }

    /// Empty and discard a cart. Connections receive the empty state.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn clear_cart(&self, session_id: &SessionId) -> Result<CartState> {
        let mut state = {
            let mut book = self.book.write();
            book.carts
                .remove(session_id)
                .ok_or_else(|| CartError::CartNotFound(session_id.clone()))?
        };
        state.items.clear();
        recompute(&mut state, &self.config)?;
        state.updated_at = Utc::now();
        debug!("cart cleared");
        self.publish(&state);
        Ok(state)
    }

    // Mutations run on a copy; the stored cart is replaced only once the
    // copy has been recomputed.

    fn mutate(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut CartState) -> Result<()>,
    ) -> Result<CartState> {
        let snapshot = {
            let mut book = self.book.write();
            let state = book.cart_mut(session_id)?;
            let mut next = state.clone();
            f(&mut next)?;
            recompute(&mut next, &self.config)?;
            next.updated_at = Utc::now();
            state.clone_from(&next);
            next
        };
        self.publish(&snapshot);
        Ok(snapshot)
    }

    fn mutate_or_create(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut CartState) -> Result<()>,
    ) -> Result<CartState> {
        let snapshot = {
            let mut book = self.book.write();
            let mut next = match book.carts.get(session_id) {
                Some(state) => state.clone(),
                None => {
                    let mut state = self.empty_state(session_id);
                    state.user_id = book.owners.get(session_id).map(|o| o.user_id.clone());
                    state
                }
            };
            f(&mut next)?;
            recompute(&mut next, &self.config)?;
            next.updated_at = Utc::now();
            let _ = book.carts.insert(session_id.clone(), next.clone());
            next
        };
        self.publish(&snapshot);
        Ok(snapshot)
    }

    fn publish(&self, state: &CartState) {
        let mut scopes = vec![Scope::Session(state.session_id.clone())];
        if let Some(user_id) = &state.user_id {
            scopes.push(Scope::User(user_id.clone()));
        }
        let envelope = Envelope::new(Payload::CartUpdate(state.clone()))
            .to_session(state.session_id.clone())
            .on_channel("cart");
        let report = self.hub.broadcast_to_scopes(&scopes, &envelope);
        debug!(
            session_id = %state.session_id,
            items = state.items.len(),
            total = %state.total,
            delivered = report.delivered,
            "cart state broadcast"
        );
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Copy of a session's cart.
    pub fn get_state(&self, session_id: &SessionId) -> Result<CartState> {
        self.book
            .read()
            .carts
            .get(session_id)
            .cloned()
            .ok_or_else(|| CartError::CartNotFound(session_id.clone()))
    }

    /// Copies of every cart linked to `user_id`.
    pub fn carts_for_user(&self, user_id: &UserId) -> Vec<CartState> {
        self.book
            .read()
            .carts
            .values()
            .filter(|c| c.user_id.as_ref() == Some(user_id))
            .cloned()
            .collect()
    }

    // ── Users ───────────────────────────────────────────────────────

    /// Associate a session with a user. Applies to the existing cart and to
    /// a cart created later. Returns whether an existing cart was updated.
    #[instrument(skip_all, fields(session_id = %session_id, user_id = %user_id))]
    pub fn link_user(&self, session_id: &SessionId, user_id: &UserId) -> bool {
        let snapshot = {
            let mut book = self.book.write();
            let _ = book.owners.insert(
                session_id.clone(),
                OwnerLink {
                    user_id: user_id.clone(),
                    linked_at: Utc::now(),
                },
            );
            book.carts.get_mut(session_id).map(|state| {
                state.user_id = Some(user_id.clone());
                state.clone()
            })
        };
        match snapshot {
            Some(state) => {
                self.publish(&state);
                true
            }
            None => false,
        }
    }

    /// Fold every other cart of `user_id` into the cart of
    /// `primary_session_id`, combining lines of the same identity. The
    /// folded carts are discarded; their sessions stay linked to the user,
    /// so a later add there still reaches every device.
    ///
    /// Nothing changes when the combined cart would be invalid.
    #[instrument(skip_all, fields(user_id = %user_id, session_id = %primary_session_id))]
    pub fn merge_cart_states(
        &self,
        user_id: &UserId,
        primary_session_id: &SessionId,
    ) -> Result<CartState> {
        let (snapshot, merged) = {
            let mut book = self.book.write();
            let others: Vec<SessionId> = book
                .carts
                .iter()
                .filter(|(sid, c)| *sid != primary_session_id && c.user_id.as_ref() == Some(user_id))
                .map(|(sid, _)| sid.clone())
                .collect();
            if others.is_empty() && !book.carts.contains_key(primary_session_id) {
                return Err(CartError::CartNotFound(primary_session_id.clone()));
            }

            let mut primary = book
                .carts
                .get(primary_session_id)
                .cloned()
                .unwrap_or_else(|| self.empty_state(primary_session_id));
            primary.user_id = Some(user_id.clone());
            for cart in others.iter().filter_map(|sid| book.carts.get(sid)) {
                for item in &cart.items {
                    merge_line(&mut primary, CartItemInput::from(item))?;
                }
            }
            recompute(&mut primary, &self.config)?;

            let now = Utc::now();
            primary.updated_at = now;
            for sid in &others {
                let _ = book.carts.remove(sid);
                if let Some(link) = book.owners.get_mut(sid) {
                    link.linked_at = now;
                }
            }
            let _ = book.carts.insert(primary_session_id.clone(), primary.clone());
            (primary, others.len())
        };

        if merged > 0 {
            info!(merged, items = snapshot.items.len(), "merged user carts");
        }
        self.publish(&snapshot);
        Ok(snapshot)
    }

    // ── Janitor ─────────────────────────────────────────────────────

    /// Discard carts untouched since `now - stale_ttl`, and user links of
    /// sessions that never got a cart. Returns the number of carts removed.
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.config.stale_ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut book = self.book.write();
        let before = book.carts.len();
        book.carts.retain(|_, c| c.updated_at > cutoff);
        let removed = before - book.carts.len();

        let CartBook { carts, owners } = &mut *book;
        owners.retain(|sid, link| carts.contains_key(sid) || link.linked_at > cutoff);
        drop(book);

        if removed > 0 {
            info!(removed, "swept stale carts");
        }
        removed
    }

    /// [`sweep_stale_at`](Self::sweep_stale_at) with the current time.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Utc::now())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CartStats {
        let book = self.book.read();
        CartStats {
            carts: book.carts.len(),
            linked_carts: book.carts.values().filter(|c| c.user_id.is_some()).count(),
            line_items: book.carts.values().map(|c| c.items.len()).sum(),
            units: book.carts.values().map(CartState::item_count).sum(),
        }
    }

    /// Spawn the stale-cart janitor.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = manager.sweep_stale();
                    }
                    () = cancel.cancelled() => break,
                }
            }
            debug!("cart janitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cartwire_core::AuthLevel;
    use cartwire_hub::{ClientConnection, Outbound};
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    fn manager() -> (CartManager, Arc<Hub>) {
        let hub = Arc::new(Hub::new());
        (CartManager::new(CartConfig::default(), Arc::clone(&hub)), hub)
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    fn item(product: &str, qty: u32, cents: i64) -> CartItemInput {
        CartItemInput::new(product, qty, Money::from_cents(cents))
    }

    fn attach(
        hub: &Hub,
        session: &str,
        user: Option<&str>,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = ClientConnection::channel(sid(session), 16, CancellationToken::new());
        let _ = conn.mark_connected();
        if let Some(u) = user {
            let _ = conn.apply_auth(Some(UserId::from(u)), AuthLevel::Authenticated, Vec::new());
        }
        assert!(hub.register(conn.clone()));
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<CartState> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            let env = Envelope::from_json(&text).unwrap();
            if let Payload::CartUpdate(state) = env.into_payload() {
                out.push(state);
            }
        }
        out
    }

    #[test]
    fn repeated_add_combines_lines() {
        let (carts, _hub) = manager();
        let _ = carts.add_item(&sid("s1"), item("A", 2, 1_000)).unwrap();
        let state = carts.add_item(&sid("s1"), item("A", 1, 1_000)).unwrap();

        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].quantity, 3);
        assert_eq!(state.subtotal, Money::from_cents(3_000));
        assert_eq!(state.tax, Money::from_cents(255));
        assert_eq!(state.shipping, Money::from_cents(599));
        assert_eq!(state.total, Money::from_cents(3_854));
    }

    #[test]
    fn variants_are_distinct_lines() {
        let (carts, _hub) = manager();
        let _ = carts.add_item(&sid("s1"), item("A", 1, 500).with_variant("red")).unwrap();
        let state = carts.add_item(&sid("s1"), item("A", 1, 500).with_variant("blue")).unwrap();
        assert_eq!(state.items.len(), 2);
        assert!(state.find_item("A", Some("red")).is_some());
        assert!(state.find_item("A", None).is_none());
    }

    #[test]
    fn free_shipping_at_threshold() {
        let (carts, _hub) = manager();
        let state = carts.add_item(&sid("s1"), item("A", 1, 5_000)).unwrap();
        assert_eq!(state.shipping, Money::ZERO);
        assert_eq!(state.total, Money::from_cents(5_425));
    }

    #[test]
    fn zero_quantity_add_is_rejected() {
        let (carts, _hub) = manager();
        assert_matches!(
            carts.add_item(&sid("s1"), item("A", 0, 100)),
            Err(CartError::InvalidQuantity(0))
        );
        assert_matches!(carts.get_state(&sid("s1")), Err(CartError::CartNotFound(_)));
    }

    #[test]
    fn overflowing_totals_leave_the_cart_untouched() {
        let (carts, hub) = manager();
        let (_conn, mut rx) = attach(&hub, "s1", None);

        assert_matches!(
            carts.add_item(&sid("s1"), item("A", 3, i64::MAX / 2)),
            Err(CartError::TotalOverflow)
        );
        assert_matches!(carts.get_state(&sid("s1")), Err(CartError::CartNotFound(_)));

        let before = carts.add_item(&sid("s1"), item("B", 1, 100)).unwrap();
        assert_matches!(
            carts.add_item(&sid("s1"), item("C", 1, i64::MAX)),
            Err(CartError::TotalOverflow)
        );
        let after = carts.get_state(&sid("s1")).unwrap();
        assert_eq!(after.items, before.items);
        assert_eq!(after.total, before.total);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn negative_price_is_rejected() {
        let (carts, _hub) = manager();
        assert_matches!(
            carts.add_item(&sid("s1"), item("A", 1, -500)),
            Err(CartError::InvalidPrice(p)) if p == Money::from_cents(-500)
        );
        assert_matches!(carts.get_state(&sid("s1")), Err(CartError::CartNotFound(_)));
    }

    #[test]
    fn line_quantity_is_capped() {
        let (carts, _hub) = manager();
        assert_matches!(
            carts.add_item(&sid("s1"), item("A", u32::MAX, 1)),
            Err(CartError::InvalidQuantity(q)) if q == i64::from(u32::MAX)
        );

        let _ = carts.add_item(&sid("s1"), item("A", MAX_LINE_QUANTITY, 1)).unwrap();
        assert_matches!(
            carts.add_item(&sid("s1"), item("A", 1, 1)),
            Err(CartError::InvalidQuantity(_))
        );
        assert_matches!(
            carts.update_quantity(&sid("s1"), "A", None, i64::MAX),
            Err(CartError::InvalidQuantity(i64::MAX))
        );
        let state = carts.get_state(&sid("s1")).unwrap();
        assert_eq!(state.items[0].quantity, MAX_LINE_QUANTITY);
    }

    #[test]
    fn update_quantity_sets_or_removes() {
        let (carts, _hub) = manager();
        let _ = carts.add_item(&sid("s1"), item("A", 1, 100)).unwrap();
        let _ = carts.add_item(&sid("s1"), item("B", 1, 100)).unwrap();

        let state = carts.update_quantity(&sid("s1"), "A", None, 5).unwrap();
        assert_eq!(state.find_item("A", None).unwrap().quantity, 5);

        let state = carts.update_quantity(&sid("s1"), "A", None, -1).unwrap();
        assert!(state.find_item("A", None).is_none());
        assert_eq!(state.subtotal, Money::from_cents(100));

        assert_matches!(
            carts.update_quantity(&sid("s1"), "Z", None, 2),
            Err(CartError::ItemNotFound { .. })
        );
    }

    #[test]
    fn unknown_session_is_not_found() {
        let (carts, _hub) = manager();
        assert_matches!(
            carts.remove_item(&sid("nope"), "A", None),
            Err(CartError::CartNotFound(s)) if s.as_str() == "nope"
        );
        assert_matches!(carts.clear_cart(&sid("nope")), Err(CartError::CartNotFound(_)));
        assert_matches!(
            carts.update_quantity(&sid("nope"), "A", None, 1),
            Err(CartError::CartNotFound(_))
        );
    }

    #[test]
    fn remove_missing_line_is_item_not_found() {
        let (carts, _hub) = manager();
        let _ = carts.add_item(&sid("s1"), item("A", 1, 100)).unwrap();
        assert_matches!(
            carts.remove_item(&sid("s1"), "A", Some("red")),
            Err(CartError::ItemNotFound { variant_id: Some(v), .. }) if v == "red"
        );
    }

    #[test]
    fn clear_discards_and_broadcasts_empty_state() {
        let (carts, hub) = manager();
        let (_conn, mut rx) = attach(&hub, "s1", None);
        let _ = carts.add_item(&sid("s1"), item("A", 1, 100)).unwrap();
        let cleared = carts.clear_cart(&sid("s1")).unwrap();
        assert!(cleared.items.is_empty());
        assert_eq!(cleared.total, Money::ZERO);
        assert_matches!(carts.get_state(&sid("s1")), Err(CartError::CartNotFound(_)));

        let seen = drain(&mut rx);
        assert_eq!(seen.len(), 2);
        assert!(seen[1].items.is_empty());
    }

    #[test]
    fn get_state_is_a_copy() {
        let (carts, _hub) = manager();
        let _ = carts.add_item(&sid("s1"), item("A", 1, 100)).unwrap();
        let mut copy = carts.get_state(&sid("s1")).unwrap();
        copy.items.clear();
        assert_eq!(carts.get_state(&sid("s1")).unwrap().items.len(), 1);
    }

    #[test]
    fn linked_cart_reaches_every_device_of_the_user() {
        let (carts, hub) = manager();
        let (_phone, mut phone_rx) = attach(&hub, "s-phone", Some("u1"));
        let (_laptop, mut laptop_rx) = attach(&hub, "s-laptop", Some("u1"));
        let (_other, mut other_rx) = attach(&hub, "s-other", Some("u2"));

        assert!(!carts.link_user(&sid("s-phone"), &UserId::from("u1")));
        let state = carts.add_item(&sid("s-phone"), item("A", 1, 100)).unwrap();
        assert_eq!(state.user_id, Some(UserId::from("u1")));

        assert_eq!(drain(&mut phone_rx).len(), 1);
        assert_eq!(drain(&mut laptop_rx).len(), 1);
        assert!(drain(&mut other_rx).is_empty());
    }

    #[test]
    fn merge_folds_other_sessions_into_primary() {
        let (carts, _hub) = manager();
        let user = UserId::from("u1");
        let _ = carts.add_item(&sid("a"), item("X", 1, 200)).unwrap();
        let _ = carts.add_item(&sid("b"), item("X", 2, 200)).unwrap();
        let _ = carts.add_item(&sid("b"), item("Y", 1, 50)).unwrap();
        let _ = carts.add_item(&sid("c"), item("Z", 1, 10)).unwrap();
        assert!(carts.link_user(&sid("a"), &user));
        assert!(carts.link_user(&sid("b"), &user));

        let merged = carts.merge_cart_states(&user, &sid("a")).unwrap();
        assert_eq!(merged.find_item("X", None).unwrap().quantity, 3);
        assert_eq!(merged.find_item("Y", None).unwrap().quantity, 1);
        assert_eq!(merged.subtotal, Money::from_cents(650));
        assert_matches!(carts.get_state(&sid("b")), Err(CartError::CartNotFound(_)));
        assert!(carts.get_state(&sid("c")).is_ok());
        assert_eq!(carts.carts_for_user(&user).len(), 1);
    }

    #[test]
    fn folded_session_stays_linked_after_merge() {
        let (carts, hub) = manager();
        let user = UserId::from("u1");
        let (_p, _p_rx) = attach(&hub, "p", Some("u1"));
        let (_q, mut q_rx) = attach(&hub, "q", Some("u1"));
        assert!(!carts.link_user(&sid("p"), &user));
        assert!(!carts.link_user(&sid("q"), &user));

        let _ = carts.add_item(&sid("p"), item("A", 1, 100)).unwrap();
        let merged = carts.merge_cart_states(&user, &sid("q")).unwrap();
        assert_eq!(merged.items.len(), 1);
        let _ = drain(&mut q_rx);

        let state = carts.add_item(&sid("p"), item("B", 1, 100)).unwrap();
        assert_eq!(state.user_id, Some(user.clone()));
        let seen = drain(&mut q_rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].session_id, sid("p"));
    }

    #[test]
    fn merge_that_would_overflow_changes_nothing() {
        let (carts, _hub) = manager();
        let user = UserId::from("u1");
        let _ = carts.add_item(&sid("a"), item("X", MAX_LINE_QUANTITY, 1)).unwrap();
        let _ = carts.add_item(&sid("b"), item("X", 1, 1)).unwrap();
        assert!(carts.link_user(&sid("a"), &user));
        assert!(carts.link_user(&sid("b"), &user));

        assert_matches!(
            carts.merge_cart_states(&user, &sid("a")),
            Err(CartError::InvalidQuantity(_))
        );
        assert!(carts.get_state(&sid("b")).is_ok());
        assert_eq!(carts.carts_for_user(&user).len(), 2);
    }

    #[test]
    fn merge_without_any_cart_is_not_found() {
        let (carts, _hub) = manager();
        assert_matches!(
            carts.merge_cart_states(&UserId::from("u1"), &sid("a")),
            Err(CartError::CartNotFound(_))
        );
    }

    #[test]
    fn sweep_removes_stale_carts_only() {
        let (carts, _hub) = manager();
        let _ = carts.add_item(&sid("s1"), item("A", 1, 100)).unwrap();
        assert_eq!(carts.sweep_stale_at(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::days(2);
        assert_eq!(carts.sweep_stale_at(later), 1);
        assert_eq!(carts.stats().carts, 0);
    }

    #[test]
    fn stats_count_lines_and_units() {
        let (carts, _hub) = manager();
        let _ = carts.add_item(&sid("s1"), item("A", 2, 100)).unwrap();
        let _ = carts.add_item(&sid("s1"), item("B", 3, 100)).unwrap();
        let _ = carts.link_user(&sid("s1"), &UserId::from("u1"));
        let stats = carts.stats();
        assert_eq!(stats.carts, 1);
        assert_eq!(stats.linked_carts, 1);
        assert_eq!(stats.line_items, 2);
        assert_eq!(stats.units, 5);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(u8, u32, i64),
        Update(u8, i64),
        Remove(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u8..4, 1_u32..20, 1_i64..100_000).prop_map(|(p, q, c)| Op::Add(p, q, c)),
            (0_u8..4, any::<u32>(), any::<i64>()).prop_map(|(p, q, c)| Op::Add(p, q, c)),
            (0_u8..4, -3_i64..20).prop_map(|(p, q)| Op::Update(p, q)),
            (0_u8..4).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn totals_stay_consistent(ops in prop::collection::vec(op_strategy(), 1..30)) {
            let (carts, _hub) = manager();
            let session = sid("s1");
            for op in ops {
                let _ = match op {
                    Op::Add(p, q, c) => carts.add_item(&session, item(&format!("p{p}"), q, c)),
                    Op::Update(p, q) => carts.update_quantity(&session, &format!("p{p}"), None, q),
                    Op::Remove(p) => carts.remove_item(&session, &format!("p{p}"), None),
                };
                if let Ok(state) = carts.get_state(&session) {
                    let lines = Money::checked_sum(state.items.iter().map(|i| i.line_total));
                    prop_assert_eq!(Some(state.subtotal), lines);
                    prop_assert_eq!(state.total, state.subtotal + state.tax + state.shipping);
                    for i in &state.items {
                        prop_assert!(i.quantity > 0 && i.quantity <= MAX_LINE_QUANTITY);
                        prop_assert!(i.unit_price >= Money::ZERO);
                        prop_assert_eq!(Some(i.line_total), i.unit_price.checked_mul(i.quantity));
                    }
                }
            }
        }
    }
}
