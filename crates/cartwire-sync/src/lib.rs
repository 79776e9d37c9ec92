//! # cartwire-sync
//!
//! Stateful producers on top of the hub and queue.
//!
//! - [`cart`]: per-session carts with totals, multi-device broadcast and
//!   merge on login
//! - [`inventory`]: stock updates and threshold alerts with deduplication
//! - [`notifications`]: user notifications filtered by preferences

#![deny(unsafe_code)]

pub mod cart;
pub mod errors;
pub mod inventory;
pub mod notifications;

pub use cart::{CartConfig, CartManager, CartStats, MAX_LINE_QUANTITY, recompute};
pub use errors::{CartError, Result};
pub use inventory::{
    InventoryConfig, InventoryManager, InventoryStats, ProductRef, StockMovement, alert_priority,
    alert_severity,
};
pub use notifications::{
    NotificationConfig, NotificationManager, NotificationPreferences, NotificationStats,
    QuietHours,
};
