//! Settings sections.
//!
//! Every section is `camelCase` on disk and fully defaulted, so a settings
//! file only needs the keys it changes. Durations are stored as
//! milliseconds and exposed as [`Duration`] through accessor methods.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CartwireSettings {
    /// Network listener and connection lifecycle.
    pub server: ServerSettings,
    /// Credential decoding and session expiry.
    pub auth: AuthSettings,
    /// Reliable delivery queue.
    pub queue: QueueSettings,
    /// Cart pricing and janitor.
    pub cart: CartSettings,
    /// Inventory dedup window.
    pub inventory: InventorySettings,
    /// Notification expiry.
    pub notifications: NotificationSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CartwireSettings {
    /// Reject combinations that would make the server misbehave.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.heartbeat_timeout_ms <= server.heartbeat_interval_ms {
            return Err(SettingsError::invalid(
                "server.heartbeatTimeoutMs",
                format!(
                    "{} must exceed heartbeatIntervalMs ({})",
                    server.heartbeat_timeout_ms, server.heartbeat_interval_ms
                ),
            ));
        }
        if server.outbound_buffer == 0 {
            return Err(SettingsError::invalid("server.outboundBuffer", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.cart.tax_rate) {
            return Err(SettingsError::invalid(
                "cart.taxRate",
                format!("{} is outside 0..=1", self.cart.tax_rate),
            ));
        }
        if self.queue.retry_base_delay_ms > self.queue.retry_max_delay_ms {
            return Err(SettingsError::invalid(
                "queue.retryBaseDelayMs",
                "must not exceed retryMaxDelayMs",
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// Listener and per-connection lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Capacity of each connection's outbound channel.
    pub outbound_buffer: usize,
    /// Interval between server pings.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is considered dead.
    pub heartbeat_timeout_ms: u64,
    /// Upper bound on a single socket write.
    pub write_timeout_ms: u64,
    /// Inactivity after which the idle sweep closes a connection.
    pub idle_timeout_ms: u64,
    /// Interval of the idle sweep.
    pub cleanup_interval_ms: u64,
    /// Largest inbound text message handled. Larger messages get a
    /// `message_too_large` reply; beyond four times this the socket is
    /// dropped.
    pub max_message_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10_000,
            outbound_buffer: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            write_timeout_ms: 10_000,
            idle_timeout_ms: 600_000,
            cleanup_interval_ms: 60_000,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl ServerSettings {
    /// Ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Dead-peer timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Write deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Idle-sweep threshold.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Idle-sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────────

/// Session and credential settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Sliding session lifetime.
    pub session_timeout_ms: u64,
    /// Interval of the expiry sweep.
    pub sweep_interval_ms: u64,
    /// Shared HS256 secret. When unset, claims are decoded without
    /// verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            session_timeout_ms: 1_800_000,
            sweep_interval_ms: 60_000,
            jwt_secret: None,
        }
    }
}

impl AuthSettings {
    /// Session lifetime.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

/// Reliable queue settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Delivery tick.
    pub tick_interval_ms: u64,
    /// Retry-pool sweep interval.
    pub retry_sweep_interval_ms: u64,
    /// Default retry budget for entries that do not set one.
    pub max_retries: u32,
    /// Cool-down after the first failure.
    pub retry_base_delay_ms: u64,
    /// Upper bound on the cool-down.
    pub retry_max_delay_ms: u64,
    /// How long a delivered entry waits for its ack.
    pub ack_timeout_ms: u64,
    /// Main-queue capacity; the lowest-priority tail is evicted beyond it.
    pub max_queue_size: usize,
    /// Entries attempted per tick.
    pub batch_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            retry_sweep_interval_ms: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            ack_timeout_ms: 30_000,
            max_queue_size: 10_000,
            batch_size: 64,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cart
// ─────────────────────────────────────────────────────────────────────────────

/// Cart pricing settings. Amounts are in cents.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CartSettings {
    /// ISO 4217 code for new carts.
    pub currency: String,
    /// Tax rate applied to the subtotal.
    pub tax_rate: f64,
    /// Subtotal at or above which shipping is free.
    pub free_shipping_threshold_cents: i64,
    /// Flat shipping fee below the threshold.
    pub shipping_fee_cents: i64,
    /// Carts untouched for this long are removed by the janitor.
    pub stale_ttl_ms: u64,
    /// Janitor interval.
    pub sweep_interval_ms: u64,
}

impl Default for CartSettings {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            tax_rate: 0.085,
            free_shipping_threshold_cents: 5_000,
            shipping_fee_cents: 599,
            stale_ttl_ms: 86_400_000,
            sweep_interval_ms: 300_000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inventory / notifications / logging
// ─────────────────────────────────────────────────────────────────────────────

/// Inventory broadcast settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventorySettings {
    /// Window in which a repeated event is suppressed.
    pub dedup_ttl_ms: u64,
    /// Dedup-cache janitor interval.
    pub sweep_interval_ms: u64,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            dedup_ttl_ms: 5_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// Notification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    /// Expiry applied to notifications sent without one.
    pub default_ttl_ms: u64,
    /// Expiry sweep interval.
    pub sweep_interval_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: 7 * 86_400_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
