//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CartwireSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `CARTWIRE_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::CartwireSettings;

/// Resolve the default settings path (`~/.cartwire/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cartwire").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CartwireSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CartwireSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<CartwireSettings> {
    let defaults = serde_json::to_value(CartwireSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut CartwireSettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid or out-of-range values are ignored with a warning and the
/// file/default value is kept.
pub fn apply_overrides(settings: &mut CartwireSettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("CARTWIRE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_PORT", |s| parse_u16_range(s, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_MAX_CONNECTIONS", |s| {
        parse_usize_range(s, 1, 1_000_000)
    }) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_OUTBOUND_BUFFER", |s| parse_usize_range(s, 1, 65_536)) {
        settings.server.outbound_buffer = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_HEARTBEAT_INTERVAL_MS", |s| {
        parse_u64_range(s, 100, 600_000)
    }) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_HEARTBEAT_TIMEOUT_MS", |s| {
        parse_u64_range(s, 200, 3_600_000)
    }) {
        settings.server.heartbeat_timeout_ms = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_IDLE_TIMEOUT_MS", |s| {
        parse_u64_range(s, 1_000, 86_400_000)
    }) {
        settings.server.idle_timeout_ms = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.parsed("CARTWIRE_SESSION_TIMEOUT_MS", |s| {
        parse_u64_range(s, 1_000, 604_800_000)
    }) {
        settings.auth.session_timeout_ms = v;
    }
    if let Some(v) = env.string("CARTWIRE_JWT_SECRET") {
        settings.auth.jwt_secret = Some(v);
    }

    // ── Queue ───────────────────────────────────────────────────────
    if let Some(v) = env.parsed("CARTWIRE_QUEUE_MAX_RETRIES", |s| parse_u32_range(s, 0, 100)) {
        settings.queue.max_retries = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_QUEUE_MAX_SIZE", |s| {
        parse_usize_range(s, 1, 10_000_000)
    }) {
        settings.queue.max_queue_size = v;
    }

    // ── Cart ────────────────────────────────────────────────────────
    if let Some(v) = env.string("CARTWIRE_CURRENCY") {
        settings.cart.currency = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_TAX_RATE", |s| parse_f64_range(s, 0.0, 1.0)) {
        settings.cart.tax_rate = v;
    }

    // ── Inventory / logging ─────────────────────────────────────────
    if let Some(v) = env.parsed("CARTWIRE_DEDUP_TTL_MS", |s| parse_u64_range(s, 0, 3_600_000)) {
        settings.inventory.dedup_ttl_ms = v;
    }
    if let Some(v) = env.string("CARTWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("CARTWIRE_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a finite `f64` within a range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

// ── Env reader ──────────────────────────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}
