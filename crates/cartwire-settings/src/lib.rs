//! # cartwire-settings
//!
//! Layered configuration for the cartwire server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`CartwireSettings::default()`])
//! 2. **Settings file** (`~/.cartwire/settings.json` or an explicit path,
//!    deep-merged over defaults)
//! 3. **Environment variables** (`CARTWIRE_*` overrides)
//!
//! Each component crate converts its section into its own config struct.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
