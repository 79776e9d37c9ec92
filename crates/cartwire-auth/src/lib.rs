//! # cartwire-auth
//!
//! Turns bearer credentials into auth results and tracks server-side
//! sessions with sliding expiry, soft revocation and permission checks.
//!
//! - [`claims`]: pluggable [`ClaimsDecoder`] (unverified or HS256)
//! - [`session`]: [`Session`] records and [`AuthResult`]
//! - [`manager`]: the [`SessionAuthManager`]

#![deny(unsafe_code)]

pub mod claims;
pub mod errors;
pub mod manager;
pub mod session;

pub use claims::{Claims, ClaimsDecoder, Hs256ClaimsDecoder, UnverifiedClaimsDecoder};
pub use errors::{AuthError, Result};
pub use manager::{AuthConfig, AuthStats, SessionAuthManager};
pub use session::{AuthResult, Session, default_permissions, permissions};
