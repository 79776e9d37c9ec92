//! Auth error types.

use thiserror::Error;

/// Reasons a credential or session check can fail.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credential could not be parsed or verified.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Credential parsed but its `exp` claim has passed.
    #[error("token expired")]
    TokenExpired,

    /// No session record with this ID.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session exists but was revoked or has expired.
    #[error("session inactive: {0}")]
    SessionInactive(String),
}

impl AuthError {
    /// Stable wire code used in `auth_failed` replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionInactive(_) => "session_inactive",
        }
    }
}

/// Result type for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;
