//! Server-side session records and auth results.

use std::collections::BTreeSet;

use cartwire_core::{AuthLevel, SessionId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::errors::AuthError;

/// Well-known permission names.
pub mod permissions {
    /// Read the session's cart.
    pub const CART_READ: &str = "cart:read";
    /// Mutate the session's cart.
    pub const CART_WRITE: &str = "cart:write";
    /// Send chat messages.
    pub const CHAT_WRITE: &str = "chat:write";
    /// Read and acknowledge notifications.
    pub const NOTIFICATIONS_READ: &str = "notifications:read";
    /// Read order history.
    pub const ORDERS_READ: &str = "orders:read";
    /// Receive inventory alerts and operate admin tooling.
    pub const INVENTORY_ADMIN: &str = "inventory:admin";
}

/// Permissions granted at `level` when the credential lists none.
pub fn default_permissions(level: AuthLevel) -> Vec<String> {
    use permissions::{
        CART_READ, CART_WRITE, CHAT_WRITE, INVENTORY_ADMIN, NOTIFICATIONS_READ, ORDERS_READ,
    };
    let names: &[&str] = match level {
        AuthLevel::Anonymous => &[CART_READ, CART_WRITE],
        AuthLevel::Authenticated => &[
            CART_READ,
            CART_WRITE,
            CHAT_WRITE,
            NOTIFICATIONS_READ,
            ORDERS_READ,
        ],
        AuthLevel::Admin => &[
            CART_READ,
            CART_WRITE,
            CHAT_WRITE,
            NOTIFICATIONS_READ,
            ORDERS_READ,
            INVENTORY_ADMIN,
        ],
    };
    names.iter().map(|p| (*p).to_string()).collect()
}

/// A tracked login. Returned by value; the manager owns the original.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Session {
    session_id: SessionId,
    user_id: Option<UserId>,
    auth_level: AuthLevel,
    permissions: BTreeSet<String>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    active: bool,
}

impl Session {
    pub(crate) fn new(
        session_id: SessionId,
        user_id: Option<UserId>,
        auth_level: AuthLevel,
        permissions: impl IntoIterator<Item = String>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            user_id,
            auth_level,
            permissions: permissions.into_iter().collect(),
            created_at: now,
            last_activity: now,
            expires_at: now + timeout,
            active: true,
        }
    }

    /// Session ID.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Owning user, if authenticated.
    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Granted level.
    pub fn auth_level(&self) -> AuthLevel {
        self.auth_level
    }

    /// Granted permissions, sorted.
    pub fn permissions(&self) -> impl Iterator<Item = &str> {
        self.permissions.iter().map(String::as_str)
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last authorized activity.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Current expiry.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the session has not been revoked or swept.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Active and not yet expired at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.active && now < self.expires_at
    }

    /// Whether the session holds `permission`. Admins hold every permission.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.auth_level == AuthLevel::Admin || self.permissions.contains(permission)
    }

    /// Record activity. `expires_at` only ever moves forward.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>, timeout: Duration) {
        self.last_activity = now;
        self.expires_at = self.expires_at.max(now + timeout);
    }

    pub(crate) fn deactivate(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }
}

/// Outcome of [`authenticate_token`](crate::SessionAuthManager::authenticate_token).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthResult {
    /// Whether the credential was accepted.
    pub valid: bool,
    /// Subject, for non-anonymous results.
    pub user_id: Option<UserId>,
    /// Session named by the credential.
    pub session_id: Option<SessionId>,
    /// Granted level.
    pub auth_level: AuthLevel,
    /// Granted permissions.
    pub permissions: Vec<String>,
    /// Credential expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Why the credential was rejected.
    pub error: Option<AuthError>,
}

impl AuthResult {
    /// A valid anonymous result.
    pub fn anonymous() -> Self {
        Self {
            valid: true,
            user_id: None,
            session_id: None,
            auth_level: AuthLevel::Anonymous,
            permissions: default_permissions(AuthLevel::Anonymous),
            expires_at: None,
            error: None,
        }
    }

    /// A rejected credential.
    pub fn invalid(error: AuthError) -> Self {
        Self {
            valid: false,
            user_id: None,
            session_id: None,
            auth_level: AuthLevel::Anonymous,
            permissions: Vec::new(),
            expires_at: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(level: AuthLevel, perms: &[&str]) -> Session {
        Session::new(
            SessionId::from("s1"),
            Some(UserId::from("u1")),
            level,
            perms.iter().map(|p| (*p).to_string()),
            Utc::now(),
            Duration::minutes(30),
        )
    }

    #[test]
    fn touch_never_moves_expiry_backwards() {
        let mut s = session(AuthLevel::Authenticated, &[]);
        let before = s.expires_at();
        s.touch(Utc::now(), Duration::seconds(1));
        assert_eq!(s.expires_at(), before);
        let later = Utc::now() + Duration::hours(1);
        s.touch(later, Duration::minutes(30));
        assert_eq!(s.expires_at(), later + Duration::minutes(30));
        assert_eq!(s.last_activity(), later);
    }

    #[test]
    fn admin_holds_every_permission() {
        let s = session(AuthLevel::Admin, &[]);
        assert!(s.has_permission("anything:at_all"));
    }

    #[test]
    fn authenticated_needs_explicit_grant() {
        let s = session(AuthLevel::Authenticated, &[permissions::CART_WRITE]);
        assert!(s.has_permission(permissions::CART_WRITE));
        assert!(!s.has_permission(permissions::CHAT_WRITE));
    }

    #[test]
    fn deactivated_session_is_invalid() {
        let mut s = session(AuthLevel::Authenticated, &[]);
        assert!(s.is_valid_at(Utc::now()));
        assert!(s.deactivate());
        assert!(!s.deactivate());
        assert!(!s.is_valid_at(Utc::now()));
    }

    #[test]
    fn default_permissions_grow_with_level() {
        let anon = default_permissions(AuthLevel::Anonymous);
        let user = default_permissions(AuthLevel::Authenticated);
        let admin = default_permissions(AuthLevel::Admin);
        assert!(anon.iter().all(|p| user.contains(p)));
        assert!(user.iter().all(|p| admin.contains(p)));
        assert!(!anon.contains(&permissions::CHAT_WRITE.to_string()));
    }
}
