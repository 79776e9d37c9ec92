//! Session authentication manager.
//!
//! Validates bearer credentials into [`AuthResult`]s and tracks
//! [`Session`] records independently of the credential's own expiry. All
//! state sits behind one `RwLock`; callers only ever see clones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cartwire_core::{AuthLevel, SessionId, UserId};
use cartwire_settings::AuthSettings;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::claims::{ClaimsDecoder, Hs256ClaimsDecoder, UnverifiedClaimsDecoder};
use crate::errors::{AuthError, Result};
use crate::session::{AuthResult, Session, default_permissions};

/// Session manager tuning.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Sliding lifetime added on every authorized activity.
    pub session_timeout: Duration,
    /// Expiry sweep interval.
    pub sweep_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::from(&AuthSettings::default())
    }
}

impl From<&AuthSettings> for AuthConfig {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            session_timeout: settings.session_timeout(),
            sweep_interval: settings.sweep_interval(),
        }
    }
}

/// Read-only counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStats {
    /// Records held, including inactive ones.
    pub total_sessions: usize,
    /// Active records.
    pub active_sessions: usize,
    /// Active records at `authenticated` level.
    pub authenticated: usize,
    /// Active records at `admin` level.
    pub admins: usize,
}

/// Validates credentials and tracks sessions.
pub struct SessionAuthManager {
    config: AuthConfig,
    decoder: Arc<dyn ClaimsDecoder>,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionAuthManager {
    /// Create a manager that decodes claims without verifying signatures.
    pub fn new(config: AuthConfig) -> Self {
        Self::with_decoder(config, Arc::new(UnverifiedClaimsDecoder))
    }

    /// Create a manager with a specific claims decoder.
    pub fn with_decoder(config: AuthConfig, decoder: Arc<dyn ClaimsDecoder>) -> Self {
        Self {
            config,
            decoder,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a manager from settings, verifying HS256 signatures when a
    /// secret is configured.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        let config = AuthConfig::from(settings);
        match settings.jwt_secret.as_deref() {
            Some(secret) => {
                Self::with_decoder(config, Arc::new(Hs256ClaimsDecoder::new(secret.as_bytes())))
            }
            None => {
                warn!("no JWT secret configured, credential signatures are not verified");
                Self::new(config)
            }
        }
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.session_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }

    // ── Credentials ─────────────────────────────────────────────────

    /// Validate a bearer credential.
    ///
    /// An empty credential is a valid anonymous result. Malformed,
    /// unverifiable or expired credentials produce `valid: false` with the
    /// reason in `error`.
    pub fn authenticate_token(&self, token: &str) -> AuthResult {
        let token = token.trim();
        if token.is_empty() {
            return AuthResult::anonymous();
        }

        let claims = match self.decoder.decode(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(error = %e, "credential rejected");
                return AuthResult::invalid(e);
            }
        };

        let expires_at = match claims.exp {
            Some(exp) => match Utc.timestamp_opt(exp, 0).single() {
                Some(at) => Some(at),
                None => {
                    return AuthResult::invalid(AuthError::InvalidToken(
                        "exp claim out of range".into(),
                    ));
                }
            },
            None => None,
        };
        if expires_at.is_some_and(|at| at <= Utc::now()) {
            return AuthResult::invalid(AuthError::TokenExpired);
        }

        let Some(user_id) = claims.user_id.clone().filter(|u| !u.is_empty()) else {
            return AuthResult::invalid(AuthError::InvalidToken("missing user_id claim".into()));
        };

        let auth_level = if claims.is_admin() {
            AuthLevel::Admin
        } else {
            AuthLevel::Authenticated
        };
        let permissions = if claims.permissions.is_empty() {
            default_permissions(auth_level)
        } else {
            claims.permissions
        };

        AuthResult {
            valid: true,
            user_id: Some(UserId::from(user_id)),
            session_id: claims.session_id.map(SessionId::from),
            auth_level,
            permissions,
            expires_at,
            error: None,
        }
    }

    // ── Session records ─────────────────────────────────────────────

    /// Create or overwrite the record for `session_id`.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn create_session(
        &self,
        user_id: Option<UserId>,
        session_id: SessionId,
        auth_level: AuthLevel,
        permissions: Vec<String>,
    ) -> Session {
        let session = Session::new(
            session_id.clone(),
            user_id,
            auth_level,
            permissions,
            Utc::now(),
            self.timeout(),
        );
        let replaced = self
            .sessions
            .write()
            .insert(session_id, session.clone())
            .is_some();
        info!(auth_level = %auth_level, replaced, "session created");
        session
    }

    /// Snapshot of one record.
    pub fn get_session(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    /// The record for `session_id` if it is active and unexpired.
    pub fn validate_session(&self, session_id: &SessionId) -> Result<Session> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AuthError::SessionNotFound(session_id.to_string()))?;
        if session.is_valid_at(Utc::now()) {
            Ok(session.clone())
        } else {
            Err(AuthError::SessionInactive(session_id.to_string()))
        }
    }

    /// Refresh activity on a valid session. Returns whether it was valid.
    pub fn touch(&self, session_id: &SessionId) -> bool {
        self.check(session_id, |_| true)
    }

    /// Whether the session holds `permission`.
    ///
    /// Unknown, revoked and expired sessions hold nothing. A successful
    /// check refreshes the session's expiry.
    pub fn check_permission(&self, session_id: &SessionId, permission: &str) -> bool {
        self.check(session_id, |s| s.has_permission(permission))
    }

    /// Whether the session's level is at least `min_level`.
    ///
    /// Every caller satisfies `Anonymous`.
    pub fn check_auth_level(&self, session_id: &SessionId, min_level: AuthLevel) -> bool {
        if min_level == AuthLevel::Anonymous {
            let _ = self.touch(session_id);
            return true;
        }
        self.check(session_id, |s| s.auth_level() >= min_level)
    }

    fn check(&self, session_id: &SessionId, predicate: impl FnOnce(&Session) -> bool) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        if !session.is_valid_at(now) || !predicate(session) {
            return false;
        }
        session.touch(now, self.timeout());
        true
    }

    /// Mark one session inactive. Returns whether it was active.
    pub fn revoke_session(&self, session_id: &SessionId) -> bool {
        let revoked = self
            .sessions
            .write()
            .get_mut(session_id)
            .is_some_and(Session::deactivate);
        if revoked {
            info!(session_id = %session_id, "session revoked");
        }
        revoked
    }

    /// Mark every session of `user_id` inactive. Returns how many were active.
    pub fn revoke_all_for_user(&self, user_id: &UserId) -> usize {
        let mut count = 0;
        for session in self.sessions.write().values_mut() {
            if session.user_id() == Some(user_id) && session.deactivate() {
                count += 1;
            }
        }
        info!(user_id = %user_id, count, "user sessions revoked");
        count
    }

    /// Snapshots of every record owned by `user_id`.
    pub fn sessions_for_user(&self, user_id: &UserId) -> Vec<Session> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.user_id() == Some(user_id))
            .cloned()
            .collect()
    }

    /// Deactivate sessions expired at `now`. Returns how many were swept.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        for session in self.sessions.write().values_mut() {
            if session.expires_at() <= now && session.deactivate() {
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(swept, "expired sessions deactivated");
        }
        swept
    }

    /// Deactivate sessions expired now.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// Current counters.
    pub fn stats(&self) -> AuthStats {
        let sessions = self.sessions.read();
        let mut stats = AuthStats {
            total_sessions: sessions.len(),
            ..AuthStats::default()
        };
        for s in sessions.values().filter(|s| s.is_active()) {
            stats.active_sessions += 1;
            match s.auth_level() {
                AuthLevel::Admin => stats.admins += 1,
                AuthLevel::Authenticated => stats.authenticated += 1,
                AuthLevel::Anonymous => {}
            }
        }
        stats
    }

    /// Spawn the expiry sweep. It stops when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = manager.sweep_expired();
                    }
                    () = cancel.cancelled() => break,
                }
            }
            debug!("session sweep stopped");
        })
    }
}
