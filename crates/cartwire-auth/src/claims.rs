//! Claims extraction from three-segment bearer credentials.
//!
//! [`UnverifiedClaimsDecoder`] only splits the credential and decodes the
//! middle segment; signature checking is left to whatever issued or
//! fronts the credential. [`Hs256ClaimsDecoder`] verifies a shared-secret
//! signature with `jsonwebtoken` before returning the claims.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::{AuthError, Result};

/// Claims carried by a credential.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject. `sub` is accepted as an alias.
    #[serde(default, alias = "sub", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// `admin` elevates the auth level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Session the credential was issued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Expiry as seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Explicit permission grants.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Claims {
    /// Whether the `role` claim is `admin`.
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }
}

/// Turns a bearer credential into [`Claims`].
pub trait ClaimsDecoder: Send + Sync {
    /// Decode `token`. Expiry is checked by the caller.
    fn decode(&self, token: &str) -> Result<Claims>;
}

/// Splits `header.claims.signature` and base64url-decodes the claims.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnverifiedClaimsDecoder;

impl ClaimsDecoder for UnverifiedClaimsDecoder {
    fn decode(&self, token: &str) -> Result<Claims> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthError::InvalidToken(format!(
                "expected 3 segments, found {}",
                parts.len()
            )));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(parts[1].trim_end_matches('='))
            .map_err(|e| AuthError::InvalidToken(format!("claims segment: {e}")))?;

        serde_json::from_slice(&payload)
            .map_err(|e| AuthError::InvalidToken(format!("claims JSON: {e}")))
    }
}

/// Verifies an HS256 signature against a shared secret.
pub struct Hs256ClaimsDecoder {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256ClaimsDecoder {
    /// Build a decoder for `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl std::fmt::Debug for Hs256ClaimsDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hs256ClaimsDecoder").finish_non_exhaustive()
    }
}

impl ClaimsDecoder for Hs256ClaimsDecoder {
    fn decode(&self, token: &str) -> Result<Claims> {
        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    fn unsigned_token(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{body}.sig")
    }

    #[test]
    fn unverified_decodes_claims() {
        let token = unsigned_token(&json!({
            "user_id": "u1",
            "role": "admin",
            "session_id": "s1",
            "exp": 4_102_444_800_i64,
            "permissions": ["cart:write"],
        }));
        let claims = UnverifiedClaimsDecoder.decode(&token).unwrap();
        assert_eq!(claims.user_id.as_deref(), Some("u1"));
        assert!(claims.is_admin());
        assert_eq!(claims.session_id.as_deref(), Some("s1"));
        assert_eq!(claims.permissions, vec!["cart:write".to_string()]);
    }

    #[test]
    fn unverified_accepts_sub_alias() {
        let token = unsigned_token(&json!({"sub": "u9"}));
        let claims = UnverifiedClaimsDecoder.decode(&token).unwrap();
        assert_eq!(claims.user_id.as_deref(), Some("u9"));
        assert!(claims.permissions.is_empty());
    }

    #[test]
    fn unverified_rejects_wrong_segment_count() {
        let err = UnverifiedClaimsDecoder.decode("a.b").unwrap_err();
        assert_matches!(err, AuthError::InvalidToken(m) if m.contains("3 segments"));
    }

    #[test]
    fn unverified_rejects_bad_base64() {
        let err = UnverifiedClaimsDecoder.decode("a.!!!.c").unwrap_err();
        assert_matches!(err, AuthError::InvalidToken(_));
    }

    #[test]
    fn unverified_rejects_non_json_claims() {
        let token = format!("h.{}.s", URL_SAFE_NO_PAD.encode("not json"));
        assert_matches!(
            UnverifiedClaimsDecoder.decode(&token),
            Err(AuthError::InvalidToken(_))
        );
    }

    #[test]
    fn hs256_verifies_signature() {
        let claims = Claims {
            user_id: Some("u1".into()),
            ..Claims::default()
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let decoded = Hs256ClaimsDecoder::new(b"secret").decode(&token).unwrap();
        assert_eq!(decoded, claims);

        let err = Hs256ClaimsDecoder::new(b"other").decode(&token).unwrap_err();
        assert_matches!(err, AuthError::InvalidToken(_));
    }

    #[test]
    fn hs256_maps_expiry() {
        let claims = Claims {
            user_id: Some("u1".into()),
            exp: Some(1_000),
            ..Claims::default()
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert_matches!(
            Hs256ClaimsDecoder::new(b"secret").decode(&token),
            Err(AuthError::TokenExpired)
        );
    }
}
