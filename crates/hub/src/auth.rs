//! Stateless bearer auth: bcrypt-verified logins, HMAC-signed tokens.
//!
//! The identity provider is a seam: production wires the config-seeded
//! static map, tests inject their own.  Tokens are JWTs (HS256) carrying
//! subject, issued-at and expiry; nothing is stored server-side.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::{AuthSettings, UserEntry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    BadCredentials,
    #[error("invalid token")]
    InvalidToken,
    #[error("expired token")]
    ExpiredToken,
}

// ---------------------------------------------------------------------------
// Identity provider
// ---------------------------------------------------------------------------

/// One lookup: username → bcrypt hash.  Password verification stays in the
/// auth service so providers never see plaintext.
pub trait IdentityProvider: Send + Sync {
    fn password_hash(&self, username: &str) -> Option<String>;
}

/// Config-seeded user table.
pub struct StaticUsers {
    users: HashMap<String, String>,
}

impl StaticUsers {
    pub fn new(entries: &[UserEntry]) -> Self {
        Self {
            users: entries
                .iter()
                .map(|u| (u.username.clone(), u.password_hash.clone()))
                .collect(),
        }
    }
}

impl IdentityProvider for StaticUsers {
    fn password_hash(&self, username: &str) -> Option<String> {
        self.users.get(username).cloned()
    }
}

// ---------------------------------------------------------------------------
// Token service
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    #[serde(rename = "type")]
    pub token_type: &'static str,
    pub username: String,
    pub expires_in_ms: u64,
}

#[derive(Clone)]
pub struct AuthService {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Box<dyn IdentityProvider>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_ttl_ms: u64,
}

impl AuthService {
    pub fn new(settings: &AuthSettings, provider: Box<dyn IdentityProvider>) -> Self {
        let secret = settings.secret.as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is exact; the default 60 s leeway would let dead tokens
        // linger past their advertised lifetime.
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub", "iat"]);
        Self {
            inner: Arc::new(Inner {
                provider,
                encoding: EncodingKey::from_secret(secret),
                decoding: DecodingKey::from_secret(secret),
                validation,
                token_ttl_ms: settings.token_ttl_ms,
            }),
        }
    }

    /// Verify the password and mint a bearer token.  Unknown user and bad
    /// password are indistinguishable to the caller.
    pub fn issue(&self, username: &str, password: &str) -> Result<IssuedToken, AuthError> {
        let hash = self
            .inner
            .provider
            .password_hash(username)
            .ok_or(AuthError::BadCredentials)?;
        let verified = bcrypt::verify(password, &hash).map_err(|_| AuthError::BadCredentials)?;
        if !verified {
            return Err(AuthError::BadCredentials);
        }

        let iat = Utc::now().timestamp();
        let exp = iat + (self.inner.token_ttl_ms / 1000) as i64;
        let claims = Claims {
            sub: username.to_string(),
            iat,
            exp,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.inner.encoding)
            .map_err(|_| AuthError::BadCredentials)?;
        Ok(IssuedToken {
            token,
            token_type: "Bearer",
            username: username.to_string(),
            expires_in_ms: self.inner.token_ttl_ms,
        })
    }

    /// Check signature and lifetime; returns the subject.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.inner.decoding, &self.inner.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                _ => AuthError::InvalidToken,
            },
        )?;
        // A token from the future is forged or the issuer clock is broken.
        if data.claims.iat > Utc::now().timestamp() + 5 {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims.sub)
    }
}

/// Pull the token out of an `Authorization: Bearer <t>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ===========================================================================
// Tests
// ===========================================================================
