//! Credentials: the long-lived session and the short-lived bearer token.
//!
//! The session credential belongs to an external credential store and is only
//! ever read here. Bearer tokens are derived from it and live in memory.

use crate::api::ApiError;
use crate::error::Result;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;

/// Lifetime assumed for an access token whose `exp` claim cannot be read.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 300;

/// Session cookie pair exchanged for bearer tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub session_id: String,
    pub csrf_token: String,
}

impl SessionCredential {
    pub fn new(session_id: impl Into<String>, csrf_token: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            csrf_token: csrf_token.into(),
        }
    }

    /// `Cookie` header value for the token endpoints.
    pub fn cookie_header(&self) -> String {
        format!("csrftoken={}; sessionid={}", self.csrf_token, self.session_id)
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("session_id", &"<redacted>")
            .field("csrf_token", &"<redacted>")
            .finish()
    }
}

/// A bearer token plus what is needed to renew it.
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub csrf_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Builds a credential, reading expiries from the JWT `exp` claims.
    pub fn from_tokens(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        csrf_token: impl Into<String>,
    ) -> Self {
        let access_token = access_token.into();
        let issued_at = Utc::now();
        let expires_at = decode_jwt_exp(&access_token)
            .unwrap_or_else(|| issued_at + Duration::seconds(DEFAULT_TOKEN_TTL_SECS));
        let refresh_expires_at = refresh_token.as_deref().and_then(decode_jwt_exp);

        Self {
            access_token,
            refresh_token,
            csrf_token: csrf_token.into(),
            issued_at,
            expires_at,
            refresh_expires_at,
        }
    }

    /// True when more than `margin` remains before the access token expires.
    pub fn is_valid_for(&self, margin: std::time::Duration) -> bool {
        let margin = Duration::from_std(margin).unwrap_or_else(|_| Duration::zero());
        Utc::now() + margin < self.expires_at
    }

    /// True when a refresh token is held and outlives `margin`.
    pub fn can_refresh(&self, margin: std::time::Duration) -> bool {
        if self.refresh_token.is_none() {
            return false;
        }
        let margin = Duration::from_std(margin).unwrap_or_else(|_| Duration::zero());
        match self.refresh_expires_at {
            Some(expiry) => Utc::now() + margin < expiry,
            // Refresh token without a readable expiry: let the endpoint decide.
            None => true,
        }
    }

    /// Seconds until the access token expires (zero when already expired).
    pub fn expires_in_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Reads the `exp` claim of a JWT without verifying the signature.
pub fn decode_jwt_exp(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_f64()?;
    Utc.timestamp_opt(exp as i64, 0).single()
}

/// Supplier of long-lived session credentials, one per environment.
///
/// # Security Note
///
/// Implementations must never log the credential values.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns the session credential for `environment`, if one is stored.
    async fn load_session(&self, environment: &str) -> Result<Option<SessionCredential>>;
}

/// Network side of the token lifecycle: exchanges credentials for tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Fetches a fresh token pair using the session credential.
    async fn issue(
        &self,
        environment: &str,
        session: &SessionCredential,
    ) -> std::result::Result<Credential, ApiError>;

    /// Renews the access token with a refresh token.
    async fn refresh(
        &self,
        environment: &str,
        session: &SessionCredential,
        refresh_token: &str,
    ) -> std::result::Result<Credential, ApiError>;
}
