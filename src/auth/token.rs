//! OAuth2 token endpoint wire types.
//!
//! Successful responses follow RFC 6749 §5.1, error responses §5.2 with the
//! device flow extension codes of RFC 8628 §3.5.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access token issued by the token endpoint.
///
/// `expires_in` is only RECOMMENDED by the RFC, but Azure AD always returns it,
/// so a response without it is rejected at decode time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Absolute expiry, computed locally once the token has been received.
    /// Never read from or written to the token endpoint body.
    #[serde(skip)]
    expires_on: Option<DateTime<Utc>>,
}

impl Token {
    /// Build a token as if it had just been decoded from the wire.
    pub fn new(access_token: impl Into<String>, token_type: impl Into<String>, expires_in: i64) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            expires_in,
            refresh_token: None,
            scope: None,
            expires_on: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Stamp the absolute expiry from the time the token was issued.
    ///
    /// Replaces any earlier expiry. A lifetime too large to represent
    /// saturates at the latest representable instant.
    pub fn issued_at(self, issued_at: DateTime<Utc>) -> Self {
        let expires_on = expiry_from(issued_at, self.expires_in.max(0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            expires_on: Some(expires_on),
            ..self
        }
    }

    /// Restore an expiry that was stamped earlier, e.g. from a cache file.
    pub(crate) fn with_expires_on(mut self, expires_on: Option<DateTime<Utc>>) -> Self {
        self.expires_on = expires_on;
        self
    }

    /// Whether `expires_in` is a usable lifetime: not negative and
    /// representable from now on.
    pub fn has_valid_lifetime(&self) -> bool {
        expiry_from(Utc::now(), self.expires_in).is_some()
    }

    /// When the access token stops being valid, if known.
    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.expires_on
    }

    /// Remaining lifetime at `now`; `None` when the expiry was never stamped.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_on.map(|exp| exp - now)
    }

    /// Value for an `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

fn expiry_from(issued_at: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    if expires_in < 0 {
        return None;
    }
    Duration::try_seconds(expires_in).and_then(|lifetime| issued_at.checked_add_signed(lifetime))
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Known `error` codes of a token error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    AuthorizationPending,
    SlowDown,
    AccessDenied,
    ExpiredToken,
    Other,
}

impl TokenErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "invalid_request" => Self::InvalidRequest,
            "invalid_client" => Self::InvalidClient,
            "invalid_grant" => Self::InvalidGrant,
            "unauthorized_client" => Self::UnauthorizedClient,
            "unsupported_grant_type" => Self::UnsupportedGrantType,
            "invalid_scope" => Self::InvalidScope,
            "authorization_pending" => Self::AuthorizationPending,
            "slow_down" => Self::SlowDown,
            "access_denied" => Self::AccessDenied,
            "expired_token" => Self::ExpiredToken,
            _ => Self::Other,
        }
    }
}

/// Error body returned by the token endpoint with HTTP 400.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_uri: Option<String>,
}

impl TokenError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: None,
            error_uri: None,
        }
    }

    pub fn code(&self) -> TokenErrorCode {
        TokenErrorCode::parse(&self.error)
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)?;
        if let Some(description) = &self.error_description {
            write!(f, ": {}", description)?;
        }
        if let Some(uri) = &self.error_uri {
            write!(f, " (uri: {})", uri)?;
        }
        Ok(())
    }
}

/// Device authorization response (RFC 8628 §3.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}
