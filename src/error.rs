//! Error types for azauth.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use thiserror::Error;

use crate::auth::token::TokenError;

/// Top-level error type used by the binary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Token cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while resolving authorities and acquiring tokens.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid authority URL: {0}")]
    InvalidUrl(String),

    #[error("Tenant discovery endpoint unreachable: {0}")]
    DiscoveryUnreachable(String),

    #[error("Malformed discovery document: {0}")]
    MalformedDiscoveryDoc(String),

    #[error("At least one scope is required")]
    ScopeRequired,

    #[error("access token response: {0}")]
    Protocol(TokenError),

    #[error("Request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("Unexpected response from {endpoint}: HTTP {status}: {body}")]
    UnexpectedStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("invoking callback: {0}")]
    Callback(String),

    #[error("State mismatch on authorization callback (expected {expected}, received {received})")]
    StateMismatch { expected: String, received: String },

    #[error("Authorization code is missing from the callback")]
    MissingCode,

    #[error("OAuth2 authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Callback server error: {0}")]
    CallbackServer(String),

    #[error("Failed to open browser: {0}")]
    BrowserLaunch(String),

    #[error("Timed out or canceled")]
    TimeoutOrCanceled,

    #[error("No cached token, obtain a token first")]
    NoCachedToken,

    #[error("Token cannot be refreshed: no refresh token available")]
    RefreshTokenMissing,

    #[error("Failed to create HTTP client: {0}")]
    HttpClient(String),
}

impl AuthError {
    /// Returns true if the operation was interrupted by cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::TimeoutOrCanceled)
    }

    /// Returns true if the identity provider answered with an OAuth2 error body.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// The OAuth2 error returned by the provider, if any.
    pub fn token_error(&self) -> Option<&TokenError> {
        match self {
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Token cache persistence errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to access token cache file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize token cache: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Returns a user-friendly message for display on the terminal.
    pub fn user_message(&self) -> &str {
        match self {
            Self::Auth(AuthError::InvalidUrl(_)) => "The authority URL is invalid. Check the configuration.",
            Self::Auth(AuthError::DiscoveryUnreachable(_)) => {
                "Could not reach the identity provider. Check your connection."
            }
            Self::Auth(AuthError::ScopeRequired) => "No scopes configured. Add at least one scope.",
            Self::Auth(AuthError::StateMismatch { .. }) => {
                "Security error. Please try signing in again."
            }
            Self::Auth(AuthError::AuthorizationFailed(_)) => "Sign-in failed. Please try again.",
            Self::Auth(AuthError::TimeoutOrCanceled) => "Sign-in timed out or was cancelled.",
            Self::Auth(AuthError::NoCachedToken) => "No saved session found. Sign in first.",
            Self::Auth(AuthError::Protocol(_)) => "The identity provider rejected the request.",
            Self::Auth(AuthError::Transport { .. }) => "Network error. Check your connection.",
            Self::Cache(_) => "Failed to read or write the token cache.",
            Self::Config(_) => "Configuration error. Please check settings.",
            _ => "An error occurred. Please try again.",
        }
    }

    /// Returns true if the cached session should be discarded.
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            Self::Auth(AuthError::Protocol(_))
                | Self::Auth(AuthError::RefreshTokenMissing)
                | Self::Auth(AuthError::NoCachedToken)
        )
    }
}
