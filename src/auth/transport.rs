//! HTTP transport for token endpoint requests.
//!
//! Wraps a reqwest client with the client identification headers and a retry
//! middleware for transient failures (connection errors, 5xx, 408, 429). Token
//! protocol errors (HTTP 400) are never retried here; the grant clients decide
//! what to do with them.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use super::token::{Token, TokenError};
use crate::error::AuthError;

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Retries for transient failures.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Identifies this library to the identity provider.
const CLIENT_SKU: &str = "azauth.rust";

/// Tunables for the underlying HTTP client.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: HTTP_TIMEOUT,
            connect_timeout: HTTP_CONNECT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Outcome of an exchange with a token endpoint that reached the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenOutcome {
    /// HTTP 200 with a token body.
    Granted(Token),
    /// HTTP 400 with an OAuth2 error body.
    Rejected(TokenError),
}

/// Token endpoint transport, cheap to clone.
#[derive(Clone)]
pub struct TokenTransport {
    client: ClientWithMiddleware,
}

impl std::fmt::Debug for TokenTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenTransport").finish_non_exhaustive()
    }
}

impl TokenTransport {
    /// Create a transport with the default timeouts and retry policy.
    pub fn new() -> Result<Self, AuthError> {
        Self::with_options(&HttpOptions::default())
    }

    /// Create a transport from explicit HTTP options.
    pub fn with_options(options: &HttpOptions) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .default_headers(default_headers())
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::HttpClient(e.to_string()))?;

        Ok(Self::from_client(client, options.max_retries))
    }

    /// Wrap an existing reqwest client with the transient retry middleware.
    pub fn from_client(client: reqwest::Client, max_retries: u32) -> Self {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(500), Duration::from_secs(10))
            .build_with_max_retries(max_retries);

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { client }
    }

    /// Start a GET request.
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url).header(ACCEPT, "application/json")
    }

    /// Start a form-encoded POST request.
    pub fn post_form(&self, url: &str, form: &[(&str, &str)]) -> RequestBuilder {
        self.client
            .post(url)
            .header(ACCEPT, "application/json")
            .form(form)
    }

    /// Send a request and decode a JSON body; anything but HTTP 200 is an error.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> Result<T, AuthError> {
        let (status, body) = send(endpoint, request).await?;

        if status != reqwest::StatusCode::OK {
            error!("Request to {} failed: HTTP {}", endpoint, status.as_u16());
            return Err(AuthError::UnexpectedStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        decode(endpoint, &body)
    }

    /// Send a token request.
    ///
    /// HTTP 200 yields [`TokenOutcome::Granted`], HTTP 400 yields
    /// [`TokenOutcome::Rejected`]; every other status is an error.
    pub async fn execute_token(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> Result<TokenOutcome, AuthError> {
        let (status, body) = send(endpoint, request).await?;

        match status {
            reqwest::StatusCode::OK => {
                let token: Token = decode(endpoint, &body)?;
                if !token.has_valid_lifetime() {
                    error!("Token from {} has an unusable lifetime", endpoint);
                    return Err(AuthError::Decode {
                        endpoint: endpoint.to_string(),
                        message: format!("expires_in {} is out of range", token.expires_in),
                    });
                }
                Ok(TokenOutcome::Granted(token))
            }
            reqwest::StatusCode::BAD_REQUEST => {
                let token_error: TokenError = decode(endpoint, &body)?;
                debug!("Token endpoint returned {}", token_error.error);
                Ok(TokenOutcome::Rejected(token_error))
            }
            status => {
                error!("Token request to {} failed: HTTP {}", endpoint, status.as_u16());
                Err(AuthError::UnexpectedStatus {
                    endpoint: endpoint.to_string(),
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

async fn send(
    endpoint: &str,
    request: RequestBuilder,
) -> Result<(reqwest::StatusCode, String), AuthError> {
    let response = request.send().await.map_err(|e| AuthError::Transport {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| AuthError::Transport {
        endpoint: endpoint.to_string(),
        message: format!("reading response body: {}", e),
    })?;

    Ok((status, body))
}

fn decode<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<T, AuthError> {
    serde_json::from_str(body).map_err(|e| AuthError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-client-sku"),
        HeaderValue::from_static(CLIENT_SKU),
    );
    headers.insert(
        HeaderName::from_static("x-client-ver"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    headers.insert(
        HeaderName::from_static("x-client-os"),
        HeaderValue::from_static(std::env::consts::OS),
    );
    headers.insert(
        HeaderName::from_static("x-client-cpu"),
        HeaderValue::from_static(std::env::consts::ARCH),
    );
    headers
}
