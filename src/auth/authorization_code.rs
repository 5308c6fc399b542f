//! Authorization code grant with PKCE (RFC 6749 §4.1, RFC 7636).
//!
//! Flow:
//! 1. Generate a random `state` and a PKCE verifier/challenge pair
//! 2. Start the local callback server on the redirect URI
//! 3. Open the authorization URL in the user's browser
//! 4. On the callback, check `state`, take `code` and exchange it for a token
//! 5. Deliver the token to the waiting caller and shut the server down

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use super::authority::Authority;
use super::callback_server::{self, CallbackParams, CallbackServer};
use super::grant::{refresh_with_refresh_token, GrantClient};
use super::scope::Scope;
use super::token::Token;
use super::transport::{TokenOutcome, TokenTransport};
use crate::error::AuthError;
use crate::secure::Secret;

/// Opens the authorization URL for the user.
pub type BrowserOpener = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Open `url` with the system's default browser.
pub fn open_in_browser(url: &str) -> anyhow::Result<()> {
    open::that(url)?;
    Ok(())
}

/// PKCE code verifier and challenge pair.
#[derive(Debug)]
pub struct PkceChallenge {
    /// The code verifier (kept locally, sent in the token exchange).
    pub verifier: String,
    /// The code challenge (SHA256 of the verifier, sent in the auth request).
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let verifier_bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&verifier_bytes);

        // challenge = BASE64URL(SHA256(verifier))
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

/// Random anti-CSRF value correlating the authorization request and its callback.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let state_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&state_bytes)
}

/// Client signing a user in through the browser.
pub struct AuthorizationCodeClient {
    transport: TokenTransport,
    authority: Arc<Authority>,
    client_id: String,
    client_secret: Option<Secret>,
    redirect_uri: String,
    scope: Scope,
    opener: BrowserOpener,
}

impl AuthorizationCodeClient {
    pub fn new(
        transport: TokenTransport,
        authority: Arc<Authority>,
        client_id: impl Into<String>,
        client_secret: Option<Secret>,
        redirect_uri: impl Into<String>,
        scope: Scope,
    ) -> Self {
        Self {
            transport,
            authority,
            client_id: client_id.into(),
            client_secret: client_secret.filter(|s| !s.is_empty()),
            redirect_uri: redirect_uri.into(),
            scope,
            opener: Arc::new(open_in_browser),
        }
    }

    /// Replace how the authorization URL is opened.
    pub fn with_browser_opener<F>(mut self, opener: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.opener = Arc::new(opener);
        self
    }

    /// Build the authorization URL for browser-based sign-in.
    pub fn authorization_url(&self, state: &str, pkce: &PkceChallenge) -> Result<Url, AuthError> {
        let mut url = Url::parse(&self.authority.authorization_endpoint).map_err(|e| {
            AuthError::InvalidUrl(format!(
                "authorization endpoint {}: {}",
                self.authority.authorization_endpoint, e
            ))
        })?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &self.scope.to_string())
            .append_pair("state", state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");

        Ok(url)
    }
}

/// Everything the callback handler needs to redeem the code.
struct CodeExchange {
    transport: TokenTransport,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<Secret>,
    redirect_uri: String,
    scope: String,
    code_verifier: String,
    expected_state: String,
}

impl CodeExchange {
    async fn redeem(self, params: CallbackParams) -> Result<Token, AuthError> {
        let received = params.state.unwrap_or_default();
        if received != self.expected_state {
            error!("State validation failed on authorization callback");
            return Err(AuthError::StateMismatch {
                expected: self.expected_state,
                received,
            });
        }

        if let Some(error) = params.error {
            let description = params.error_description.unwrap_or(error);
            return Err(AuthError::AuthorizationFailed(description));
        }

        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCode)?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("scope", self.scope.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code", code.as_str()),
            ("code_verifier", self.code_verifier.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose()));
        }

        let request = self.transport.post_form(&self.token_endpoint, &form);
        match self
            .transport
            .execute_token(&self.token_endpoint, request)
            .await?
        {
            TokenOutcome::Granted(token) => Ok(token),
            TokenOutcome::Rejected(e) => Err(AuthError::Protocol(e)),
        }
    }
}

#[async_trait]
impl GrantClient for AuthorizationCodeClient {
    async fn obtain_token(&self, cancel: &CancellationToken) -> Result<Token, AuthError> {
        let redirect = Url::parse(&self.redirect_uri).map_err(|e| {
            AuthError::InvalidUrl(format!("redirect URI {}: {}", self.redirect_uri, e))
        })?;

        let state = generate_state();
        let pkce = PkceChallenge::new();
        let auth_url = self.authorization_url(&state, &pkce)?;

        let exchange = CodeExchange {
            transport: self.transport.clone(),
            token_endpoint: self.authority.token_endpoint.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scope: self.scope.to_string(),
            code_verifier: pkce.verifier,
            expected_state: state,
        };

        let listener = callback_server::bind(&redirect).await?;
        let (server, rx) =
            CallbackServer::start(listener, redirect.path(), move |params| exchange.redeem(params));

        info!("Opening browser for sign-in");
        if let Err(e) = (self.opener)(auth_url.as_str()) {
            error!("Failed to open browser: {}", e);
            server.shutdown().await;
            return Err(AuthError::BrowserLaunch(format!("{:#}", e)));
        }

        let outcome = tokio::select! {
            result = rx => result.unwrap_or_else(|_| {
                Err(AuthError::CallbackServer("server stopped before a callback arrived".into()))
            }),
            _ = cancel.cancelled() => Err(AuthError::TimeoutOrCanceled),
        };

        server.shutdown().await;

        if outcome.is_ok() {
            info!("Obtained token via authorization code flow for {}", self.id());
        }
        outcome
    }

    async fn refresh_token(
        &self,
        cancel: &CancellationToken,
        refresh_token: Option<&str>,
    ) -> Result<Token, AuthError> {
        refresh_with_refresh_token(
            &self.transport,
            cancel,
            &self.authority,
            &self.client_id,
            self.client_secret.as_ref(),
            &self.scope,
            refresh_token,
        )
        .await
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn authority(&self) -> &Authority {
        &self.authority
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::transport::HttpOptions;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn client(server: &MockServer, port: u16) -> AuthorizationCodeClient {
        let transport = TokenTransport::with_options(&HttpOptions {
            max_retries: 0,
            ..HttpOptions::default()
        })
        .unwrap();
        let authority = Authority::new(
            format!("{}/t/oauth2/v2.0/authorize", server.uri()),
            format!("{}/t/oauth2/v2.0/token", server.uri()),
            None,
            "t",
        );
        AuthorizationCodeClient::new(
            transport,
            Arc::new(authority),
            "web-app",
            Some(Secret::new("web-secret")),
            format!("http://127.0.0.1:{}/callback", port),
            Scope::new(["offline_access", "Mail.ReadWrite"]),
        )
    }

    /// Simulates the browser: follows the redirect with the given parameters.
    fn redirect_with(
        port: u16,
        query: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> impl Fn(&str) -> anyhow::Result<()> {
        move |auth_url: &str| {
            let url = Url::parse(auth_url)?;
            let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
            let state = pairs.get("state").cloned().unwrap_or_default();
            let callback = format!("http://127.0.0.1:{}/callback?{}", port, query(&state));
            tokio::spawn(async move {
                let _ = reqwest::get(callback).await;
            });
            Ok(())
        }
    }

    fn token_ok() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "user-token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "rt"
        }))
    }

    #[test]
    fn test_pkce_generation() {
        let pkce = PkceChallenge::new();
        // 32 bytes base64url encoded without padding.
        assert_eq!(pkce.verifier.len(), 43);
        assert!(!pkce.challenge.is_empty());
        assert_ne!(pkce.verifier, pkce.challenge);
    }

    #[test]
    fn test_generate_state_is_random() {
        assert_ne!(generate_state(), generate_state());
    }

    #[tokio::test]
    async fn test_authorization_url() {
        let server = MockServer::start().await;
        let c = client(&server, 8400);
        let pkce = PkceChallenge::new();
        let url = c.authorization_url("st4te", &pkce).unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/t/oauth2/v2.0/authorize");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "web-app");
        assert_eq!(pairs["redirect_uri"], "http://127.0.0.1:8400/callback");
        assert_eq!(pairs["scope"], "Mail.ReadWrite offline_access");
        assert_eq!(pairs["state"], "st4te");
        assert_eq!(pairs["code_challenge"], pkce.challenge);
        assert_eq!(pairs["code_challenge_method"], "S256");
    }

    #[tokio::test]
    async fn test_obtain_token_via_callback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/t/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("client_secret=web-secret"))
            .and(body_string_contains("code_verifier="))
            .and(body_string_contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A"))
            .respond_with(token_ok())
            .expect(1)
            .mount(&server)
            .await;

        let port = free_port();
        let c = client(&server, port).with_browser_opener(redirect_with(port, |state| {
            format!("code=the-code&state={}", state)
        }));

        let token = c.obtain_token(&CancellationToken::new()).await.unwrap();
        assert_eq!(token.access_token, "user-token");
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_forged_state_is_rejected_without_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(token_ok())
            .expect(0)
            .mount(&server)
            .await;

        let port = free_port();
        let c = client(&server, port)
            .with_browser_opener(redirect_with(port, |_| "code=the-code&state=forged".into()));

        let err = c.obtain_token(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::StateMismatch { ref received, .. } if received == "forged"
        ));
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_missing_code() {
        let server = MockServer::start().await;
        let port = free_port();
        let c = client(&server, port)
            .with_browser_opener(redirect_with(port, |state| format!("state={}", state)));

        let err = c.obtain_token(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCode));
    }

    #[tokio::test]
    async fn test_provider_error_on_redirect() {
        let server = MockServer::start().await;
        let port = free_port();
        let c = client(&server, port).with_browser_opener(redirect_with(port, |state| {
            format!(
                "error=access_denied&error_description=User%20cancelled&state={}",
                state
            )
        }));

        let err = c.obtain_token(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationFailed(ref d) if d == "User cancelled"));
    }

    #[tokio::test]
    async fn test_cancellation_releases_port() {
        let server = MockServer::start().await;
        let port = free_port();
        let c = client(&server, port).with_browser_opener(|_| Ok(()));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = c.obtain_token(&cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_browser_failure_releases_port() {
        let server = MockServer::start().await;
        let port = free_port();
        let c = client(&server, port)
            .with_browser_opener(|_| Err(anyhow::anyhow!("no browser available")));

        let err = c.obtain_token(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::BrowserLaunch(_)));
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}
