//! Token orchestrator.
//!
//! Couples one grant client with the token cache: fresh tokens are stamped
//! with their absolute expiry and cached, and cached tokens are handed out
//! until they come within the refresh threshold of expiring.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::authority::AuthorityResolver;
use crate::auth::authorization_code::AuthorizationCodeClient;
use crate::auth::client_credentials::ClientCredentialClient;
use crate::auth::device_flow::DeviceFlowClient;
use crate::auth::grant::GrantClient;
use crate::auth::token::Token;
use crate::auth::transport::TokenTransport;
use crate::cache::TokenCache;
use crate::config::{Config, Flow};
use crate::error::{AppError, AuthError};

/// Tokens expiring within this window are refreshed rather than reused.
const DEFAULT_REFRESH_THRESHOLD_SECONDS: i64 = 300;

pub struct App {
    client: Arc<dyn GrantClient>,
    cache: Arc<TokenCache>,
    refresh_threshold: Duration,
}

impl App {
    pub fn new(client: Arc<dyn GrantClient>, cache: Arc<TokenCache>) -> Self {
        Self {
            client,
            cache,
            refresh_threshold: Duration::seconds(DEFAULT_REFRESH_THRESHOLD_SECONDS),
        }
    }

    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    /// Build the grant client selected by `config` and wrap it.
    pub async fn from_config(config: &Config, cache: Arc<TokenCache>) -> Result<Self, AppError> {
        let transport = TokenTransport::with_options(&config.http_options())?;
        let resolver = AuthorityResolver::new(transport.clone());
        let threshold = config
            .refresh_threshold()
            .map_err(|e| AppError::Config(format!("{:#}", e)))?;
        let client = grant_client_from_config(config, transport, &resolver).await?;
        Ok(Self::new(client, cache).with_refresh_threshold(threshold))
    }

    pub fn client(&self) -> &dyn GrantClient {
        self.client.as_ref()
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    /// The cached token for this client, if any.
    pub fn cached_token(&self) -> Option<Token> {
        self.cache.get(
            self.client.client_id(),
            self.client.authority(),
            self.client.scope(),
        )
    }

    /// Acquire a fresh token through the grant client and cache it.
    pub async fn obtain_token(&self, cancel: &CancellationToken) -> Result<Token, AuthError> {
        let token = self
            .client
            .obtain_token(cancel)
            .await?
            .issued_at(Utc::now());
        self.store(token.clone());
        Ok(token)
    }

    /// Return the cached token, refreshing it when it is about to expire.
    ///
    /// Requires an earlier [`obtain_token`](Self::obtain_token) (or an imported
    /// cache entry); otherwise fails with [`AuthError::NoCachedToken`] without
    /// touching the network.
    pub async fn obtain_token_silently(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Token, AuthError> {
        let cached = self.cached_token().ok_or(AuthError::NoCachedToken)?;

        let fresh = cached
            .remaining(Utc::now())
            .is_some_and(|remaining| remaining > self.refresh_threshold);
        if fresh {
            debug!("Using cached token for {}", self.client.id());
            return Ok(cached);
        }

        info!("Cached token for {} is expiring, refreshing", self.client.id());
        let token = self
            .client
            .refresh_token(cancel, cached.refresh_token.as_deref())
            .await?
            .issued_at(Utc::now());
        self.store(token.clone());
        Ok(token)
    }

    fn store(&self, token: Token) {
        self.cache.insert(
            self.client.client_id(),
            self.client.authority(),
            self.client.scope(),
            token,
        );
    }
}

/// Resolve the configured authority and build the grant client for the configured flow.
pub async fn grant_client_from_config(
    config: &Config,
    transport: TokenTransport,
    resolver: &AuthorityResolver,
) -> Result<Arc<dyn GrantClient>, AppError> {
    let authority_url = config
        .authority_url()
        .map_err(|e| AppError::Config(format!("{:#}", e)))?;
    let authority = resolver.resolve(&authority_url.to_string()).await?;
    let client_id = config.oauth.client_id.clone();
    let scope = config.scope();

    let client: Arc<dyn GrantClient> = match config.oauth.flow {
        Flow::ClientCredentials => {
            let secret = config.client_secret().cloned().ok_or_else(|| {
                AppError::Config("client credentials flow requires a client secret".into())
            })?;
            Arc::new(ClientCredentialClient::new(
                transport, authority, client_id, secret, scope,
            ))
        }
        Flow::DeviceCode => Arc::new(DeviceFlowClient::new(transport, authority, client_id, scope)),
        Flow::AuthorizationCode => Arc::new(AuthorizationCodeClient::new(
            transport,
            authority,
            client_id,
            config.client_secret().cloned(),
            config.oauth.redirect_uri.clone(),
            scope,
        )),
    };

    info!("Using {:?} flow for {}", config.oauth.flow, client.id());
    Ok(client)
}
