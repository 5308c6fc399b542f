//! Device authorization grant (RFC 8628).
//!
//! The client requests a device code, hands the user code to the caller's
//! prompt, then polls the token endpoint until the user has signed in:
//!
//! - `authorization_pending`: wait `interval` and poll again
//! - `slow_down`: add 5 to `interval`, wait, poll again
//! - `expired_token`: request a new device code and start over
//! - anything else (including `access_denied`): fail
//!
//! Polling has no attempt limit; callers bound it with the cancellation token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::authority::Authority;
use super::grant::{cancellable, refresh_with_refresh_token, GrantClient};
use super::scope::Scope;
use super::token::{DeviceAuthorization, Token, TokenError, TokenErrorCode};
use super::transport::{TokenOutcome, TokenTransport};
use crate::error::AuthError;

/// Polling interval when the provider does not specify one, in seconds.
const DEFAULT_POLL_INTERVAL: u64 = 5;

/// Shortest interval honoured, so a provider sending `0` cannot cause a busy loop.
const MIN_POLL_INTERVAL: u64 = 1;

/// Added to the interval on every `slow_down`, in seconds.
const SLOW_DOWN_INCREMENT: u64 = 5;

/// Device code requests after the first one that expired.
pub const MAX_DEVICE_FLOW_RESTARTS: u32 = 3;

const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Presents the device authorization to the user before polling begins.
pub type DevicePrompt = Arc<dyn Fn(&DeviceAuthorization) -> anyhow::Result<()> + Send + Sync>;

/// Print sign-in instructions to stderr.
pub fn default_prompt(auth: &DeviceAuthorization) -> anyhow::Result<()> {
    eprintln!(
        "To sign in, use a web browser to open the page {} and enter the code {} to authenticate (within {} sec).",
        auth.verification_uri, auth.user_code, auth.expires_in
    );
    Ok(())
}

/// What to do after the token endpoint rejected a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollAction {
    /// Sleep for `interval` units and poll again.
    Wait { interval: u64 },
    /// The device code expired; request a new one.
    Restart,
    /// Terminal error.
    Fail,
}

pub(crate) fn next_action(error: &TokenError, interval: u64) -> PollAction {
    match error.code() {
        TokenErrorCode::AuthorizationPending => PollAction::Wait { interval },
        TokenErrorCode::SlowDown => PollAction::Wait {
            interval: interval + SLOW_DOWN_INCREMENT,
        },
        TokenErrorCode::ExpiredToken => PollAction::Restart,
        // access_denied gets no special treatment for now.
        _ => PollAction::Fail,
    }
}

enum Polled {
    Granted(Token),
    Expired,
}

/// Public client signing a user in through the device code flow.
pub struct DeviceFlowClient {
    transport: TokenTransport,
    authority: Arc<Authority>,
    client_id: String,
    scope: Scope,
    prompt: DevicePrompt,
    interval_unit: Duration,
    #[cfg(test)]
    waits: Arc<std::sync::Mutex<Vec<u64>>>,
}

impl DeviceFlowClient {
    pub fn new(
        transport: TokenTransport,
        authority: Arc<Authority>,
        client_id: impl Into<String>,
        scope: Scope,
    ) -> Self {
        Self {
            transport,
            authority,
            client_id: client_id.into(),
            scope,
            prompt: Arc::new(default_prompt),
            interval_unit: Duration::from_secs(1),
            #[cfg(test)]
            waits: Arc::default(),
        }
    }

    /// Replace the console prompt, e.g. to show the code in a UI.
    pub fn with_prompt<F>(mut self, prompt: F) -> Self
    where
        F: Fn(&DeviceAuthorization) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.prompt = Arc::new(prompt);
        self
    }

    /// Length of one interval unit; providers express intervals in seconds.
    pub fn with_interval_unit(mut self, unit: Duration) -> Self {
        self.interval_unit = unit;
        self
    }

    async fn request_device_code(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DeviceAuthorization, AuthError> {
        let endpoint = self.authority.require_device_endpoint()?;
        let scope = self.scope.to_string();
        let form = [("client_id", self.client_id.as_str()), ("scope", scope.as_str())];

        let request = self.transport.post_form(endpoint, &form);
        let auth: DeviceAuthorization =
            cancellable(cancel, self.transport.execute(endpoint, request)).await?;

        info!(
            "Device code issued, expires in {} seconds",
            auth.expires_in
        );
        Ok(auth)
    }

    async fn poll(
        &self,
        cancel: &CancellationToken,
        auth: &DeviceAuthorization,
    ) -> Result<Polled, AuthError> {
        let endpoint = self.authority.token_endpoint.as_str();
        let form = [
            ("grant_type", DEVICE_CODE_GRANT_TYPE),
            ("device_code", auth.device_code.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        let mut interval = match auth.interval {
            Some(interval) if interval < MIN_POLL_INTERVAL => {
                warn!(
                    "Provider sent polling interval {}, using {}",
                    interval, MIN_POLL_INTERVAL
                );
                MIN_POLL_INTERVAL
            }
            Some(interval) => interval,
            None => DEFAULT_POLL_INTERVAL,
        };

        loop {
            let request = self.transport.post_form(endpoint, &form);
            let error = match cancellable(cancel, self.transport.execute_token(endpoint, request))
                .await?
            {
                TokenOutcome::Granted(token) => return Ok(Polled::Granted(token)),
                TokenOutcome::Rejected(error) => error,
            };

            match next_action(&error, interval) {
                PollAction::Wait { interval: next } => {
                    if next != interval {
                        debug!("Provider asked to slow down, polling every {} units", next);
                    }
                    interval = next;
                    debug!("Authorization pending, next poll in {} units", interval);
                    self.wait(cancel, interval).await?;
                }
                PollAction::Restart => return Ok(Polled::Expired),
                PollAction::Fail => return Err(AuthError::Protocol(error)),
            }
        }
    }

    async fn wait(&self, cancel: &CancellationToken, interval: u64) -> Result<(), AuthError> {
        #[cfg(test)]
        self.waits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(interval);

        let units = u32::try_from(interval).unwrap_or(u32::MAX);
        let delay = self.interval_unit.saturating_mul(units);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(AuthError::TimeoutOrCanceled),
        }
    }
}

#[async_trait]
impl GrantClient for DeviceFlowClient {
    async fn obtain_token(&self, cancel: &CancellationToken) -> Result<Token, AuthError> {
        let mut restarts = 0;

        loop {
            let auth = self.request_device_code(cancel).await?;

            (self.prompt)(&auth).map_err(|e| AuthError::Callback(format!("{:#}", e)))?;

            match self.poll(cancel, &auth).await? {
                Polled::Granted(token) => {
                    info!("Obtained token via device flow for {}", self.id());
                    return Ok(token);
                }
                Polled::Expired if restarts < MAX_DEVICE_FLOW_RESTARTS => {
                    restarts += 1;
                    warn!(
                        "Device code expired before sign-in, requesting a new one ({}/{})",
                        restarts, MAX_DEVICE_FLOW_RESTARTS
                    );
                }
                Polled::Expired => {
                    return Err(AuthError::Protocol(TokenError::new("expired_token")));
                }
            }
        }
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
            None,
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
