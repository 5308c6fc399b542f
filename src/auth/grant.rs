//! The capability shared by every grant flow.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::authority::Authority;
use super::scope::Scope;
use super::token::Token;
use super::transport::{TokenOutcome, TokenTransport};
use crate::error::AuthError;
use crate::secure::Secret;

/// A client able to obtain tokens through one OAuth2 grant type.
///
/// Each implementation owns its client id, credentials, authority and scope
/// for its whole lifetime.
#[async_trait]
pub trait GrantClient: Send + Sync {
    /// Acquire a fresh token.
    ///
    /// Interactive flows block until the user acts, the provider gives up,
    /// or `cancel` fires.
    async fn obtain_token(&self, cancel: &CancellationToken) -> Result<Token, AuthError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_token(
        &self,
        cancel: &CancellationToken,
        refresh_token: Option<&str>,
    ) -> Result<Token, AuthError>;

    fn client_id(&self) -> &str;

    fn authority(&self) -> &Authority;

    fn scope(&self) -> &Scope;

    /// Identifier used in logs: `<client_id> @ <token_endpoint> (<scope>)`.
    fn id(&self) -> String {
        client_identifier(self.client_id(), &self.authority().token_endpoint, self.scope())
    }
}

pub fn client_identifier(client_id: &str, token_endpoint: &str, scope: &Scope) -> String {
    format!("{} @ {} ({})", client_id, token_endpoint, scope)
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, AuthError>>,
) -> Result<T, AuthError> {
    tokio::select! {
        result = fut => result,
        _ = cancel.cancelled() => Err(AuthError::TimeoutOrCanceled),
    }
}

/// The refresh-token grant (RFC 6749 §6) used by the interactive flows.
///
/// When the provider does not rotate the refresh token, the one that was
/// presented is carried over to the new token.
pub(crate) async fn refresh_with_refresh_token(
    transport: &TokenTransport,
    cancel: &CancellationToken,
    authority: &Authority,
    client_id: &str,
    client_secret: Option<&Secret>,
    scope: &Scope,
    refresh_token: Option<&str>,
) -> Result<Token, AuthError> {
    let refresh_token = refresh_token
        .filter(|rt| !rt.is_empty())
        .ok_or(AuthError::RefreshTokenMissing)?;
    let scope = scope.to_string();

    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("client_id", client_id),
        ("refresh_token", refresh_token),
        ("scope", scope.as_str()),
    ];
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret.expose()));
    }

    let endpoint = authority.token_endpoint.as_str();
    let request = transport.post_form(endpoint, &form);
    let outcome = cancellable(cancel, transport.execute_token(endpoint, request)).await?;

    match outcome {
        TokenOutcome::Granted(mut token) => {
            if token.refresh_token.is_none() {
                token.refresh_token = Some(refresh_token.to_string());
            }
            info!("Token refreshed for client {}", client_id);
            Ok(token)
        }
        TokenOutcome::Rejected(e) => Err(AuthError::Protocol(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::transport::HttpOptions;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> TokenTransport {
        TokenTransport::with_options(&HttpOptions {
            max_retries: 0,
            ..HttpOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn test_client_identifier() {
        let scope = Scope::new(["user.read", "offline_access"]);
        assert_eq!(
            client_identifier("abc", "https://idp/token", &scope),
            "abc @ https://idp/token (offline_access user.read)"
        );
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .and(body_string_contains("client_secret=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let authority = Authority::new(
            format!("{}/authorize", server.uri()),
            format!("{}/token", server.uri()),
            None,
            "t",
        );
        let secret = Secret::new("s3cret");
        let token = refresh_with_refresh_token(
            &transport(),
            &CancellationToken::new(),
            &authority,
            "client",
            Some(&secret),
            &Scope::new(["user.read"]),
            Some("rt-1"),
        )
        .await
        .unwrap();

        assert_eq!(token.access_token, "new");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails_without_request() {
        let authority = Authority::new("https://idp/authorize", "https://idp/token", None, "t");
        let err = refresh_with_refresh_token(
            &transport(),
            &CancellationToken::new(),
            &authority,
            "client",
            None,
            &Scope::new(["user.read"]),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::RefreshTokenMissing));
    }

    #[tokio::test]
    async fn test_cancellable_returns_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), AuthError> =
            cancellable(&cancel, std::future::pending::<Result<(), AuthError>>()).await;
        assert!(matches!(result, Err(AuthError::TimeoutOrCanceled)));
    }
}
