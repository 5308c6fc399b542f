//! Authority resolution through OpenID Connect discovery.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use super::transport::TokenTransport;
use crate::error::AuthError;

/// Default Azure AD authority host.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Tenant used when none is configured.
pub const COMMON_TENANT: &str = "common";

/// A validated `https://<host>/<tenant>` authority URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthorityUrl {
    host: String,
    tenant: String,
}

impl AuthorityUrl {
    /// Validate an authority URL.
    ///
    /// The scheme must be `https` and the path must be exactly one non-empty
    /// segment naming the tenant (or `common`).
    pub fn parse(authority_url: &str) -> Result<Self, AuthError> {
        let url = Url::parse(authority_url)
            .map_err(|e| AuthError::InvalidUrl(format!("parsing {}: {}", authority_url, e)))?;

        if url.scheme() != "https" {
            return Err(AuthError::InvalidUrl(format!(
                "{} is expected to use HTTPS",
                authority_url
            )));
        }

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(AuthError::InvalidUrl(format!("{} has no host", authority_url)));
            }
        };

        let segments: Vec<&str> = url.path().split('/').collect();
        if segments.len() != 2 || segments[1].is_empty() {
            return Err(AuthError::InvalidUrl(format!(
                r#"{} should have the form "https://<host>/<tenant>""#,
                authority_url
            )));
        }

        Ok(Self {
            host,
            tenant: segments[1].to_string(),
        })
    }

    /// Build the authority URL for a tenant on a host such as `https://login.microsoftonline.com`.
    pub fn for_tenant(authority_host: &str, tenant: &str) -> Result<Self, AuthError> {
        Self::parse(&format!("{}/{}", authority_host.trim_end_matches('/'), tenant))
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// OpenID Connect discovery document location.
    pub fn discovery_endpoint(&self) -> String {
        format!(
            "https://{}/{}/v2.0/.well-known/openid-configuration",
            self.host, self.tenant
        )
    }

    /// Device authorization endpoint; Azure AD does not publish it in discovery.
    pub fn device_endpoint(&self) -> String {
        format!("https://{}/{}/oauth2/v2.0/devicecode", self.host, self.tenant)
    }
}

impl fmt::Display for AuthorityUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "https://{}/{}", self.host, self.tenant)
    }
}

/// Resolved endpoints of an identity provider tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authority {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub device_endpoint: Option<String>,
    pub tenant: String,
}

/// The subset of the discovery document we consume.
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    #[serde(default)]
    authorization_endpoint: String,
    #[serde(default)]
    token_endpoint: String,
}

impl Authority {
    /// Build an authority from known endpoints, without discovery.
    pub fn new(
        authorization_endpoint: impl Into<String>,
        token_endpoint: impl Into<String>,
        device_endpoint: Option<String>,
        tenant: impl Into<String>,
    ) -> Self {
        Self {
            authorization_endpoint: authorization_endpoint.into(),
            token_endpoint: token_endpoint.into(),
            device_endpoint,
            tenant: tenant.into(),
        }
    }

    /// Validate `authority_url` and resolve its endpoints via discovery.
    pub async fn resolve(authority_url: &str, transport: &TokenTransport) -> Result<Self, AuthError> {
        let url = AuthorityUrl::parse(authority_url)?;
        Self::discover(
            &url.discovery_endpoint(),
            url.tenant(),
            Some(url.device_endpoint()),
            transport,
        )
        .await
    }

    /// Fetch a discovery document and build the authority from it.
    pub async fn discover(
        discovery_endpoint: &str,
        tenant: &str,
        device_endpoint: Option<String>,
        transport: &TokenTransport,
    ) -> Result<Self, AuthError> {
        debug!("Fetching discovery document from {}", discovery_endpoint);

        let doc: DiscoveryDocument = transport
            .execute(discovery_endpoint, transport.get(discovery_endpoint))
            .await
            .map_err(|e| match e {
                AuthError::Decode { message, .. } => AuthError::MalformedDiscoveryDoc(message),
                other => AuthError::DiscoveryUnreachable(other.to_string()),
            })?;

        if doc.authorization_endpoint.is_empty() {
            return Err(AuthError::MalformedDiscoveryDoc(
                r#""authorization_endpoint" is empty"#.to_string(),
            ));
        }
        if doc.token_endpoint.is_empty() {
            return Err(AuthError::MalformedDiscoveryDoc(
                r#""token_endpoint" is empty"#.to_string(),
            ));
        }

        info!("Resolved authority for tenant {}", tenant);

        Ok(Self {
            authorization_endpoint: doc.authorization_endpoint,
            token_endpoint: doc.token_endpoint,
            device_endpoint,
            tenant: tenant.to_string(),
        })
    }

    /// Device authorization endpoint, or an error for authorities without one.
    pub fn require_device_endpoint(&self) -> Result<&str, AuthError> {
        self.device_endpoint.as_deref().ok_or_else(|| {
            AuthError::InvalidUrl(format!(
                "authority for tenant {} has no device authorization endpoint",
                self.tenant
            ))
        })
    }
}

/// Resolves each distinct authority URL at most once.
pub struct AuthorityResolver {
    transport: TokenTransport,
    resolved: Mutex<HashMap<String, Arc<Authority>>>,
}

impl AuthorityResolver {
    pub fn new(transport: TokenTransport) -> Self {
        Self {
            transport,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `authority_url`, reusing an earlier result for the same URL.
    ///
    /// The lock is held across discovery so concurrent callers for the same
    /// URL wait for a single fetch.
    pub async fn resolve(&self, authority_url: &str) -> Result<Arc<Authority>, AuthError> {
        let mut resolved = self.resolved.lock().await;
        if let Some(authority) = resolved.get(authority_url) {
            return Ok(Arc::clone(authority));
        }

        let authority = Arc::new(Authority::resolve(authority_url, &self.transport).await?);
        resolved.insert(authority_url.to_string(), Arc::clone(&authority));
        Ok(authority)
    }

    /// Insert an authority that was built without discovery.
    pub async fn insert(&self, authority_url: &str, authority: Authority) -> Arc<Authority> {
        let authority = Arc::new(authority);
        self.resolved
            .lock()
            .await
            .insert(authority_url.to_string(), Arc::clone(&authority));
        authority
    }
}
