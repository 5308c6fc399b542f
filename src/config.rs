//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml with environment variable overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::authority::{AuthorityUrl, COMMON_TENANT, DEFAULT_AUTHORITY_HOST};
use crate::auth::scope::Scope;
use crate::auth::transport::HttpOptions;
use crate::secure::Secret;
use crate::settings;

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Placeholder shipped in config.toml.
const PLACEHOLDER_CLIENT_ID: &str = "YOUR_AZURE_AD_CLIENT_ID";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
}

/// Grant flow used to obtain tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    ClientCredentials,
    DeviceCode,
    AuthorizationCode,
}

impl FromStr for Flow {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client_credentials" => Ok(Self::ClientCredentials),
            "device_code" => Ok(Self::DeviceCode),
            "authorization_code" => Ok(Self::AuthorizationCode),
            other => anyhow::bail!(
                "Unknown flow '{}', expected client_credentials, device_code or authorization_code",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub flow: Flow,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<Secret>,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let defaults = HttpOptions::default();
        Self {
            timeout_seconds: defaults.timeout.as_secs(),
            connect_timeout_seconds: defaults.connect_timeout.as_secs(),
            max_retries: defaults.max_retries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub refresh_before_expiry_seconds: u64,
    pub cache_path: Option<PathBuf>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_before_expiry_seconds: 300,
            cache_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

fn default_authority_host() -> String {
    DEFAULT_AUTHORITY_HOST.to_string()
}

fn default_tenant() -> String {
    COMMON_TENANT.to_string()
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_toml_str(CONFIG_TOML)
            .context("Failed to parse embedded config.toml")?;

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration document without overrides or validation.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(client_id) = lookup("AZURE_CLIENT_ID") {
            self.oauth.client_id = client_id;
        }

        if let Some(tenant) = lookup("AZURE_TENANT_ID") {
            self.oauth.tenant = tenant;
        }

        if let Some(secret) = lookup("AZURE_CLIENT_SECRET") {
            self.oauth.client_secret = Some(Secret::new(secret));
        }

        if let Some(redirect_uri) = lookup("AZURE_REDIRECT_URI") {
            self.oauth.redirect_uri = redirect_uri;
        }

        if let Some(host) = lookup("AZURE_AUTHORITY_HOST") {
            self.oauth.authority_host = host;
        }

        if let Some(flow) = lookup("AZAUTH_FLOW") {
            self.oauth.flow = flow.parse()?;
        }

        if let Some(path) = lookup("AZAUTH_TOKEN_CACHE_PATH") {
            self.token.cache_path = Some(PathBuf::from(path));
        }

        if let Some(log_level) = lookup("RUST_LOG") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.oauth.client_id.is_empty() || self.oauth.client_id == PLACEHOLDER_CLIENT_ID {
            anyhow::bail!(
                "Azure AD client_id not configured. Set AZURE_CLIENT_ID environment variable \
                 or update config.toml"
            );
        }

        if self.oauth.tenant.is_empty() {
            anyhow::bail!(
                "Azure AD tenant not configured. Set AZURE_TENANT_ID environment variable \
                 or update config.toml"
            );
        }

        if self.oauth.scopes.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("No scopes configured. Add at least one scope to config.toml");
        }

        match self.oauth.flow {
            Flow::ClientCredentials => {
                if self.client_secret().is_none() {
                    anyhow::bail!(
                        "The client credentials flow requires a client secret. Set \
                         AZURE_CLIENT_SECRET environment variable"
                    );
                }
            }
            Flow::AuthorizationCode => {
                url::Url::parse(&self.oauth.redirect_uri).with_context(|| {
                    format!("Invalid redirect_uri '{}'", self.oauth.redirect_uri)
                })?;
            }
            Flow::DeviceCode => {}
        }

        self.authority_url()?;
        self.refresh_threshold()?;
        Ok(())
    }

    /// Validated `https://<host>/<tenant>` authority URL.
    pub fn authority_url(&self) -> Result<AuthorityUrl> {
        AuthorityUrl::for_tenant(&self.oauth.authority_host, &self.oauth.tenant)
            .context("Invalid authority_host or tenant")
    }

    pub fn scope(&self) -> Scope {
        self.oauth
            .scopes
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// The client secret, if a non-empty one is configured.
    pub fn client_secret(&self) -> Option<&Secret> {
        self.oauth.client_secret.as_ref().filter(|s| !s.is_empty())
    }

    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            timeout: Duration::from_secs(self.http.timeout_seconds),
            connect_timeout: Duration::from_secs(self.http.connect_timeout_seconds),
            max_retries: self.http.max_retries,
        }
    }

    /// Silent refresh threshold; errors when the configured value does not fit a duration.
    pub fn refresh_threshold(&self) -> Result<chrono::Duration> {
        let seconds = self.token.refresh_before_expiry_seconds;
        i64::try_from(seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .with_context(|| format!("refresh_before_expiry_seconds {} is out of range", seconds))
    }

    /// Token cache file; falls back to the platform data directory.
    pub fn cache_path(&self) -> Option<PathBuf> {
        self.token
            .cache_path
            .clone()
            .or_else(settings::default_cache_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
        [app]
        name = "azauth"
        version = "0.1.0"

        [oauth]
        flow = "device_code"
        client_id = "11111111-2222-3333-4444-555555555555"
        scopes = ["User.Read", "offline_access"]
    "#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_parsing() {
        // Fails validation because of placeholder values, but parsing should work
        let result = Config::from_toml_str(CONFIG_TOML);
        assert!(result.is_ok(), "Config parsing failed: {:?}", result.err());
        assert!(result.unwrap().validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.oauth.authority_host, "https://login.microsoftonline.com");
        assert_eq!(config.oauth.tenant, "common");
        assert_eq!(config.token.refresh_before_expiry_seconds, 300);
        assert_eq!(config.http.max_retries, 3);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
        assert_eq!(config.scope().to_string(), "User.Read offline_access");
        assert_eq!(
            config.authority_url().unwrap().discovery_endpoint(),
            "https://login.microsoftonline.com/common/v2.0/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config
            .apply_overrides(env(&[
                ("AZURE_TENANT_ID", "contoso"),
                ("AZURE_CLIENT_SECRET", "s3cret"),
                ("AZAUTH_FLOW", "client_credentials"),
                ("AZAUTH_TOKEN_CACHE_PATH", "/tmp/tokens.json"),
            ]))
            .unwrap();

        assert_eq!(config.oauth.tenant, "contoso");
        assert_eq!(config.oauth.flow, Flow::ClientCredentials);
        assert_eq!(config.client_secret().map(|s| s.expose()), Some("s3cret"));
        assert_eq!(config.cache_path(), Some(PathBuf::from("/tmp/tokens.json")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_flow_override() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        assert!(config.apply_overrides(env(&[("AZAUTH_FLOW", "implicit")])).is_err());
    }

    #[test]
    fn test_client_credentials_requires_secret() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config
            .apply_overrides(env(&[("AZAUTH_FLOW", "client_credentials")]))
            .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client secret"));
    }

    #[test]
    fn test_empty_scopes_rejected() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.oauth.scopes = vec!["  ".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_authority_host_rejected() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config
            .apply_overrides(env(&[("AZURE_AUTHORITY_HOST", "http://login.example.com")]))
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_options() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.http.timeout_seconds = 5;
        config.http.max_retries = 0;
        let options = config.http_options();
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.max_retries, 0);
        assert_eq!(config.refresh_threshold().unwrap(), chrono::Duration::seconds(300));
    }

    #[test]
    fn test_refresh_threshold_out_of_range() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.token.refresh_before_expiry_seconds = u64::MAX;
        assert!(config.refresh_threshold().is_err());
        assert!(config.validate().is_err());

        config.token.refresh_before_expiry_seconds = i64::MAX as u64;
        assert!(config.refresh_threshold().is_err());
    }
}
