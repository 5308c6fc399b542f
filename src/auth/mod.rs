//! Azure AD authentication module.
//!
//! Authority resolution, the token endpoint transport and the OAuth2 grant
//! clients (client credentials, device code and authorization code with PKCE).

pub mod authority;
pub mod authorization_code;
pub mod callback_server;
pub mod client_credentials;
pub mod device_flow;
pub mod grant;
pub mod scope;
pub mod token;
pub mod transport;

pub use authority::{Authority, AuthorityResolver, AuthorityUrl};
pub use authorization_code::AuthorizationCodeClient;
pub use client_credentials::ClientCredentialClient;
pub use device_flow::DeviceFlowClient;
pub use grant::GrantClient;
pub use scope::Scope;
pub use token::{DeviceAuthorization, Token, TokenError};
pub use transport::{HttpOptions, TokenTransport};
