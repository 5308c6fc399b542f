//! azauth - Azure AD OAuth2 credential core.
//!
//! Obtains and caches access tokens through the client credentials, device
//! code and authorization code grants.

#![deny(clippy::all)]

pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod secure;
pub mod settings;

pub use app::App;
pub use cache::TokenCache;
pub use error::{AppError, AuthError, CacheError};
