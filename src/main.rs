//! azauth - obtain an Azure AD access token and print it to stdout.

#![deny(clippy::all)]

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use azauth::config::Config;
use azauth::{App, AppError, TokenCache};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        // .env file is optional - only warn if it exists but can't be read
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            eprintln!("\nPlease set the following environment variables:");
            eprintln!("  AZURE_CLIENT_ID=<your-azure-ad-client-id>");
            eprintln!("  AZURE_TENANT_ID=<your-tenant-id>");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging.level);
    info!("Starting {} v{}", config.app.name, env!("CARGO_PKG_VERSION"));

    match run(&config).await {
        Ok(token) => {
            println!("{}", token);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing/logging on stderr so stdout only carries the token.
fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(config: &Config) -> Result<String, AppError> {
    let cache = Arc::new(TokenCache::new());
    let mut cache_path = config.cache_path();
    if let Some(path) = &cache_path {
        if let Err(e) = cache.import_or_set_aside(path) {
            // Exporting now would replace entries we could not read.
            warn!(
                "Cannot read token cache {}, it will be left untouched: {}",
                path.display(),
                e
            );
            cache_path = None;
        }
    }

    let app = App::from_config(config, Arc::clone(&cache)).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            ctrl_c.cancel();
        }
    });

    let token = match app.obtain_token_silently(&cancel).await {
        Ok(token) => token,
        Err(e) => {
            let e = AppError::from(e);
            if !e.requires_sign_in() {
                return Err(e);
            }
            info!("Silent acquisition unavailable ({}), signing in", e);
            app.obtain_token(&cancel).await?
        }
    };

    if let Some(path) = &cache_path {
        cache.export(path)?;
    }

    Ok(token.access_token.clone())
}
