//! tls-hook
//!
//! TLS front door for a single port.
//!
//! This service:
//! - Accepts TCP connections on the configured address
//! - Classifies the first bytes of each connection as TLS or not
//! - Serves TLS clients through rustls and an HTTP router
//! - Answers plaintext HTTP clients with a redirect to `https://`

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tls_hook::{CertificateSource, Config, HttpHandler, Server, ServerError};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HOOK_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tls-hook");
    let redirect = &config.server.hook.redirect;
    info!(
        listen_addr = %config.server.listen_addr,
        redirect_path = %redirect.redirect_path,
        status_code = redirect.status(),
        extra_headers = redirect.extra_headers.len(),
        raw_response = redirect.raw_response.is_some(),
        peek_timeout_ms = config.server.hook.peek_timeout.as_millis() as u64,
        "Configuration loaded"
    );
    if let CertificateSource::Pem { cert_path, key_path } = &config.server.certificate {
        info!(cert = %cert_path.display(), key = %key_path.display(), "Loading certificate");
    }

    let router = Router::new()
        .route("/", get(|| async { "tls-hook: connection secured\n" }))
        .route("/healthz", get(|| async { "ok\n" }));

    let server = match Server::bind(config.server.clone(), HttpHandler::new(router)).await {
        Ok(server) => server,
        Err(e) => {
            log_server_error(&e);
            return Err(e.into());
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    server.run_until(shutdown).await?;
    Ok(())
}

fn log_server_error(e: &ServerError) {
    if e.is_listener_failure() {
        error!(error = %e, "Failed to bind listener");
    } else {
        error!(error = %e, "Failed to start server");
    }
}
