//! Server configuration.
//!
//! [`ServerConfig`] is built once at startup and shared read-only by every
//! connection. [`Config`] loads it from environment variables for the binary.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::error::ConfigError;
use crate::hook::{HookConfig, RedirectConfig, DEFAULT_PEEK_TIMEOUT, DEFAULT_REDIRECT_PATH};
use crate::tls::CertificateSource;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8443";

/// Default bound on a TLS handshake after classification.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable settings for one TLS port.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (host:port).
    pub listen_addr: String,
    /// Certificate and key material.
    pub certificate: CertificateSource,
    /// Classification and redirect settings.
    pub hook: HookConfig,
    /// Maximum duration of a TLS handshake.
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    /// Create a configuration with default hook settings.
    pub fn new(listen_addr: impl Into<String>, certificate: CertificateSource) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            certificate,
            hook: HookConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Check the configuration before serving starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hook.validate()
    }
}

/// Binary configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Settings for the TLS port.
    pub server: ServerConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr =
            lookup("HOOK_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

        let cert_file = lookup("HOOK_CERT_FILE").context("Missing certificate. Set HOOK_CERT_FILE.")?;
        let key_file = lookup("HOOK_KEY_FILE").context("Missing private key. Set HOOK_KEY_FILE.")?;

        let redirect_path =
            lookup("HOOK_REDIRECT_PATH").unwrap_or_else(|| DEFAULT_REDIRECT_PATH.to_string());

        let body_template = lookup("HOOK_RESPONSE_BODY").unwrap_or_default();

        let raw_response = lookup("HOOK_RAW_RESPONSE").filter(|v| !v.is_empty());

        let status_code: u16 = lookup("HOOK_STATUS_CODE")
            .map(|v| v.parse())
            .transpose()
            .context("HOOK_STATUS_CODE must be an integer.")?
            .unwrap_or(0);

        let extra_headers = match lookup("HOOK_EXTRA_HEADERS") {
            Some(raw) => parse_extra_headers(&raw)
                .context("HOOK_EXTRA_HEADERS must be a JSON object of string values.")?,
            None => Vec::new(),
        };

        let peek_timeout_ms: u64 = lookup("HOOK_PEEK_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("HOOK_PEEK_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_PEEK_TIMEOUT.as_millis() as u64);
        let peek_timeout = Duration::from_millis(peek_timeout_ms.max(1));

        let handshake_timeout_ms: u64 = lookup("HOOK_HANDSHAKE_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("HOOK_HANDSHAKE_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64);
        let handshake_timeout = Duration::from_millis(handshake_timeout_ms.max(1));

        let log_level = lookup("HOOK_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let server = ServerConfig {
            listen_addr,
            certificate: CertificateSource::pem(cert_file, key_file),
            hook: HookConfig {
                peek_timeout,
                redirect: RedirectConfig {
                    redirect_path,
                    body_template,
                    status_code,
                    extra_headers,
                    raw_response,
                },
            },
            handshake_timeout,
        };
        server.validate().context("Invalid redirect configuration.")?;

        Ok(Self { server, log_level })
    }
}

/// Parse `{"Name": "value", ...}`, keeping the written order.
fn parse_extra_headers(raw: &str) -> Result<Vec<(String, String)>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let Some(map) = value.as_object() else {
        bail!("expected a JSON object");
    };

    map.iter()
        .map(|(name, value)| match value {
            serde_json::Value::String(s) => Ok((name.clone(), s.clone())),
            other => bail!("header {} has non-string value {}", name, other),
        })
        .collect()
}
