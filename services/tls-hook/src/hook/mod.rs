//! Dual-protocol front door for a TLS port.
//!
//! This module provides:
//! - Classification of the first bytes of a connection (TLS record header or not)
//! - A stream wrapper that replays peeked bytes to the TLS layer
//! - A synthetic `https://` redirect for plaintext HTTP clients
//! - A listener that hands out wrapped streams
//!
//! ## Architecture
//!
//! ```text
//! Client -> DualProtocolListener -> DualProtocolStream -> TlsAcceptor -> handler
//!                                          |
//!                                  not TLS: redirect + close
//! ```

mod classify;
mod listener;
mod response;
mod stream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ConfigError;

pub use classify::{classify, RecordClass, DEFAULT_PEEK_TIMEOUT, PEEK_LEN};
pub use listener::DualProtocolListener;
pub use response::{
    RedirectConfig, DEFAULT_BODY_TEMPLATE, DEFAULT_REDIRECT_PATH, DEFAULT_STATUS, URL_PLACEHOLDER,
};
pub use stream::{DualProtocolStream, REDIRECT_LINGER};

/// Configuration shared by every connection of a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    /// Maximum time to wait for the leading bytes of a connection.
    pub peek_timeout: Duration,
    /// Response sent to plaintext clients.
    pub redirect: RedirectConfig,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            redirect: RedirectConfig::default(),
        }
    }
}

impl HookConfig {
    /// Check the configuration before serving starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peek_timeout.is_zero() {
            return Err(ConfigError::ZeroPeekTimeout);
        }
        self.redirect.validate()
    }
}

/// Statistics for a dual-protocol listener.
#[derive(Debug, Default)]
pub struct HookStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections finished.
    pub connections_closed: AtomicU64,
    /// Connections whose first bytes were a TLS record header.
    pub classified_tls: AtomicU64,
    /// Connections answered as plaintext (including undecided ones).
    pub classified_not_tls: AtomicU64,
    /// Connections that timed out or closed before enough bytes arrived.
    pub classify_undecided: AtomicU64,
    /// Redirects fully written.
    pub redirects_sent: AtomicU64,
    /// Redirects abandoned because the client went away.
    pub redirects_failed: AtomicU64,
    /// TLS handshakes completed.
    pub handshakes_completed: AtomicU64,
    /// TLS handshakes that failed on a TLS-classified connection.
    pub handshakes_failed: AtomicU64,
}

impl HookStats {
    /// Plain-value copy of the counters, for logging.
    pub fn snapshot(&self) -> HookStatsSnapshot {
        HookStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            classified_tls: self.classified_tls.load(Ordering::Relaxed),
            classified_not_tls: self.classified_not_tls.load(Ordering::Relaxed),
            classify_undecided: self.classify_undecided.load(Ordering::Relaxed),
            redirects_sent: self.redirects_sent.load(Ordering::Relaxed),
            redirects_failed: self.redirects_failed.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`HookStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub classified_tls: u64,
    pub classified_not_tls: u64,
    pub classify_undecided: u64,
    pub redirects_sent: u64,
    pub redirects_failed: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
}
