//! TCP listener that hands out dual-protocol streams.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use super::stream::DualProtocolStream;
use super::{HookConfig, HookStats};

/// Wraps a [`TcpListener`]; every accepted socket is wrapped in a
/// [`DualProtocolStream`] sharing one immutable [`HookConfig`].
pub struct DualProtocolListener {
    /// The TCP listener.
    listener: TcpListener,
    /// Shared redirect and classification settings.
    config: Arc<HookConfig>,
    /// Statistics.
    stats: Arc<HookStats>,
}

impl DualProtocolListener {
    /// Bind a new listener.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: HookConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            bind_addr = %listener.local_addr()?,
            peek_timeout_ms = config.peek_timeout.as_millis() as u64,
            "Dual-protocol listener bound"
        );
        Ok(Self::from_tcp(listener, config))
    }

    /// Wrap an already bound listener.
    pub fn from_tcp(listener: TcpListener, config: HookConfig) -> Self {
        Self {
            listener,
            config: Arc::new(config),
            stats: Arc::new(HookStats::default()),
        }
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &Arc<HookStats> {
        &self.stats
    }

    /// Accept the next connection.
    ///
    /// Listener errors are returned unchanged; the caller decides whether the
    /// accept loop continues.
    pub async fn accept(&self) -> io::Result<(DualProtocolStream<TcpStream>, SocketAddr)> {
        let (stream, peer_addr) = self.listener.accept().await?;

        // Fall back to the listener address if the socket cannot tell us
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(_) => self.listener.local_addr()?,
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        debug!(peer_addr = %peer_addr, local_addr = %local_addr, "Connection accepted");

        let stream = DualProtocolStream::new(stream, local_addr, Arc::clone(&self.config))
            .with_stats(Arc::clone(&self.stats));
        Ok((stream, peer_addr))
    }
}
