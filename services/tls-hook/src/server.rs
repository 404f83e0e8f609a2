//! TLS server built on the dual-protocol listener.
//!
//! One accept loop hands every connection to its own task. The task waits for
//! the [`DualProtocolStream`] to classify the connection. Plaintext clients get
//! the redirect and are closed; TLS connections run the rustls handshake and
//! go to a [`ConnectionHandler`].

use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, Instrument};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hook::{DualProtocolListener, DualProtocolStream, HookStats, RecordClass};
use crate::tls;

/// TLS stream handed to handlers.
pub type HookTlsStream = TlsStream<DualProtocolStream<TcpStream>>;

/// Serves a connection once its TLS handshake has completed.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve the connection until it is done.
    async fn handle(&self, stream: HookTlsStream, peer_addr: SocketAddr) -> io::Result<()>;
}

/// Serves an axum [`Router`] over HTTP/1.1 or h2 (chosen by ALPN).
#[derive(Clone)]
pub struct HttpHandler {
    router: Router,
}

impl HttpHandler {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl ConnectionHandler for HttpHandler {
    async fn handle(&self, stream: HookTlsStream, _peer_addr: SocketAddr) -> io::Result<()> {
        let service = TowerToHyperService::new(self.router.clone());
        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(|e| io::Error::other(format!("http error: {}", e)))
    }
}

/// A TLS server whose port also answers plaintext HTTP with a redirect.
pub struct Server<H> {
    listener: DualProtocolListener,
    acceptor: TlsAcceptor,
    handler: Arc<H>,
    handshake_timeout: Duration,
}

impl<H: ConnectionHandler> Server<H> {
    /// Validate the configuration, load certificate material and bind.
    pub async fn bind(config: ServerConfig, handler: H) -> Result<Self, ServerError> {
        config.validate()?;
        let acceptor = tls::build_acceptor(&config.certificate)?;

        let listener = DualProtocolListener::bind(config.listen_addr.as_str(), config.hook.clone())
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;

        Ok(Self {
            listener,
            acceptor,
            handler: Arc::new(handler),
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// Get the local address this server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get server statistics.
    pub fn stats(&self) -> &Arc<HookStats> {
        self.listener.stats()
    }

    /// Run the accept loop until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(future::pending()).await
    }

    /// Run the accept loop until `shutdown` resolves or the listener fails.
    ///
    /// Accept errors are not retried: they end the loop and are returned.
    /// Connections already being served keep running.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.listener.local_addr().map_err(ServerError::Accept)?;
        info!(bind_addr = %local_addr, "Server started");

        let server = &self;
        accept_loop(
            move || server.listener.accept(),
            move |(stream, peer_addr)| server.spawn_connection(stream, peer_addr),
            shutdown,
        )
        .await?;

        let stats = self.stats().snapshot();
        info!(
            connections_accepted = stats.connections_accepted,
            redirects_sent = stats.redirects_sent,
            redirects_failed = stats.redirects_failed,
            handshakes_completed = stats.handshakes_completed,
            handshakes_failed = stats.handshakes_failed,
            "Server stopped"
        );
        Ok(())
    }

    fn spawn_connection(&self, stream: DualProtocolStream<TcpStream>, peer_addr: SocketAddr) {
        let stats = Arc::clone(self.listener.stats());
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let acceptor = self.acceptor.clone();
        let handler = Arc::clone(&self.handler);
        let handshake_timeout = self.handshake_timeout;

        tokio::spawn(
            async move {
                if let Err(e) = serve_connection(
                    &acceptor,
                    handler.as_ref(),
                    stream,
                    peer_addr,
                    handshake_timeout,
                    &stats,
                )
                .await
                {
                    debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }
}

/// Hand each accepted connection to `on_connection` until `shutdown`
/// resolves. The first accept error ends the loop.
async fn accept_loop<A, Fut, T, C, F>(
    mut accept: A,
    mut on_connection: C,
    shutdown: F,
) -> Result<(), ServerError>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
    C: FnMut(T),
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            result = accept() => result,
            _ = &mut shutdown => return Ok(()),
        };

        match accepted {
            Ok(connection) => on_connection(connection),
            Err(e) => {
                error!(error = %e, "Accept error");
                return Err(ServerError::Accept(e));
            }
        }
    }
}

/// Classify, then either redirect or handshake and hand off.
///
/// The peek carries its own deadline; `handshake_timeout` starts once the
/// connection is classified and bounds the redirect or the TLS handshake.
async fn serve_connection<H: ConnectionHandler>(
    acceptor: &TlsAcceptor,
    handler: &H,
    mut stream: DualProtocolStream<TcpStream>,
    peer_addr: SocketAddr,
    handshake_timeout: Duration,
    stats: &HookStats,
) -> io::Result<()> {
    if stream.classified().await? != RecordClass::Tls {
        if timeout(handshake_timeout, stream.send_redirect()).await.is_err() {
            stream.abandon_redirect();
            debug!(local_addr = %stream.local_addr(), "Redirect timed out");
        } else {
            debug!(local_addr = %stream.local_addr(), "Plaintext client redirected");
        }
        return Ok(());
    }

    let tls_stream = match timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        Err(_) => {
            stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            ));
        }
    };

    stats.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    {
        let (_, session) = tls_stream.get_ref();
        debug!(
            alpn = ?session.alpn_protocol().map(String::from_utf8_lossy),
            sni = ?session.server_name(),
            "TLS handshake completed"
        );
    }

    handler.handle(tls_stream, peer_addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accept_error_ends_loop_unchanged() {
        let mut calls = 0;
        let mut served = Vec::new();

        let result = accept_loop(
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Ok(n)
                    } else {
                        Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            "too many open files",
                        ))
                    }
                }
            },
            |n| served.push(n),
            future::pending(),
        )
        .await;

        match result {
            Err(ServerError::Accept(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::PermissionDenied);
                assert_eq!(e.to_string(), "too many open files");
            }
            other => panic!("Expected Accept error, got {:?}", other),
        }
        assert_eq!(served, [1, 2]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let result = accept_loop(
            || future::pending::<io::Result<()>>(),
            |_| panic!("nothing to accept"),
            async {},
        )
        .await;
        assert!(result.is_ok());
    }
}
