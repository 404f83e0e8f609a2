//! Connection wrapper that commits to TLS or to a plaintext redirect on first read.
//!
//! The wrapper sits between the raw socket and the TLS acceptor. The first
//! read gathers up to [`PEEK_LEN`] bytes under a deadline and classifies them:
//!
//! - `Tls`: the gathered bytes are replayed, then every read and write passes
//!   straight through. The TLS layer sees exactly the bytes the client sent.
//! - `NotTls`: the redirect is written, the write side is shut down, pending
//!   request bytes are drained for a short linger, and every read reports EOF.
//!   Writes from the layer above (TLS alerts) are swallowed.

use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};
use tracing::debug;

use super::classify::{classify, RecordClass, PEEK_LEN};
use super::{HookConfig, HookStats};

/// How long to keep reading (and discarding) the plaintext request after the
/// redirect has been sent. Closing a socket with unread data resets it, which
/// can destroy the response before the client reads it.
pub const REDIRECT_LINGER: Duration = Duration::from_millis(500);

/// Upper bound on request bytes discarded while lingering.
const MAX_DRAIN_BYTES: usize = 64 * 1024;

/// Progress of the synthetic response on a `NotTls` connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedirectState {
    Writing,
    Flushing,
    Closing,
    Draining,
    Done,
}

/// A stream that answers plaintext clients with a redirect and passes TLS through.
pub struct DualProtocolStream<S> {
    inner: S,
    local_addr: SocketAddr,
    config: Arc<HookConfig>,
    stats: Option<Arc<HookStats>>,

    /// Peek deadline while classifying; linger deadline while draining.
    deadline: Option<Pin<Box<Sleep>>>,
    peek_buf: [u8; PEEK_LEN],
    peek_len: usize,
    replay_pos: usize,
    class: Option<RecordClass>,

    response: Option<Vec<u8>>,
    written: usize,
    drained: usize,
    redirect: RedirectState,
    shut_down: bool,
}

impl<S> DualProtocolStream<S> {
    /// Wrap a freshly accepted stream.
    ///
    /// `local_addr` is the address the client connected to; it becomes the
    /// host of the redirect URL.
    pub fn new(inner: S, local_addr: SocketAddr, config: Arc<HookConfig>) -> Self {
        Self {
            inner,
            local_addr,
            config,
            stats: None,
            deadline: None,
            peek_buf: [0; PEEK_LEN],
            peek_len: 0,
            replay_pos: 0,
            class: None,
            response: None,
            written: 0,
            drained: 0,
            redirect: RedirectState::Writing,
            shut_down: false,
        }
    }

    /// Record classification and redirect outcomes in `stats`.
    pub fn with_stats(mut self, stats: Arc<HookStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// The classification, once the first read has resolved it.
    ///
    /// Never `Indeterminate`: an undecided connection resolves to `NotTls`.
    pub fn classification(&self) -> Option<RecordClass> {
        self.class
    }

    /// Address the client connected to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Give up on a redirect that has not been fully sent.
    ///
    /// Counts the redirect as failed unless it already completed. Later reads
    /// report EOF and writes are swallowed.
    pub fn abandon_redirect(&mut self) {
        if self.class != Some(RecordClass::NotTls) {
            return;
        }
        if matches!(
            self.redirect,
            RedirectState::Writing | RedirectState::Flushing | RedirectState::Closing
        ) {
            self.redirect = RedirectState::Done;
            self.finish_redirect(false);
        }
        self.deadline = None;
    }

    fn resolve(&mut self, class: RecordClass) {
        let resolved = class.resolve();
        debug!(
            local_addr = %self.local_addr,
            peeked = self.peek_len,
            class = ?class,
            "Connection classified"
        );

        if let Some(stats) = &self.stats {
            match class {
                RecordClass::Tls => stats.classified_tls.fetch_add(1, Ordering::Relaxed),
                RecordClass::NotTls => stats.classified_not_tls.fetch_add(1, Ordering::Relaxed),
                RecordClass::Indeterminate => {
                    stats.classified_not_tls.fetch_add(1, Ordering::Relaxed);
                    stats.classify_undecided.fetch_add(1, Ordering::Relaxed)
                }
            };
        }

        self.class = Some(resolved);
        self.deadline = None;
    }

    fn finish_redirect(&mut self, sent: bool) {
        if let Some(stats) = &self.stats {
            if sent {
                stats.redirects_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.redirects_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        // The write side is closed either way.
        self.shut_down = true;
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> DualProtocolStream<S> {
    /// Wait for the classification without handing any bytes out.
    ///
    /// Bounded by the peek timeout. A `Tls` connection still replays the
    /// peeked bytes on the next read.
    pub async fn classified(&mut self) -> io::Result<RecordClass> {
        if self.class.is_none() {
            poll_fn(|cx| self.poll_classify(cx)).await?;
        }
        Ok(self.class.unwrap_or(RecordClass::NotTls))
    }

    /// Send the redirect, close the write side and linger. No-op unless the
    /// connection was classified `NotTls`.
    pub async fn send_redirect(&mut self) {
        if self.class == Some(RecordClass::NotTls) {
            poll_fn(|cx| self.poll_redirect(cx)).await;
        }
    }

    /// Read until the classifier decides, the peer closes, or the deadline fires.
    fn poll_classify(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.deadline.is_none() {
            self.deadline = Some(Box::pin(sleep(self.config.peek_timeout)));
        }

        loop {
            let class = classify(&self.peek_buf[..self.peek_len]);
            if class != RecordClass::Indeterminate {
                self.resolve(class);
                return Poll::Ready(Ok(()));
            }

            let mut read_buf = ReadBuf::new(&mut self.peek_buf[self.peek_len..]);
            match Pin::new(&mut self.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        // Peer closed before we could decide.
                        self.resolve(RecordClass::Indeterminate);
                        return Poll::Ready(Ok(()));
                    }
                    self.peek_len += n;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    let expired = match self.deadline.as_mut() {
                        Some(deadline) => deadline.as_mut().poll(cx).is_ready(),
                        None => false,
                    };
                    if expired {
                        self.resolve(RecordClass::Indeterminate);
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Pending;
                }
            }
        }
    }

    /// Drive the redirect to completion. Failures end the exchange silently.
    fn poll_redirect(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            match self.redirect {
                RedirectState::Writing => {
                    let config = &self.config;
                    let local_addr = self.local_addr;
                    let response = self
                        .response
                        .get_or_insert_with(|| config.redirect.build(local_addr));

                    while self.written < response.len() {
                        match Pin::new(&mut self.inner).poll_write(cx, &response[self.written..]) {
                            Poll::Ready(Ok(0)) => {
                                debug!("Redirect write returned zero bytes");
                                self.redirect = RedirectState::Done;
                                break;
                            }
                            Poll::Ready(Ok(n)) => self.written += n,
                            Poll::Ready(Err(e)) => {
                                debug!(error = %e, "Redirect write failed");
                                self.redirect = RedirectState::Done;
                                break;
                            }
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    if self.redirect == RedirectState::Done {
                        self.finish_redirect(false);
                        return Poll::Ready(());
                    }
                    self.redirect = RedirectState::Flushing;
                }
                RedirectState::Flushing => {
                    if let Err(e) = ready!(Pin::new(&mut self.inner).poll_flush(cx)) {
                        debug!(error = %e, "Redirect flush failed");
                        self.redirect = RedirectState::Done;
                        self.finish_redirect(false);
                        return Poll::Ready(());
                    }
                    self.redirect = RedirectState::Closing;
                }
                RedirectState::Closing => {
                    if let Err(e) = ready!(Pin::new(&mut self.inner).poll_shutdown(cx)) {
                        debug!(error = %e, "Shutdown after redirect failed");
                    }
                    debug!(
                        local_addr = %self.local_addr,
                        bytes = self.written,
                        "Redirect sent"
                    );
                    self.finish_redirect(true);
                    self.deadline = Some(Box::pin(sleep(REDIRECT_LINGER)));
                    self.redirect = RedirectState::Draining;
                }
                RedirectState::Draining => {
                    let mut scratch = [0u8; 1024];
                    loop {
                        if self.drained >= MAX_DRAIN_BYTES {
                            self.redirect = RedirectState::Done;
                            break;
                        }
                        let mut read_buf = ReadBuf::new(&mut scratch);
                        match Pin::new(&mut self.inner).poll_read(cx, &mut read_buf) {
                            Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                                self.redirect = RedirectState::Done;
                                break;
                            }
                            Poll::Ready(Ok(())) => self.drained += read_buf.filled().len(),
                            Poll::Ready(Err(_)) => {
                                self.redirect = RedirectState::Done;
                                break;
                            }
                            Poll::Pending => {
                                let expired = match self.deadline.as_mut() {
                                    Some(deadline) => deadline.as_mut().poll(cx).is_ready(),
                                    None => true,
                                };
                                if !expired {
                                    return Poll::Pending;
                                }
                                self.redirect = RedirectState::Done;
                                break;
                            }
                        }
                    }
                    self.deadline = None;
                }
                RedirectState::Done => return Poll::Ready(()),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for DualProtocolStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match this.class {
                None => ready!(this.poll_classify(cx))?,
                Some(RecordClass::Tls) => {
                    // Replay peeked bytes before touching the socket again
                    if this.replay_pos < this.peek_len {
                        let pending = &this.peek_buf[this.replay_pos..this.peek_len];
                        let n = pending.len().min(buf.remaining());
                        buf.put_slice(&pending[..n]);
                        this.replay_pos += n;
                        return Poll::Ready(Ok(()));
                    }
                    return Pin::new(&mut this.inner).poll_read(cx, buf);
                }
                Some(_) => {
                    ready!(this.poll_redirect(cx));
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for DualProtocolStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.class {
            Some(RecordClass::NotTls) => {
                ready!(this.poll_redirect(cx));
                Poll::Ready(Ok(buf.len()))
            }
            _ => Pin::new(&mut this.inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.class {
            Some(RecordClass::NotTls) => {
                ready!(this.poll_redirect(cx));
                Poll::Ready(Ok(()))
            }
            _ => Pin::new(&mut this.inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.class == Some(RecordClass::NotTls) {
            ready!(this.poll_redirect(cx));
        }
        if this.shut_down {
            return Poll::Ready(Ok(()));
        }
        ready!(Pin::new(&mut this.inner).poll_shutdown(cx))?;
        this.shut_down = true;
        Poll::Ready(Ok(()))
    }
}
