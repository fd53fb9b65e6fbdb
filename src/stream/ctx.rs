//! Cancellation-bound wrappers
//!
//! Bind a stream half to the connection's `CancellationToken`: once the
//! token fires, pending and future reads/writes resolve to a cancellation
//! error instead of blocking, so both pumps unwind promptly no matter
//! which side failed first.

use std::future::Future;
use std::io::{Error, ErrorKind, Result};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

const CANCELLED_MSG: &str = "connection cancelled";

/// The error a ctx wrapper resolves to once its token fires.
pub fn cancelled_error() -> Error {
    Error::new(ErrorKind::Interrupted, CANCELLED_MSG)
}

/// Whether an I/O error came from a ctx wrapper rather than the peer.
pub fn is_cancelled_error(err: &Error) -> bool {
    err.kind() == ErrorKind::Interrupted && err.to_string().contains(CANCELLED_MSG)
}

pub struct CtxReader<R> {
    inner: R,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<R> CtxReader<R> {
    pub fn new(inner: R, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            cancelled,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CtxReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let this = self.get_mut();

        if this.token.is_cancelled() {
            return Poll::Ready(Err(cancelled_error()));
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(cancelled_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

pub struct CtxWriter<W> {
    inner: W,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<W> CtxWriter<W> {
    pub fn new(inner: W, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            cancelled,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CtxWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize>> {
        let this = self.get_mut();

        if this.token.is_cancelled() {
            return Poll::Ready(Err(cancelled_error()));
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(cancelled_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(Err(cancelled_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    /// Shutting down the outermost wrapper also cancels the connection.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        this.token.cancel();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
