//! Traffic-accounting wrappers

use std::io::Result;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::stats::Stats;

/// Counts bytes read from the inner half as incoming traffic.
pub struct TrafficReader<R> {
    inner: R,
    stats: Arc<Stats>,
}

impl<R> TrafficReader<R> {
    pub fn new(inner: R, stats: Arc<Stats>) -> Self {
        Self { inner, stats }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TrafficReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let this = self.get_mut();

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.stats.add_incoming_traffic(n as u64);
            }
        }
        result
    }
}

/// Counts bytes accepted by the inner half as outgoing traffic.
pub struct TrafficWriter<W> {
    inner: W,
    stats: Arc<Stats>,
}

impl<W> TrafficWriter<W> {
    pub fn new(inner: W, stats: Arc<Stats>) -> Self {
        Self { inner, stats }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TrafficWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize>> {
        let this = self.get_mut();

        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                this.stats.add_outgoing_traffic(n as u64);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
