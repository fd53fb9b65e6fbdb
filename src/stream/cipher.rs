//! Stream-cipher wrappers
//!
//! Apply an AES-256-CTR keystream to everything that passes through. The
//! keystream position advances with the byte stream, so a wrapper must
//! never be driven from two tasks at once; the proxy gives each direction
//! its own instance.

use std::io::Result;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::AesCtr;

/// Decrypts bytes read from the inner half.
pub struct CipherReader<R> {
    inner: R,
    cipher: AesCtr,
}

impl<R> CipherReader<R> {
    pub fn new(inner: R, cipher: AesCtr) -> Self {
        Self { inner, cipher }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let this = self.get_mut();

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled_mut();
                if filled.len() > before {
                    this.cipher.apply(&mut filled[before..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Encrypts bytes before they reach the inner half.
///
/// A partial inner write leaves ciphertext in `pending`; the keystream has
/// already advanced for those bytes, so they are flushed as-is before any
/// new input is accepted.
pub struct CipherWriter<W> {
    inner: W,
    cipher: AesCtr,
    pending: BytesMut,
}

impl<W> CipherWriter<W> {
    pub fn new(inner: W, cipher: AesCtr) -> Self {
        Self {
            inner,
            cipher,
            pending: BytesMut::new(),
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>>
    where
        W: AsyncWrite + Unpin,
    {
        while !self.pending.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "inner stream refused pending ciphertext",
                    )));
                }
                Poll::Ready(Ok(n)) => {
                    let _ = self.pending.split_to(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CipherWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize>> {
        let this = self.get_mut();

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        if !this.pending.is_empty() {
            return Poll::Pending;
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut encrypted = buf.to_vec();
        this.cipher.apply(&mut encrypted);

        match Pin::new(&mut this.inner).poll_write(cx, &encrypted) {
            Poll::Ready(Ok(n)) => {
                if n < encrypted.len() {
                    this.pending.extend_from_slice(&encrypted[n..]);
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                // Ciphertext is committed to the keystream; park it.
                this.pending.extend_from_slice(&encrypted);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(_) => Pin::new(&mut this.inner).poll_shutdown(cx),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn pair() -> (AesCtr, AesCtr) {
        let key = [0x5au8; 32];
        let iv = [0x17u8; 16];
        (AesCtr::new(&key, &iv), AesCtr::new(&key, &iv))
    }

    #[tokio::test]
    async fn test_cipher_stream_roundtrip() {
        let (client, server) = duplex(4096);
        let (enc, dec) = pair();

        let mut writer = CipherWriter::new(client, enc);
        let mut reader = CipherReader::new(server, dec);

        let original = b"Hello, encrypted world!";
        writer.write_all(original).await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = vec![0u8; original.len()];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, original);
    }

    #[tokio::test]
    async fn test_cipher_stream_wire_is_scrambled() {
        let (client, mut server) = duplex(4096);
        let (enc, _) = pair();

        let mut writer = CipherWriter::new(client, enc);
        writer.write_all(b"plaintext bytes!").await.unwrap();
        writer.flush().await.unwrap();

        let mut wire = vec![0u8; 16];
        server.read_exact(&mut wire).await.unwrap();
        assert_ne!(&wire, b"plaintext bytes!");
    }

    #[tokio::test]
    async fn test_cipher_stream_large_transfer() {
        let (client, server) = duplex(1024);
        let (enc, dec) = pair();

        let mut writer = CipherWriter::new(client, enc);
        let mut reader = CipherReader::new(server, dec);

        let original: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();

        let to_send = original.clone();
        let write_task = tokio::spawn(async move {
            writer.write_all(&to_send).await.unwrap();
            writer.flush().await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        let mut buf = vec![0u8; 2048];
        loop {
            match reader.read(&mut buf).await.unwrap() {
                0 => break,
                n => received.extend_from_slice(&buf[..n]),
            }
        }
        write_task.await.unwrap();

        assert_eq!(received, original);
    }

    #[tokio::test]
    async fn test_cipher_stream_chunked_writes_keep_position() {
        let (client, server) = duplex(4096);
        let (enc, dec) = pair();

        let mut writer = CipherWriter::new(client, enc);
        let mut reader = CipherReader::new(server, dec);

        for chunk in [&b"one"[..], &b"-two-"[..], &b"three!"[..]] {
            writer.write_all(chunk).await.unwrap();
            writer.flush().await.unwrap();
        }

        let mut buf = vec![0u8; 14];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one-two-three!");
    }
}
