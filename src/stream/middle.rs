//! Middle-proxy framed stream
//!
//! The upstream channel to a middle proxy is AES-256-CBC over CRC-framed
//! RPC messages. These wrappers keep that entirely below the pump: the
//! writer cuts the plaintext client stream into MTProto messages and ships
//! each one as an RPC_PROXY_REQ; the reader decrypts, dispatches answers,
//! simple acks, pings and closes, and hands up bytes already framed for
//! the client's transport. Quick-ack and simple-ack observations land in
//! the shared `ConnectionOpts` hack flags.

use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::crypto::{AesCbc, SecureRandom};
use crate::error::ProxyError;
use crate::protocol::constants::*;
use crate::protocol::frame::{decode_message, encode_message, encode_simple_ack};
use crate::protocol::ConnectionOpts;
use crate::telegram::rpc;

/// Channel-level payloads (pongs) queued by the reader for the writer.
pub type ControlQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

fn io_err(e: ProxyError) -> Error {
    Error::new(ErrorKind::InvalidData, e.to_string())
}

/// Identity of one proxied connection on the middle-proxy channel.
#[derive(Clone)]
pub struct MiddleConnParams {
    pub conn_id: u64,
    pub client_addr: SocketAddr,
    pub our_addr: SocketAddr,
    pub ad_tag: Vec<u8>,
}

/// Client plaintext in, encrypted RPC_PROXY_REQ frames out.
pub struct MiddleWriter<W> {
    inner: W,
    cbc: AesCbc,
    seq: i32,
    params: MiddleConnParams,
    opts: Arc<ConnectionOpts>,
    control: ControlQueue,
    /// Client plaintext not yet forming a whole MTProto message.
    inbuf: BytesMut,
    /// Ciphertext waiting for the inner half.
    pending: BytesMut,
}

impl<W> MiddleWriter<W> {
    pub fn new(
        inner: W,
        cbc: AesCbc,
        params: MiddleConnParams,
        opts: Arc<ConnectionOpts>,
        control: ControlQueue,
    ) -> Self {
        Self {
            inner,
            cbc,
            seq: 0,
            params,
            opts,
            control,
            inbuf: BytesMut::new(),
            pending: BytesMut::new(),
        }
    }

    fn push_frame(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = rpc::build_frame(self.seq, payload);
        self.seq += 1;
        rpc::pad_for_cbc(&mut frame);
        self.cbc.encrypt_blocks(&mut frame).map_err(io_err)?;
        self.pending.extend_from_slice(&frame);
        Ok(())
    }

    fn drain_control(&mut self) -> Result<()> {
        loop {
            let payload = { self.control.lock().pop_front() };
            match payload {
                Some(p) => self.push_frame(&p)?,
                None => return Ok(()),
            }
        }
    }

    /// Frame every complete client message buffered so far.
    fn frame_messages(&mut self) -> Result<()> {
        loop {
            let msg = decode_message(self.opts.transport, &mut self.inbuf).map_err(io_err)?;
            let Some(msg) = msg else { return Ok(()) };

            let mut flags = rpc_proxy_req_flags(self.opts.transport);
            if msg.quick_ack {
                self.opts.read_hacks.set_quick_ack();
                flags |= RPC_FLAG_QUICK_ACK;
            }

            let payload = rpc::build_proxy_req(
                flags,
                self.params.conn_id,
                self.params.client_addr,
                self.params.our_addr,
                &self.params.ad_tag,
                &msg.payload,
            );
            self.push_frame(&payload)?;
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>>
    where
        W: AsyncWrite + Unpin,
    {
        while !self.pending.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(Error::new(
                        ErrorKind::WriteZero,
                        "middle proxy refused frame bytes",
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

impl<W: AsyncWrite + Unpin> AsyncWrite for MiddleWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize>> {
        let this = self.get_mut();

        this.drain_control()?;
        this.inbuf.extend_from_slice(buf);
        this.frame_messages()?;

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        // Frames already committed to the CBC stream stay in `pending`;
        // flush drives them out.
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        this.drain_control()?;
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

/// Encrypted RPC frames in, client-framed plaintext out.
pub struct MiddleReader<R> {
    inner: R,
    cbc: AesCbc,
    conn_id: u64,
    opts: Arc<ConnectionOpts>,
    control: ControlQueue,
    rng: Arc<SecureRandom>,
    /// Ciphertext not yet forming whole AES blocks.
    raw: BytesMut,
    /// Decrypted bytes not yet forming whole RPC frames.
    frames: BytesMut,
    /// Client-framed bytes ready to hand up.
    out: BytesMut,
    eof: bool,
}

impl<R> MiddleReader<R> {
    pub fn new(
        inner: R,
        cbc: AesCbc,
        conn_id: u64,
        opts: Arc<ConnectionOpts>,
        control: ControlQueue,
        rng: Arc<SecureRandom>,
    ) -> Self {
        Self {
            inner,
            cbc,
            conn_id,
            opts,
            control,
            rng,
            raw: BytesMut::new(),
            frames: BytesMut::new(),
            out: BytesMut::new(),
            eof: false,
        }
    }

    /// Seed the buffers with bytes that arrived during the dial handshake:
    /// `raw` ciphertext still undecrypted, `frames` plaintext already
    /// decrypted but not yet parsed.
    pub fn preload(&mut self, raw: &[u8], frames: &[u8]) {
        self.raw.extend_from_slice(raw);
        self.frames.extend_from_slice(frames);
    }

    fn decrypt_blocks(&mut self) -> Result<()> {
        let blocks = self.raw.len() / 16 * 16;
        if blocks == 0 {
            return Ok(());
        }
        let mut chunk = self.raw.split_to(blocks);
        self.cbc.decrypt_blocks(&mut chunk).map_err(io_err)?;
        self.frames.extend_from_slice(&chunk);
        Ok(())
    }

    fn dispatch_frames(&mut self) -> Result<()> {
        while let Some((_seq, payload)) = rpc::try_parse_frame(&mut self.frames).map_err(io_err)? {
            if payload.len() < 4 {
                continue;
            }
            let tag = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            let body = &payload[4..];

            match tag {
                RPC_PROXY_ANS if body.len() >= 12 => {
                    let conn_id = u64::from_le_bytes(body[4..12].try_into().unwrap());
                    if conn_id != self.conn_id {
                        trace!(conn_id, "answer for foreign connection dropped");
                        continue;
                    }
                    let data = &body[12..];
                    let padding = self.answer_padding();
                    encode_message(self.opts.transport, data, &padding, &mut self.out)
                        .map_err(io_err)?;
                }
                RPC_SIMPLE_ACK if body.len() >= 12 => {
                    let conn_id = u64::from_le_bytes(body[0..8].try_into().unwrap());
                    if conn_id != self.conn_id {
                        continue;
                    }
                    let confirm: [u8; 4] = body[8..12].try_into().unwrap();
                    self.opts.write_hacks.set_simple_ack();
                    encode_simple_ack(self.opts.transport, confirm, &mut self.out);
                }
                RPC_CLOSE_EXT | RPC_CLOSE_CONN => {
                    debug!(conn_id = self.conn_id, "middle proxy closed the connection");
                    self.eof = true;
                }
                RPC_PING if body.len() >= 8 => {
                    let ping_id = i64::from_le_bytes(body[0..8].try_into().unwrap());
                    // The writer ships this with the next client message
                    // or flush; there is no write path from a reader half.
                    self.control.lock().push_back(rpc::build_pong(ping_id));
                }
                other => {
                    debug!(tag = format_args!("0x{:08x}", other), "unhandled RPC message");
                }
            }
        }
        Ok(())
    }

    fn answer_padding(&self) -> Vec<u8> {
        if self.opts.transport != ProtoTag::Secure {
            return Vec::new();
        }
        let mut padding = vec![0u8; self.rng.range(4)];
        self.rng.fill(&mut padding);
        padding
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MiddleReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let this = self.get_mut();

        loop {
            // Work through whatever is buffered (including preloaded
            // handshake leftovers) before touching the socket.
            this.decrypt_blocks()?;
            this.dispatch_frames()?;

            if !this.out.is_empty() {
                let n = this.out.len().min(buf.remaining());
                buf.put_slice(&this.out.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut tmp = [0u8; 16384];
            let mut rb = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                Poll::Ready(Ok(())) => {
                    if rb.filled().is_empty() {
                        this.eof = true;
                        continue;
                    }
                    this.raw.extend_from_slice(rb.filled());
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::decode_message as client_decode;
    use crate::protocol::ProtoTag;
    use bytes::BufMut;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const WRITE_KEY: [u8; 32] = [0x31u8; 32];
    const WRITE_IV: [u8; 16] = [0x32u8; 16];
    const READ_KEY: [u8; 32] = [0x33u8; 32];
    const READ_IV: [u8; 16] = [0x34u8; 16];
    const CONN_ID: u64 = 0xdead_beef_cafe_0001;

    fn params() -> MiddleConnParams {
        MiddleConnParams {
            conn_id: CONN_ID,
            client_addr: "198.51.100.4:40001".parse().unwrap(),
            our_addr: "203.0.113.9:443".parse().unwrap(),
            ad_tag: vec![0x44u8; 16],
        }
    }

    fn opts(transport: ProtoTag) -> Arc<ConnectionOpts> {
        Arc::new(ConnectionOpts::new(
            2,
            transport,
            "198.51.100.4:40001".parse().unwrap(),
        ))
    }

    fn control() -> ControlQueue {
        Arc::new(Mutex::new(VecDeque::new()))
    }

    #[tokio::test]
    async fn test_writer_frames_client_messages() {
        let (upstream, mut middle_side) = duplex(65536);
        let opts = opts(ProtoTag::Intermediate);
        let mut writer = MiddleWriter::new(
            upstream,
            AesCbc::new(WRITE_KEY, WRITE_IV),
            params(),
            Arc::clone(&opts),
            control(),
        );

        // Client message in intermediate framing.
        let mut plain = BytesMut::new();
        plain.put_u32_le(8);
        plain.put_slice(b"msg-data");
        writer.write_all(&plain).await.unwrap();
        writer.flush().await.unwrap();

        // The middle-proxy side decrypts and validates the frame.
        let mut wire = vec![0u8; 1024];
        let n = middle_side.read(&mut wire).await.unwrap();
        assert_eq!(n % 16, 0);
        wire.truncate(n);

        let mut dec = AesCbc::new(WRITE_KEY, WRITE_IV);
        dec.decrypt_blocks(&mut wire).unwrap();

        let mut buf = BytesMut::from(&wire[..]);
        let (seq, payload) = rpc::try_parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(
            u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            RPC_PROXY_REQ
        );
        let flags = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        assert_eq!(flags & RPC_FLAG_QUICK_ACK, 0);
        assert_ne!(flags & RPC_FLAG_INTERMEDIATE, 0);
        assert_eq!(u64::from_le_bytes(payload[8..16].try_into().unwrap()), CONN_ID);
        assert_eq!(&payload[payload.len() - 8..], b"msg-data");
    }

    #[tokio::test]
    async fn test_writer_quick_ack_sets_flag_and_hack() {
        let (upstream, mut middle_side) = duplex(65536);
        let opts = opts(ProtoTag::Intermediate);
        let mut writer = MiddleWriter::new(
            upstream,
            AesCbc::new(WRITE_KEY, WRITE_IV),
            params(),
            Arc::clone(&opts),
            control(),
        );

        let mut plain = BytesMut::new();
        plain.put_u32_le(0x8000_0000 | 4);
        plain.put_slice(b"ack!");
        writer.write_all(&plain).await.unwrap();
        writer.flush().await.unwrap();

        assert!(opts.read_hacks.quick_ack());

        let mut wire = vec![0u8; 1024];
        let n = middle_side.read(&mut wire).await.unwrap();
        wire.truncate(n);
        let mut dec = AesCbc::new(WRITE_KEY, WRITE_IV);
        dec.decrypt_blocks(&mut wire).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let (_, payload) = rpc::try_parse_frame(&mut buf).unwrap().unwrap();
        let flags = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        assert_ne!(flags & RPC_FLAG_QUICK_ACK, 0);
    }

    #[tokio::test]
    async fn test_writer_buffers_partial_messages() {
        let (upstream, mut middle_side) = duplex(65536);
        let opts = opts(ProtoTag::Intermediate);
        let mut writer = MiddleWriter::new(
            upstream,
            AesCbc::new(WRITE_KEY, WRITE_IV),
            params(),
            opts,
            control(),
        );

        // Half a header: nothing must reach the wire yet.
        writer.write_all(&[16, 0]).await.unwrap();
        writer.flush().await.unwrap();

        let mut probe = [0u8; 64];
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            middle_side.read(&mut probe),
        )
        .await;
        assert!(pending.is_err(), "incomplete message must not be framed");

        // Completing the message releases exactly one frame.
        let mut rest = BytesMut::new();
        rest.put_slice(&[0, 0]);
        rest.put_slice(&[0x77u8; 16]);
        writer.write_all(&rest).await.unwrap();
        writer.flush().await.unwrap();

        let n = middle_side.read(&mut probe).await.unwrap();
        assert!(n > 0);
    }

    /// Encrypt one RPC frame the way the middle proxy would.
    fn middle_frame(cbc: &mut AesCbc, seq: i32, payload: &[u8]) -> Vec<u8> {
        let mut frame = rpc::build_frame(seq, payload);
        rpc::pad_for_cbc(&mut frame);
        cbc.encrypt_blocks(&mut frame).unwrap();
        frame
    }

    #[tokio::test]
    async fn test_reader_reframes_answers_for_client() {
        let (mut middle_side, upstream) = duplex(65536);
        let opts = opts(ProtoTag::Intermediate);
        let mut reader = MiddleReader::new(
            upstream,
            AesCbc::new(READ_KEY, READ_IV),
            CONN_ID,
            opts,
            control(),
            Arc::new(SecureRandom::new()),
        );

        let mut enc = AesCbc::new(READ_KEY, READ_IV);
        let mut ans = Vec::new();
        ans.put_u32_le(RPC_PROXY_ANS);
        ans.put_u32_le(0); // flags
        ans.put_u64_le(CONN_ID);
        ans.put_slice(b"answer-bytes");
        middle_side
            .write_all(&middle_frame(&mut enc, 0, &ans))
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = reader.read(&mut buf).await.unwrap();
        let mut framed = BytesMut::from(&buf[..n]);
        let msg = client_decode(ProtoTag::Intermediate, &mut framed)
            .unwrap()
            .unwrap();
        assert_eq!(&msg.payload[..], b"answer-bytes");
    }

    #[tokio::test]
    async fn test_reader_simple_ack_and_foreign_answers() {
        let (mut middle_side, upstream) = duplex(65536);
        let opts = opts(ProtoTag::Abridged);
        let mut reader = MiddleReader::new(
            upstream,
            AesCbc::new(READ_KEY, READ_IV),
            CONN_ID,
            Arc::clone(&opts),
            control(),
            Arc::new(SecureRandom::new()),
        );

        let mut enc = AesCbc::new(READ_KEY, READ_IV);

        // An answer for some other connection is dropped silently.
        let mut foreign = Vec::new();
        foreign.put_u32_le(RPC_PROXY_ANS);
        foreign.put_u32_le(0);
        foreign.put_u64_le(CONN_ID ^ 1);
        foreign.put_slice(&[0u8; 8]);
        middle_side
            .write_all(&middle_frame(&mut enc, 0, &foreign))
            .await
            .unwrap();

        // A simple ack for ours: reversed bytes, hack flag set.
        let mut ack = Vec::new();
        ack.put_u32_le(RPC_SIMPLE_ACK);
        ack.put_u64_le(CONN_ID);
        ack.put_slice(&[0xde, 0xad, 0xbe, 0xef]);
        middle_side
            .write_all(&middle_frame(&mut enc, 1, &ack))
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xef, 0xbe, 0xad, 0xde]);
        assert!(opts.write_hacks.simple_ack());
    }

    #[tokio::test]
    async fn test_reader_close_is_eof_and_ping_queues_pong() {
        let (mut middle_side, upstream) = duplex(65536);
        let opts = opts(ProtoTag::Intermediate);
        let queue = control();
        let mut reader = MiddleReader::new(
            upstream,
            AesCbc::new(READ_KEY, READ_IV),
            CONN_ID,
            opts,
            Arc::clone(&queue),
            Arc::new(SecureRandom::new()),
        );

        let mut enc = AesCbc::new(READ_KEY, READ_IV);

        let mut ping = Vec::new();
        ping.put_u32_le(RPC_PING);
        ping.put_i64_le(424242);
        middle_side
            .write_all(&middle_frame(&mut enc, 0, &ping))
            .await
            .unwrap();

        let mut close = Vec::new();
        close.put_u32_le(RPC_CLOSE_EXT);
        close.put_u64_le(CONN_ID);
        middle_side
            .write_all(&middle_frame(&mut enc, 1, &close))
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "close must surface as EOF");

        let pong = queue.lock().pop_front().expect("pong queued for writer");
        assert_eq!(u32::from_le_bytes(pong[0..4].try_into().unwrap()), RPC_PONG);
        assert_eq!(i64::from_le_bytes(pong[4..12].try_into().unwrap()), 424242);
    }
}
