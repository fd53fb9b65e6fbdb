//! Middle-proxy dialer
//!
//! Ad-tag mode reaches Telegram through its middle proxies. Each client
//! connection gets its own upstream channel: a nonce exchange derives the
//! CBC keys, an encrypted RPC_HANDSHAKE opens the channel, and from then
//! on the framed stream wrappers carry the traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::{derive_middleproxy_keys, AesCbc, SecureRandom};
use crate::error::{ProxyError, Result};
use crate::protocol::{constants::*, ConnectionOpts};
use crate::stream::middle::{ControlQueue, MiddleConnParams};
use crate::stream::{MiddleReader, MiddleWriter};
use crate::transport::configure_socket;

use super::directory::MiddleProxyDirectory;
use super::rpc;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub type MiddleUpstreamReader = MiddleReader<OwnedReadHalf>;
pub type MiddleUpstreamWriter = MiddleWriter<OwnedWriteHalf>;

/// Dials middle proxies on behalf of promoted-channel mode.
pub struct MiddleTelegram {
    directory: Arc<MiddleProxyDirectory>,
    rng: Arc<SecureRandom>,
    ad_tag: Vec<u8>,
    /// Address announced to the middle proxy as this proxy's endpoint;
    /// falls back to the dialing socket's local address.
    announced_addr: Option<SocketAddr>,
}

impl MiddleTelegram {
    pub fn new(
        directory: Arc<MiddleProxyDirectory>,
        rng: Arc<SecureRandom>,
        ad_tag: Vec<u8>,
        announced_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            directory,
            rng,
            ad_tag,
            announced_addr,
        }
    }

    pub async fn dial(
        &self,
        socket_id: Uuid,
        opts: &Arc<ConnectionOpts>,
    ) -> Result<(MiddleUpstreamReader, MiddleUpstreamWriter)> {
        let addr = self.directory.next_address(opts.dc, opts.protocol)?;
        let secret = self.directory.secret();

        debug!(socket_id = %socket_id, dc = opts.dc, addr = %addr, "Dialing middle proxy");

        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::UpstreamDial {
                dc: opts.dc,
                reason: format!("connect timeout to {addr}"),
            })?
            .map_err(|e| ProxyError::UpstreamDial {
                dc: opts.dc,
                reason: format!("connect to {addr}: {e}"),
            })?;
        configure_socket(&stream)?;

        let local_addr = stream.local_addr().map_err(|e| ProxyError::UpstreamDial {
            dc: opts.dc,
            reason: e.to_string(),
        })?;
        let peer_addr = stream.peer_addr().map_err(|e| ProxyError::UpstreamDial {
            dc: opts.dc,
            reason: e.to_string(),
        })?;

        // ===== RPC_NONCE exchange (plaintext) =====
        if secret.len() < 4 {
            return Err(ProxyError::UpstreamHandshake {
                step: "rpc_nonce",
                cause: "proxy secret too short".into(),
            });
        }
        let key_selector = u32::from_le_bytes(secret[..4].try_into().unwrap());
        let crypto_ts = rpc::unix_time();
        let my_nonce: [u8; 16] = self.rng.array();

        let nonce_frame = rpc::build_frame(
            RPC_SEQ_NONCE,
            &rpc::build_nonce_payload(key_selector, crypto_ts, &my_nonce),
        );
        write_step(&mut stream, &nonce_frame, "rpc_nonce").await?;

        let mut plain_buf = BytesMut::new();
        let (seq, payload) = timeout(
            HANDSHAKE_STEP_TIMEOUT,
            read_plain_frame(&mut stream, &mut plain_buf),
        )
        .await
        .map_err(|_| ProxyError::UpstreamHandshake {
            step: "rpc_nonce",
            cause: "reply timeout".into(),
        })??;
        if seq != RPC_SEQ_NONCE {
            return Err(ProxyError::UpstreamHandshake {
                step: "rpc_nonce",
                cause: format!("unexpected sequence {seq}"),
            });
        }

        let reply = rpc::parse_nonce_payload(&payload)?;
        if reply.schema != RPC_CRYPTO_AES {
            return Err(ProxyError::UpstreamHandshake {
                step: "rpc_nonce",
                cause: format!("unsupported crypto schema 0x{:x}", reply.schema),
            });
        }

        // ===== Key derivation =====
        let ts_bytes = crypto_ts.to_le_bytes();
        let srv_ip = rpc::ip_as_u32(&peer_addr).to_le_bytes();
        let clt_ip = rpc::ip_as_u32(&local_addr).to_le_bytes();
        let srv_port = peer_addr.port().to_le_bytes();
        let clt_port = local_addr.port().to_le_bytes();

        let (write_key, write_iv) = derive_middleproxy_keys(
            &reply.nonce, &my_nonce, &ts_bytes, &srv_ip, &clt_port, b"CLIENT", &clt_ip,
            &srv_port, &secret,
        );
        let (read_key, read_iv) = derive_middleproxy_keys(
            &reply.nonce, &my_nonce, &ts_bytes, &srv_ip, &clt_port, b"SERVER", &clt_ip,
            &srv_port, &secret,
        );

        let mut write_cbc = AesCbc::new(write_key, write_iv);
        let mut read_cbc = AesCbc::new(read_key, read_iv);

        // ===== Encrypted RPC_HANDSHAKE =====
        let hs_payload = rpc::build_handshake_payload(
            rpc::ip_as_u32(&local_addr),
            local_addr.port(),
            rpc::ip_as_u32(&peer_addr),
            peer_addr.port(),
        );
        let mut hs_frame = rpc::build_frame(RPC_SEQ_HANDSHAKE, &hs_payload);
        rpc::pad_for_cbc(&mut hs_frame);
        write_cbc
            .encrypt_blocks(&mut hs_frame)
            .map_err(|e| ProxyError::UpstreamHandshake {
                step: "rpc_handshake",
                cause: e.to_string(),
            })?;
        write_step(&mut stream, &hs_frame, "rpc_handshake").await?;

        // Anything past the nonce reply already belongs to the encrypted
        // stream.
        let mut raw = plain_buf;
        let mut frames = BytesMut::new();
        let (_, hs_reply) = timeout(
            HANDSHAKE_STEP_TIMEOUT,
            read_encrypted_frame(&mut stream, &mut read_cbc, &mut raw, &mut frames),
        )
        .await
        .map_err(|_| ProxyError::UpstreamHandshake {
            step: "rpc_handshake",
            cause: "reply timeout".into(),
        })??;

        if hs_reply.len() < 4 {
            return Err(ProxyError::UpstreamHandshake {
                step: "rpc_handshake",
                cause: "short reply".into(),
            });
        }
        let reply_tag = u32::from_le_bytes(hs_reply[0..4].try_into().unwrap());
        if reply_tag != RPC_HANDSHAKE {
            return Err(ProxyError::UpstreamHandshake {
                step: "rpc_handshake",
                cause: format!("middle proxy rejected channel: 0x{reply_tag:08x}"),
            });
        }

        info!(socket_id = %socket_id, addr = %addr, dc = opts.dc, "Middle-proxy channel ready");

        // ===== Framed stream =====
        let conn_id = self.rng.u64();
        let params = MiddleConnParams {
            conn_id,
            client_addr: opts.client_addr,
            our_addr: self.announced_addr.unwrap_or(local_addr),
            ad_tag: self.ad_tag.clone(),
        };
        let control: ControlQueue = ControlQueue::default();

        let (read_half, write_half) = stream.into_split();
        let writer = MiddleWriter::new(
            write_half,
            write_cbc,
            params,
            Arc::clone(opts),
            Arc::clone(&control),
        );
        let mut reader = MiddleReader::new(
            read_half,
            read_cbc,
            conn_id,
            Arc::clone(opts),
            control,
            Arc::clone(&self.rng),
        );
        reader.preload(&raw, &frames);

        Ok((reader, writer))
    }
}

async fn write_step(stream: &mut TcpStream, bytes: &[u8], step: &'static str) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| ProxyError::UpstreamHandshake {
            step,
            cause: e.to_string(),
        })?;
    stream
        .flush()
        .await
        .map_err(|e| ProxyError::UpstreamHandshake {
            step,
            cause: e.to_string(),
        })
}

async fn read_plain_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<(i32, Bytes)> {
    loop {
        if let Some(frame) = rpc::try_parse_frame(buf)? {
            return Ok(frame);
        }
        let mut tmp = [0u8; 1024];
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(ProxyError::UpstreamHandshake {
                step: "rpc_nonce",
                cause: "connection closed".into(),
            });
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Read one frame off the encrypted channel, decrypting whole blocks as
/// they arrive. Leftovers stay in `raw`/`frames` for the stream wrapper.
async fn read_encrypted_frame(
    stream: &mut TcpStream,
    cbc: &mut AesCbc,
    raw: &mut BytesMut,
    frames: &mut BytesMut,
) -> Result<(i32, Bytes)> {
    loop {
        if let Some(frame) = rpc::try_parse_frame(frames)? {
            return Ok(frame);
        }

        let mut tmp = [0u8; 1024];
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(ProxyError::UpstreamHandshake {
                step: "rpc_handshake",
                cause: "connection closed".into(),
            });
        }
        raw.extend_from_slice(&tmp[..n]);

        let blocks = raw.len() / 16 * 16;
        if blocks > 0 {
            let mut chunk = raw.split_to(blocks);
            cbc.decrypt_blocks(&mut chunk)?;
            frames.extend_from_slice(&chunk);
        }
    }
}
