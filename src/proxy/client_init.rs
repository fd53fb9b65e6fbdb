//! Client initializer
//!
//! Turns a freshly accepted socket into a plaintext duplex stream plus
//! the per-connection options the dialer needs. Everything up to and
//! including the obfuscated2 handshake happens here.

use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{extract_frame, parse_client_frame, ProtocolFamily};
use crate::protocol::ConnectionOpts;
use crate::stream::{CipherReader, CipherWriter};
use crate::transport::configure_socket;

/// Handshake strategy, selected once at server construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInit {
    Direct,
    Middle,
}

/// A client connection past its handshake.
pub struct InitializedClient {
    pub reader: CipherReader<OwnedReadHalf>,
    pub writer: CipherWriter<OwnedWriteHalf>,
    pub opts: Arc<ConnectionOpts>,
}

impl ClientInit {
    pub fn for_config(config: &Config) -> Self {
        if config.use_middle_proxy() {
            ClientInit::Middle
        } else {
            ClientInit::Direct
        }
    }

    pub async fn init(
        self,
        stream: TcpStream,
        socket_id: Uuid,
        config: &Config,
    ) -> Result<InitializedClient> {
        if let Err(e) = configure_socket(&stream) {
            debug!(socket_id = %socket_id, error = %e, "Cannot configure client socket");
        }
        let peer = stream.peer_addr().map_err(|e| {
            crate::error::ProxyError::BadHandshake(format!("cannot resolve peer address: {e}"))
        })?;

        let (mut read_half, write_half) = stream.into_split();
        let frame = extract_frame(&mut read_half).await?;
        let (obfs2, mut opts) = parse_client_frame(&config.secret, &frame, peer)?;

        // Middle proxies are told the client's address, so the dial must
        // stay within the family that address actually has.
        if self == ClientInit::Middle {
            opts.protocol = if peer.is_ipv4() {
                ProtocolFamily::Ipv4
            } else {
                ProtocolFamily::Ipv6
            };
        }

        debug!(
            socket_id = %socket_id,
            peer = %peer,
            dc = opts.dc,
            transport = ?opts.transport,
            "Client handshake parsed"
        );

        Ok(InitializedClient {
            reader: CipherReader::new(read_half, obfs2.encryptor),
            writer: CipherWriter::new(write_half, obfs2.decryptor),
            opts: Arc::new(opts),
        })
    }
}
