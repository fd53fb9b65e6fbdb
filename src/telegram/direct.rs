//! Direct datacenter dialer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::crypto::SecureRandom;
use crate::error::{ProxyError, Result};
use crate::protocol::obfuscated2::generate_upstream_frame;
use crate::protocol::{constants::*, ConnectionOpts, ProtocolFamily};
use crate::stream::{CipherReader, CipherWriter};
use crate::transport::configure_socket;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub type DirectReader = CipherReader<OwnedReadHalf>;
pub type DirectWriter = CipherWriter<OwnedWriteHalf>;

/// Dials datacenters straight from their static address tables and speaks
/// obfuscated2 to them, re-encrypting the bridged stream.
pub struct DirectTelegram {
    rng: Arc<SecureRandom>,
    prefer_ipv4: bool,
}

impl DirectTelegram {
    /// `prefer_ipv4` decides family-agnostic connections; the server sets
    /// it from whether a public IPv4 address is configured.
    pub fn new(rng: Arc<SecureRandom>, prefer_ipv4: bool) -> Self {
        Self { rng, prefer_ipv4 }
    }

    fn pick_addr(&self, opts: &ConnectionOpts) -> Result<SocketAddr> {
        let ip = match opts.protocol {
            ProtocolFamily::Ipv4 => dc_addr_v4(opts.dc),
            ProtocolFamily::Ipv6 => dc_addr_v6(opts.dc),
            ProtocolFamily::Any => {
                if self.prefer_ipv4 {
                    dc_addr_v4(opts.dc).or_else(|| dc_addr_v6(opts.dc))
                } else {
                    dc_addr_v6(opts.dc).or_else(|| dc_addr_v4(opts.dc))
                }
            }
        };

        ip.map(|ip| SocketAddr::new(ip, TG_DATACENTER_PORT))
            .ok_or_else(|| ProxyError::UpstreamDial {
                dc: opts.dc,
                reason: "no address for DC".into(),
            })
    }

    pub async fn dial(
        &self,
        socket_id: Uuid,
        opts: &ConnectionOpts,
    ) -> Result<(DirectReader, DirectWriter)> {
        let addr = self.pick_addr(opts)?;

        debug!(socket_id = %socket_id, dc = opts.dc, addr = %addr, "Dialing Telegram directly");

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

        // Announce our own obfuscated2 session to the DC.
        let handshake = generate_upstream_frame(&self.rng, opts.transport);
        stream
            .write_all(&handshake.frame)
            .await
            .map_err(|e| ProxyError::UpstreamHandshake {
                step: "obfuscated2_frame",
                cause: e.to_string(),
            })?;
        stream.flush().await.map_err(|e| ProxyError::UpstreamHandshake {
            step: "obfuscated2_frame",
            cause: e.to_string(),
        })?;

        debug!(socket_id = %socket_id, addr = %addr, "Telegram handshake sent");

        let (read_half, write_half) = stream.into_split();
        Ok((
            CipherReader::new(read_half, handshake.decryptor),
            CipherWriter::new(write_half, handshake.encryptor),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts_for(dc: i16, protocol: ProtocolFamily) -> ConnectionOpts {
        let mut opts = ConnectionOpts::new(
            dc,
            ProtoTag::Intermediate,
            "198.51.100.4:40001".parse().unwrap(),
        );
        opts.protocol = protocol;
        opts
    }

    #[test]
    fn test_pick_addr_per_family() {
        let rng = Arc::new(SecureRandom::new());

        let tg = DirectTelegram::new(Arc::clone(&rng), true);
        let addr = tg.pick_addr(&opts_for(2, ProtocolFamily::Ipv4)).unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), TG_DATACENTER_PORT);

        let addr = tg.pick_addr(&opts_for(2, ProtocolFamily::Ipv6)).unwrap();
        assert!(addr.is_ipv6());
    }

    #[test]
    fn test_pick_addr_any_honors_preference() {
        let rng = Arc::new(SecureRandom::new());

        let v4_first = DirectTelegram::new(Arc::clone(&rng), true);
        assert!(v4_first.pick_addr(&opts_for(1, ProtocolFamily::Any)).unwrap().is_ipv4());

        let v6_first = DirectTelegram::new(rng, false);
        assert!(v6_first.pick_addr(&opts_for(1, ProtocolFamily::Any)).unwrap().is_ipv6());
    }

    #[test]
    fn test_pick_addr_test_dcs_and_bounds() {
        let rng = Arc::new(SecureRandom::new());
        let tg = DirectTelegram::new(rng, true);

        let prod = tg.pick_addr(&opts_for(2, ProtocolFamily::Ipv4)).unwrap();
        let test = tg.pick_addr(&opts_for(-2, ProtocolFamily::Ipv4)).unwrap();
        assert_ne!(prod.ip(), test.ip());

        assert!(tg.pick_addr(&opts_for(0, ProtocolFamily::Ipv4)).is_err());
        assert!(tg.pick_addr(&opts_for(7, ProtocolFamily::Ipv4)).is_err());
    }
}
