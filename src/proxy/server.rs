//! Proxy server
//!
//! Accepts client connections and walks each one through its lifecycle:
//! handshake, upstream dial, duplex pumping, teardown. Strategies for the
//! handshake and the dial are fixed at construction from the configured
//! mode, so per-connection code never branches on it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::SecureRandom;
use crate::error::{ProxyError, Result};
use crate::protocol::ConnectionOpts;
use crate::stats::Stats;
use crate::stream::{CtxReader, CtxWriter, TrafficReader, TrafficWriter};
use crate::telegram::{DirectTelegram, MiddleProxyDirectory, MiddleTelegram};

use super::client_init::ClientInit;
use super::pump::pump;

/// Upstream dial strategy, fixed at construction.
enum Telegram {
    Direct(DirectTelegram),
    Middle(MiddleTelegram),
    /// Raw TCP to a fixed address, standing in for a datacenter in tests.
    #[cfg(test)]
    Plain(SocketAddr),
}

pub struct ProxyServer {
    config: Arc<Config>,
    stats: Arc<Stats>,
    client_init: ClientInit,
    telegram: Telegram,
}

impl ProxyServer {
    /// Build the server, selecting the init and dial strategies from the
    /// configured mode. Middle mode loads the proxy directory up front
    /// and keeps it refreshed in the background.
    pub async fn new(config: Arc<Config>, stats: Arc<Stats>) -> Result<Arc<Self>> {
        let rng = Arc::new(SecureRandom::new());
        let client_init = ClientInit::for_config(&config);

        let telegram = if config.use_middle_proxy() {
            let directory = MiddleProxyDirectory::init(Arc::clone(&rng)).await?;
            directory.spawn_refresh();
            Telegram::Middle(MiddleTelegram::new(
                directory,
                rng,
                config.ad_tag.clone(),
                config.announced_addr(),
            ))
        } else {
            Telegram::Direct(DirectTelegram::new(rng, config.public_ipv4.is_some()))
        };

        Ok(Arc::new(Self {
            config,
            stats,
            client_init,
            telegram,
        }))
    }

    /// Bind and run the accept loop; only the bind can fail.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Bind { addr, source: e })?;
        info!(addr = %addr, middle_proxy = self.config.use_middle_proxy(), "Proxy listening");
        self.accept_loop(listener).await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(Arc::clone(&self).supervise(stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "Cannot accept incoming connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Per-connection supervisor: owns the stats lifecycle and recovers
    /// anything the connection task does, panics included.
    async fn supervise(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.stats.new_connection();
        let socket_id = Uuid::new_v4();

        debug!(socket_id = %socket_id, peer = %peer, "Client connected");

        let server = Arc::clone(&self);
        let connection =
            tokio::spawn(async move { server.relay(stream, peer, socket_id).await });

        match connection.await {
            Ok(Ok(())) => {
                debug!(socket_id = %socket_id, peer = %peer, "Client disconnected");
            }
            Ok(Err(e)) if e.is_silent() => {
                debug!(socket_id = %socket_id, "Connection cancelled");
            }
            Ok(Err(e)) => {
                warn!(socket_id = %socket_id, peer = %peer, error = %e, "Cannot serve connection");
            }
            Err(join_err) if join_err.is_panic() => {
                self.stats.crash();
                error!(socket_id = %socket_id, peer = %peer, "Crash of connection handler");
            }
            Err(_) => {}
        }

        self.stats.close_connection();
    }

    async fn relay(&self, stream: TcpStream, peer: SocketAddr, socket_id: Uuid) -> Result<()> {
        let client = self.client_init.init(stream, socket_id, &self.config).await?;
        let opts = Arc::clone(&client.opts);

        info!(
            socket_id = %socket_id,
            peer = %peer,
            dc = opts.dc,
            transport = ?opts.transport,
            "Connecting to Telegram"
        );

        match &self.telegram {
            Telegram::Direct(tg) => {
                let (tg_reader, tg_writer) = tg.dial(socket_id, &opts).await?;
                self.run_pumps(client.reader, client.writer, tg_reader, tg_writer, opts, socket_id)
                    .await
            }
            Telegram::Middle(tg) => {
                let (tg_reader, tg_writer) = tg.dial(socket_id, &opts).await?;
                self.run_pumps(client.reader, client.writer, tg_reader, tg_writer, opts, socket_id)
                    .await
            }
            #[cfg(test)]
            Telegram::Plain(addr) => {
                let upstream =
                    TcpStream::connect(addr)
                        .await
                        .map_err(|e| ProxyError::UpstreamDial {
                            dc: opts.dc,
                            reason: e.to_string(),
                        })?;
                let (tg_reader, tg_writer) = upstream.into_split();
                self.run_pumps(client.reader, client.writer, tg_reader, tg_writer, opts, socket_id)
                    .await
            }
        }
    }

    /// Wrap both sides in traffic accounting and cancellation, then run
    /// the two pumps until either direction finishes. Pump failures are
    /// logged where they happen and end the connection cleanly; only a
    /// panic escapes, to be recovered by the supervisor.
    async fn run_pumps<CR, CW, TR, TW>(
        &self,
        client_reader: CR,
        client_writer: CW,
        tg_reader: TR,
        tg_writer: TW,
        opts: Arc<ConnectionOpts>,
        socket_id: Uuid,
    ) -> Result<()>
    where
        CR: AsyncRead + Unpin + Send + 'static,
        CW: AsyncWrite + Unpin + Send + 'static,
        TR: AsyncRead + Unpin + Send + 'static,
        TW: AsyncWrite + Unpin + Send + 'static,
    {
        let token = CancellationToken::new();

        let client_reader = CtxReader::new(
            TrafficReader::new(client_reader, Arc::clone(&self.stats)),
            token.clone(),
        );
        let client_writer = CtxWriter::new(
            TrafficWriter::new(client_writer, Arc::clone(&self.stats)),
            token.clone(),
        );
        let tg_reader = CtxReader::new(
            TrafficReader::new(tg_reader, Arc::clone(&self.stats)),
            token.clone(),
        );
        let tg_writer = CtxWriter::new(
            TrafficWriter::new(tg_writer, Arc::clone(&self.stats)),
            token.clone(),
        );

        let client_to_tg = {
            let opts = Arc::clone(&opts);
            let token = token.clone();
            tokio::spawn(async move {
                let result = pump(
                    client_reader,
                    tg_writer,
                    &opts.read_hacks,
                    &token,
                    socket_id,
                    "client",
                )
                .await;
                token.cancel();
                if let Err(e) = &result {
                    if !e.is_silent() {
                        info!(socket_id = %socket_id, error = %e, "Client stream is aborted");
                    }
                }
            })
        };
        let tg_to_client = {
            let opts = Arc::clone(&opts);
            let token = token.clone();
            tokio::spawn(async move {
                let result = pump(
                    tg_reader,
                    client_writer,
                    &opts.write_hacks,
                    &token,
                    socket_id,
                    "telegram",
                )
                .await;
                token.cancel();
                if let Err(e) = &result {
                    if !e.is_silent() {
                        info!(socket_id = %socket_id, error = %e, "Telegram stream is aborted");
                    }
                }
            })
        };

        let (first, second) = tokio::join!(client_to_tg, tg_to_client);
        token.cancel();

        for join in [first, second] {
            if let Err(e) = join {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use crate::protocol::obfuscated2::testclient;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SECRET_HEX: &str = "000102030405060708090a0b0c0d0e0f";

    async fn test_config() -> Config {
        Config::new(
            false,
            false,
            "127.0.0.1".parse().unwrap(),
            0,
            Some("203.0.113.9".parse().unwrap()),
            None,
            None,
            None,
            None,
            8888,
            SECRET_HEX,
            "",
        )
        .await
        .unwrap()
    }

    /// Echo upstream plus a proxy wired to it; returns the proxy address.
    async fn start_proxy() -> (Arc<ProxyServer>, SocketAddr) {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = echo.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        let config = Arc::new(test_config().await);
        let stats = Arc::new(Stats::new());
        let server = Arc::new(ProxyServer {
            config,
            stats,
            client_init: ClientInit::Direct,
            telegram: Telegram::Plain(echo_addr),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).accept_loop(listener));

        (server, addr)
    }

    async fn wait_for_no_active(stats: &Stats) {
        for _ in 0..100 {
            if stats.active_connections() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "connections never closed: {} still active",
            stats.active_connections()
        );
    }

    #[tokio::test]
    async fn test_end_to_end_echo() {
        let (server, addr) = start_proxy().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let secret = hex::decode(SECRET_HEX).unwrap();
        let mut session = testclient::client_session(&secret, TAG_INTERMEDIATE, 2);
        client.write_all(&session.frame).await.unwrap();

        // Several encrypted payloads through the proxy and back.
        for round in 0u8..3 {
            let payload: Vec<u8> = (0..500).map(|i| (i as u8).wrapping_add(round)).collect();

            let mut wire = payload.clone();
            session.encryptor.apply(&mut wire);
            client.write_all(&wire).await.unwrap();

            let mut echoed = vec![0u8; payload.len()];
            client.read_exact(&mut echoed).await.unwrap();
            session.decryptor.apply(&mut echoed);
            assert_eq!(echoed, payload);
        }

        assert!(server.stats.incoming_traffic() >= 1500);
        assert!(server.stats.outgoing_traffic() >= 1500);
        assert_eq!(server.stats.all_connections(), 1);

        drop(client);
        wait_for_no_active(&server.stats).await;
    }

    #[tokio::test]
    async fn test_accept_loop_survives_bad_clients() {
        let (server, addr) = start_proxy().await;

        // A client that sends garbage and one that hangs up mid-frame.
        let mut garbage = TcpStream::connect(addr).await.unwrap();
        garbage.write_all(&[0xffu8; 64]).await.unwrap();
        drop(garbage);

        let mut truncated = TcpStream::connect(addr).await.unwrap();
        truncated.write_all(&[0x01u8; 10]).await.unwrap();
        drop(truncated);

        wait_for_no_active(&server.stats).await;

        // A well-behaved client still gets through.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let secret = hex::decode(SECRET_HEX).unwrap();
        let mut session = testclient::client_session(&secret, TAG_ABRIDGED, 1);
        client.write_all(&session.frame).await.unwrap();

        let mut wire = b"still alive?".to_vec();
        session.encryptor.apply(&mut wire);
        client.write_all(&wire).await.unwrap();

        let mut echoed = vec![0u8; 12];
        client.read_exact(&mut echoed).await.unwrap();
        session.decryptor.apply(&mut echoed);
        assert_eq!(&echoed, b"still alive?");

        assert_eq!(server.stats.all_connections(), 3);
    }

    #[tokio::test]
    async fn test_upstream_hangup_closes_connection_promptly() {
        // An upstream that accepts and immediately closes.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = upstream.accept().await else { return };
                drop(conn);
            }
        });

        let config = Arc::new(test_config().await);
        let stats = Arc::new(Stats::new());
        let server = Arc::new(ProxyServer {
            config,
            stats,
            client_init: ClientInit::Direct,
            telegram: Telegram::Plain(upstream_addr),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).accept_loop(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let secret = hex::decode(SECRET_HEX).unwrap();
        let session = testclient::client_session(&secret, TAG_INTERMEDIATE, 2);
        client.write_all(&session.frame).await.unwrap();

        // The proxy must tear the client side down within the bound.
        tokio::time::timeout(Duration::from_secs(1), async {
            let mut buf = [0u8; 16];
            loop {
                match client.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("client connection not closed within a second");

        wait_for_no_active(&server.stats).await;
    }
}
