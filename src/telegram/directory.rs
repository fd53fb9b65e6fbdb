//! Middle-proxy directory
//!
//! Telegram publishes the middle-proxy endpoints and the binary channel
//! secret at well-known HTTPS locations. The directory downloads both at
//! startup, keeps a snapshot behind a lock, and refreshes it from a
//! background task; dialers read one snapshot per dial.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::crypto::SecureRandom;
use crate::error::{ProxyError, Result};
use crate::protocol::ProtocolFamily;

const PROXY_CONFIG_URL: &str = "https://core.telegram.org/getProxyConfig";
const PROXY_CONFIG_V6_URL: &str = "https://core.telegram.org/getProxyConfigV6";
const PROXY_SECRET_URL: &str = "https://core.telegram.org/getProxySecret";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Minimum plausible size of the binary proxy secret.
const MIN_SECRET_LEN: usize = 32;

/// One parsed `getProxyConfig` document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProxyMap {
    pub default_dc: i16,
    pub by_dc: HashMap<i16, Vec<SocketAddr>>,
}

impl ProxyMap {
    pub fn is_empty(&self) -> bool {
        self.by_dc.is_empty()
    }
}

/// Parse the `proxy_for` / `default` statements of a proxy-config file.
pub fn parse_proxy_config(text: &str) -> Result<ProxyMap> {
    let mut map = ProxyMap::default();

    for line in text.lines() {
        let line = line.trim().trim_end_matches(';');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("default") => {
                let dc = parts
                    .next()
                    .and_then(|s| s.parse::<i16>().ok())
                    .ok_or_else(|| ProxyError::Internal(format!("bad default line: {line}")))?;
                map.default_dc = dc;
            }
            Some("proxy_for") => {
                let dc = parts
                    .next()
                    .and_then(|s| s.parse::<i16>().ok())
                    .ok_or_else(|| ProxyError::Internal(format!("bad proxy_for line: {line}")))?;
                let addr = parts
                    .next()
                    .and_then(|s| s.parse::<SocketAddr>().ok())
                    .ok_or_else(|| ProxyError::Internal(format!("bad address in: {line}")))?;
                map.by_dc.entry(dc).or_default().push(addr);
            }
            _ => continue,
        }
    }

    if map.is_empty() {
        return Err(ProxyError::Internal("empty proxy config".into()));
    }
    Ok(map)
}

struct Snapshot {
    v4: ProxyMap,
    v6: ProxyMap,
    secret: Vec<u8>,
}

/// Refreshable source of middle-proxy endpoints and the channel secret.
pub struct MiddleProxyDirectory {
    snapshot: RwLock<Snapshot>,
    rng: Arc<SecureRandom>,
    http: reqwest::Client,
}

impl MiddleProxyDirectory {
    /// Fetch the initial snapshot; middle mode cannot start without one.
    pub async fn init(rng: Arc<SecureRandom>) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Internal(format!("http client: {e}")))?;

        let snapshot = fetch_snapshot(&http).await?;
        info!(
            v4_dcs = snapshot.v4.by_dc.len(),
            v6_dcs = snapshot.v6.by_dc.len(),
            secret_len = snapshot.secret.len(),
            "Middle-proxy directory loaded"
        );

        Ok(Arc::new(Self {
            snapshot: RwLock::new(snapshot),
            rng,
            http,
        }))
    }

    /// Renew the snapshot periodically; failures keep the previous one.
    pub fn spawn_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let dir = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                match fetch_snapshot(&dir.http).await {
                    Ok(snapshot) => {
                        debug!("Middle-proxy directory refreshed");
                        *dir.snapshot.write() = snapshot;
                    }
                    Err(e) => warn!(error = %e, "Middle-proxy directory refresh failed"),
                }
            }
        })
    }

    /// Pick an endpoint for the DC, falling back to the default DC.
    pub fn next_address(&self, dc: i16, family: ProtocolFamily) -> Result<SocketAddr> {
        let snapshot = self.snapshot.read();
        let map = match family {
            ProtocolFamily::Ipv6 => &snapshot.v6,
            ProtocolFamily::Ipv4 | ProtocolFamily::Any => &snapshot.v4,
        };

        let candidates = map
            .by_dc
            .get(&dc)
            .or_else(|| map.by_dc.get(&map.default_dc))
            .ok_or(ProxyError::NoMiddleProxy { dc })?;

        self.rng
            .choose(candidates)
            .copied()
            .ok_or(ProxyError::NoMiddleProxy { dc })
    }

    pub fn secret(&self) -> Vec<u8> {
        self.snapshot.read().secret.clone()
    }

    /// Directory pinned to a fixed v4 map, for tests that stand in for
    /// the HTTPS endpoints.
    #[cfg(test)]
    pub fn fixed(v4: ProxyMap, secret: Vec<u8>, rng: Arc<SecureRandom>) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Snapshot {
                v4,
                v6: ProxyMap::default(),
                secret,
            }),
            rng,
            http: reqwest::Client::new(),
        })
    }
}

async fn fetch_snapshot(http: &reqwest::Client) -> Result<Snapshot> {
    let v4_text = fetch_text(http, PROXY_CONFIG_URL).await?;
    let v4 = parse_proxy_config(&v4_text)?;

    // A missing v6 map only disables v6 dialing.
    let v6 = match fetch_text(http, PROXY_CONFIG_V6_URL).await {
        Ok(text) => parse_proxy_config(&text).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "IPv6 proxy config unavailable");
            ProxyMap::default()
        }
    };

    let secret = fetch_bytes(http, PROXY_SECRET_URL).await?;
    if secret.len() < MIN_SECRET_LEN {
        return Err(ProxyError::Internal(format!(
            "proxy secret too short: {} bytes",
            secret.len()
        )));
    }

    Ok(Snapshot { v4, v6, secret })
}

async fn fetch_text(http: &reqwest::Client, url: &str) -> Result<String> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| ProxyError::Internal(format!("fetch {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(ProxyError::Internal(format!(
            "fetch {url}: HTTP {}",
            response.status()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| ProxyError::Internal(format!("read {url}: {e}")))
}

async fn fetch_bytes(http: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| ProxyError::Internal(format!("fetch {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(ProxyError::Internal(format!(
            "fetch {url}: HTTP {}",
            response.status()
        )));
    }
    Ok(response
        .bytes()
        .await
        .map_err(|e| ProxyError::Internal(format!("read {url}: {e}")))?
        .to_vec())
}
