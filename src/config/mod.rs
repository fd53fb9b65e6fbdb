//! Configuration

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;

use crate::error::{ProxyError, Result};
use crate::util::ip::{detect_ipv4, detect_ipv6};

/// Internal socket buffer sizes, and the pump's read granularity.
pub const BUFFER_READ_SIZE: usize = 32 * 1024;
pub const BUFFER_WRITE_SIZE: usize = 32 * 1024;

/// Validated proxy configuration, immutable once constructed.
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub verbose: bool,

    pub bind_ip: IpAddr,
    pub bind_port: u16,

    pub public_ipv4: Option<Ipv4Addr>,
    pub public_ipv4_port: u16,
    pub public_ipv6: Option<Ipv6Addr>,
    pub public_ipv6_port: u16,

    pub stats_ip: Option<IpAddr>,
    pub stats_port: u16,

    /// 16-byte client secret.
    pub secret: Vec<u8>,
    /// Empty, or the 16-byte promoted-channel tag.
    pub ad_tag: Vec<u8>,
}

/// Links to one address of the proxy.
#[derive(Debug, Serialize)]
pub struct Urls {
    pub tg_url: String,
    pub tme_url: String,
}

/// Links to both address families of the proxy.
#[derive(Debug, Serialize)]
pub struct IpUrls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Urls>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Urls>,
}

impl Config {
    /// Build and validate a configuration from command-line inputs,
    /// auto-detecting missing public addresses.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        debug: bool,
        verbose: bool,
        bind_ip: IpAddr,
        bind_port: u16,
        public_ipv4: Option<Ipv4Addr>,
        public_ipv4_port: Option<u16>,
        public_ipv6: Option<Ipv6Addr>,
        public_ipv6_port: Option<u16>,
        stats_ip: Option<IpAddr>,
        stats_port: u16,
        secret: &str,
        ad_tag: &str,
    ) -> Result<Self> {
        let secret = parse_secret(secret)?;
        let ad_tag = parse_ad_tag(ad_tag)?;

        let public_ipv4 = match public_ipv4 {
            Some(ip) => Some(ip),
            None => match detect_ipv4().await {
                Some(IpAddr::V4(ip)) => Some(ip),
                Some(ip) => {
                    return Err(ProxyError::Config(format!("IP {ip} is not IPv4")));
                }
                None => None,
            },
        };
        let public_ipv6 = match public_ipv6 {
            Some(ip) => Some(ip),
            None => match detect_ipv6().await {
                Some(IpAddr::V6(ip)) => Some(ip),
                Some(ip) => {
                    return Err(ProxyError::Config(format!("IP {ip} is not IPv6")));
                }
                None => None,
            },
        };

        let stats_ip = stats_ip.or(public_ipv4.map(IpAddr::V4));

        Ok(Self {
            debug,
            verbose,
            bind_ip,
            bind_port,
            public_ipv4,
            public_ipv4_port: public_ipv4_port.unwrap_or(bind_port),
            public_ipv6,
            public_ipv6_port: public_ipv6_port.unwrap_or(bind_port),
            stats_ip,
            stats_port,
            secret,
            ad_tag,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.bind_port)
    }

    pub fn stat_addr(&self) -> Option<SocketAddr> {
        self.stats_ip.map(|ip| SocketAddr::new(ip, self.stats_port))
    }

    /// Middle-proxy mode is selected by the presence of an ad-tag.
    pub fn use_middle_proxy(&self) -> bool {
        !self.ad_tag.is_empty()
    }

    /// The public IPv4 endpoint announced to middle proxies.
    pub fn announced_addr(&self) -> Option<SocketAddr> {
        self.public_ipv4
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), self.public_ipv4_port))
    }

    /// Proxy links for every configured public address.
    pub fn urls(&self) -> IpUrls {
        IpUrls {
            ipv4: self
                .public_ipv4
                .map(|ip| build_urls(&ip.to_string(), self.public_ipv4_port, &self.secret)),
            ipv6: self
                .public_ipv6
                .map(|ip| build_urls(&ip.to_string(), self.public_ipv6_port, &self.secret)),
        }
    }
}

fn build_urls(host: &str, port: u16, secret: &[u8]) -> Urls {
    let secret_hex = hex::encode(secret);
    Urls {
        tg_url: format!("tg://proxy?server={host}&port={port}&secret={secret_hex}"),
        tme_url: format!("https://t.me/proxy?server={host}&port={port}&secret={secret_hex}"),
    }
}

/// The secret is 32 hex chars, optionally prefixed with the literal `dd`.
fn parse_secret(secret: &str) -> Result<Vec<u8>> {
    let trimmed = secret.strip_prefix("dd").unwrap_or(secret);
    if trimmed.len() != 32 {
        return Err(ProxyError::Config("secret must be 32 hex chars".into()));
    }
    hex::decode(trimmed).map_err(|_| ProxyError::Config("secret must be 32 hex chars".into()))
}

/// The ad-tag is empty or 32 hex chars.
fn parse_ad_tag(ad_tag: &str) -> Result<Vec<u8>> {
    if ad_tag.is_empty() {
        return Ok(Vec::new());
    }
    let decoded =
        hex::decode(ad_tag).map_err(|_| ProxyError::Config("adtag must be 32 hex chars".into()))?;
    if decoded.len() != 16 {
        return Err(ProxyError::Config("adtag must be 32 hex chars".into()));
    }
    Ok(decoded)
}
