//! Public IP discovery

use std::net::IpAddr;
use std::time::Duration;

use tracing::debug;

/// Plain-text IP echo services, tried in order.
const IPV4_URLS: &[&str] = &[
    "http://v4.ident.me/",
    "http://ipv4.icanhazip.com/",
    "http://api.ipify.org/",
];

const IPV6_URLS: &[&str] = &[
    "http://v6.ident.me/",
    "http://ipv6.icanhazip.com/",
    "http://api6.ipify.org/",
];

/// Detect this host's public IPv4 address.
pub async fn detect_ipv4() -> Option<IpAddr> {
    detect(IPV4_URLS).await
}

/// Detect this host's public IPv6 address.
pub async fn detect_ipv6() -> Option<IpAddr> {
    detect(IPV6_URLS).await
}

async fn detect(urls: &[&str]) -> Option<IpAddr> {
    for url in urls {
        if let Some(ip) = fetch_ip(url).await {
            debug!(ip = %ip, url = url, "Detected public address");
            return Some(ip);
        }
    }
    None
}

async fn fetch_ip(url: &str) -> Option<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;

    let response = client.get(url).send().await.ok()?;
    let text = response.text().await.ok()?;
    text.trim().parse().ok()
}
