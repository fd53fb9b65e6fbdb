//! mtrelay - MTPROTO proxy for Telegram

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod crypto;
mod error;
mod protocol;
mod proxy;
mod stats;
mod stream;
mod telegram;
mod transport;
mod util;

use crate::config::Config;
use crate::proxy::ProxyServer;
use crate::stats::Stats;

#[derive(Parser)]
#[command(name = "mtrelay", version, about = "MTPROTO proxy for Telegram")]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// IP to bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Port to bind to
    #[arg(short = 'p', long, default_value_t = 3128)]
    bind_port: u16,

    /// Public IPv4 address to advertise (auto-detected when unset)
    #[arg(long)]
    public_ipv4: Option<Ipv4Addr>,

    /// Port of the public IPv4 address (defaults to the bind port)
    #[arg(long)]
    public_ipv4_port: Option<u16>,

    /// Public IPv6 address to advertise (auto-detected when unset)
    #[arg(long)]
    public_ipv6: Option<Ipv6Addr>,

    /// Port of the public IPv6 address (defaults to the bind port)
    #[arg(long)]
    public_ipv6_port: Option<u16>,

    /// IP for the stats endpoint (defaults to the public IPv4)
    #[arg(long)]
    stats_ip: Option<IpAddr>,

    /// Port for the stats endpoint
    #[arg(long, default_value_t = 3129)]
    stats_port: u16,

    /// Client secret: 32 hex chars, optionally prefixed with "dd"
    secret: String,

    /// Promoted-channel tag, 32 hex chars; presence enables middle-proxy mode
    #[arg(default_value = "")]
    adtag: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG takes absolute priority over the CLI knobs.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new("warn")
    };
    fmt().with_env_filter(filter).init();

    let config = match Config::new(
        cli.debug,
        cli.verbose,
        cli.bind_ip,
        cli.bind_port,
        cli.public_ipv4,
        cli.public_ipv4_port,
        cli.public_ipv6,
        cli.public_ipv6_port,
        cli.stats_ip,
        cli.stats_port,
        &cli.secret,
        &cli.adtag,
    )
    .await
    {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("[mtrelay] Error: {e}");
            std::process::exit(1);
        }
    };

    info!("mtrelay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        bind = %config.bind_addr(),
        middle_proxy = config.use_middle_proxy(),
        "Configuration loaded"
    );

    // The link record goes to stdout unconditionally, like the URLs users
    // paste into their clients.
    match serde_json::to_string_pretty(&config.urls()) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "Cannot render proxy links"),
    }

    let stats = Arc::new(Stats::new());
    let server = match ProxyServer::new(Arc::clone(&config), Arc::clone(&stats)).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("[mtrelay] Error: {e}");
            std::process::exit(1);
        }
    };

    let serving = tokio::spawn(server.serve());

    tokio::select! {
        result = serving => {
            match result {
                Ok(Err(e)) => {
                    error!(error = %e, "Server stopped");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Server task failed");
                    std::process::exit(1);
                }
                Ok(Ok(())) => {}
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }
}
