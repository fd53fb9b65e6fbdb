//! Proxy server: client initialization, pumping, supervision

pub mod client_init;
pub mod pump;
pub mod server;

pub use client_init::ClientInit;
pub use server::ProxyServer;
