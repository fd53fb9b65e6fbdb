//! Error Types

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    // ============= Config Errors =============

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cannot bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    // ============= Crypto Errors =============

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // ============= Client Handshake Errors =============

    #[error("Client handshake timed out")]
    HandshakeTimeout,

    #[error("Truncated handshake frame: got {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },

    #[error("Unknown transport tag: {0:02x?}")]
    UnknownTransport([u8; 4]),

    #[error("Bad handshake: {0}")]
    BadHandshake(String),

    // ============= Upstream Errors =============

    #[error("Cannot dial Telegram DC {dc}: {reason}")]
    UpstreamDial { dc: i16, reason: String },

    #[error("Upstream handshake failed at {step}: {cause}")]
    UpstreamHandshake { step: &'static str, cause: String },

    #[error("No middle proxy known for DC {dc}")]
    NoMiddleProxy { dc: i16 },

    // ============= Wire Framing Errors =============

    #[error("Invalid frame length: {len} (min={min}, max={max})")]
    InvalidFrameLength { len: usize, min: usize, max: usize },

    #[error("Checksum mismatch: expected={expected:08x}, got={got:08x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    // ============= Stream Errors =============

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection cancelled")]
    Cancelled,

    // ============= General Errors =============

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Terminal-but-expected errors are not worth a log line.
    pub fn is_silent(&self) -> bool {
        matches!(self, ProxyError::Cancelled)
    }
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::UnknownTransport([0xca, 0xfe, 0xba, 0xbe]);
        assert!(err.to_string().contains("ca"));

        let err = ProxyError::UpstreamHandshake {
            step: "rpc_nonce",
            cause: "connection reset".into(),
        };
        assert!(err.to_string().contains("rpc_nonce"));

        let err = ProxyError::Truncated { expected: 64, got: 63 };
        assert!(err.to_string().contains("63"));
    }

    #[test]
    fn test_silent_errors() {
        assert!(ProxyError::Cancelled.is_silent());
        assert!(!ProxyError::HandshakeTimeout.is_silent());
    }
}
