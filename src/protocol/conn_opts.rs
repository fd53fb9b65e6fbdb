//! Per-connection protocol state

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use super::constants::ProtoTag;

/// Address family the upstream dialer must honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Ipv4,
    Ipv6,
    Any,
}

/// Transport-level ack quirks for one direction.
///
/// Set by the framing layers while bytes move through them, observed and
/// cleared by the pump once per iteration. Each side has exactly one
/// setter and one consumer, so relaxed atomics are sufficient.
#[derive(Debug, Default)]
pub struct AckHacks {
    quick_ack: AtomicBool,
    simple_ack: AtomicBool,
}

impl AckHacks {
    pub fn set_quick_ack(&self) {
        self.quick_ack.store(true, Ordering::Relaxed);
    }

    pub fn set_simple_ack(&self) {
        self.simple_ack.store(true, Ordering::Relaxed);
    }

    pub fn quick_ack(&self) -> bool {
        self.quick_ack.load(Ordering::Relaxed)
    }

    pub fn simple_ack(&self) -> bool {
        self.simple_ack.load(Ordering::Relaxed)
    }

    /// Consume the quick-ack flag, clearing it.
    pub fn take_quick_ack(&self) -> bool {
        self.quick_ack.swap(false, Ordering::Relaxed)
    }

    /// Consume the simple-ack flag, clearing it.
    pub fn take_simple_ack(&self) -> bool {
        self.simple_ack.swap(false, Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.quick_ack.store(false, Ordering::Relaxed);
        self.simple_ack.store(false, Ordering::Relaxed);
    }
}

/// State attached to one accepted connection.
///
/// Lives as long as the connection; shared between the codec layers and
/// the two pumps, which only touch the ack hacks after the handshake.
#[derive(Debug)]
pub struct ConnectionOpts {
    /// Target datacenter; negative ids select staging DCs.
    pub dc: i16,
    /// Transport the client announced in its handshake.
    pub transport: ProtoTag,
    /// Address family constraint for the upstream dial.
    pub protocol: ProtocolFamily,
    /// Client network address.
    pub client_addr: SocketAddr,
    /// Ack quirks on the client-to-Telegram direction.
    pub read_hacks: AckHacks,
    /// Ack quirks on the Telegram-to-client direction.
    pub write_hacks: AckHacks,
}

impl ConnectionOpts {
    pub fn new(dc: i16, transport: ProtoTag, client_addr: SocketAddr) -> Self {
        Self {
            dc,
            transport,
            protocol: ProtocolFamily::Any,
            client_addr,
            read_hacks: AckHacks::default(),
            write_hacks: AckHacks::default(),
        }
    }
}
