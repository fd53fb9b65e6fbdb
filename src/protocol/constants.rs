//! Wire constants: obfuscated2 frame layout, transport tags, DC endpoints,
//! middle-proxy RPC tags and flags.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use once_cell::sync::Lazy;

// ============= Obfuscated2 frame layout =============

/// Total length of the client (and upstream) handshake frame.
pub const HANDSHAKE_FRAME_LEN: usize = 64;
/// Offset of the 32-byte key material inside the frame.
pub const FRAME_KEY_POS: usize = 8;
/// Length of the key material.
pub const FRAME_KEY_LEN: usize = 32;
/// Length of the IV following the key material.
pub const FRAME_IV_LEN: usize = 16;
/// Offset of the 4-byte transport tag in the decrypted frame.
pub const FRAME_TAG_POS: usize = 56;
/// Offset of the little-endian i16 DC id in the decrypted frame.
pub const FRAME_DC_POS: usize = 60;

/// First bytes a generated upstream nonce must avoid.
pub const RESERVED_FIRST_BYTES: [u8; 1] = [0xef];

/// Four-byte heads a generated upstream nonce must avoid: plain-HTTP verbs
/// and the transport tags themselves.
pub const RESERVED_HEADS: [[u8; 4]; 6] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    *b"OPTI",
    [0xdd, 0xdd, 0xdd, 0xdd],
    [0xee, 0xee, 0xee, 0xee],
];

/// Bytes [4..8) of a generated upstream nonce must not be all zero.
pub const RESERVED_CONTINUATION: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

// ============= Transport tags =============

pub const TAG_ABRIDGED: [u8; 4] = [0xef, 0xef, 0xef, 0xef];
pub const TAG_INTERMEDIATE: [u8; 4] = [0xee, 0xee, 0xee, 0xee];
pub const TAG_SECURE: [u8; 4] = [0xdd, 0xdd, 0xdd, 0xdd];

/// Client transport variant announced in the obfuscated2 handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoTag {
    Abridged,
    Intermediate,
    /// Padded intermediate.
    Secure,
}

impl ProtoTag {
    pub fn from_bytes(bytes: [u8; 4]) -> Option<Self> {
        match bytes {
            TAG_ABRIDGED => Some(ProtoTag::Abridged),
            TAG_INTERMEDIATE => Some(ProtoTag::Intermediate),
            TAG_SECURE => Some(ProtoTag::Secure),
            _ => None,
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        match self {
            ProtoTag::Abridged => TAG_ABRIDGED,
            ProtoTag::Intermediate => TAG_INTERMEDIATE,
            ProtoTag::Secure => TAG_SECURE,
        }
    }
}

// ============= Telegram datacenters =============

pub const TG_DATACENTER_PORT: u16 = 443;

pub static TG_DATACENTERS_V4: Lazy<Vec<Ipv4Addr>> = Lazy::new(|| {
    vec![
        "149.154.175.50".parse().unwrap(),
        "149.154.167.51".parse().unwrap(),
        "149.154.175.100".parse().unwrap(),
        "149.154.167.91".parse().unwrap(),
        "149.154.171.5".parse().unwrap(),
    ]
});

pub static TG_DATACENTERS_V6: Lazy<Vec<Ipv6Addr>> = Lazy::new(|| {
    vec![
        "2001:b28:f23d:f001::a".parse().unwrap(),
        "2001:67c:4e8:f002::a".parse().unwrap(),
        "2001:b28:f23d:f003::a".parse().unwrap(),
        "2001:67c:4e8:f004::a".parse().unwrap(),
        "2001:b28:f23f:f005::a".parse().unwrap(),
    ]
});

/// Staging datacenters, selected by negative DC ids.
pub static TG_TEST_DATACENTERS_V4: Lazy<Vec<Ipv4Addr>> = Lazy::new(|| {
    vec![
        "149.154.175.10".parse().unwrap(),
        "149.154.167.40".parse().unwrap(),
        "149.154.175.117".parse().unwrap(),
    ]
});

pub static TG_TEST_DATACENTERS_V6: Lazy<Vec<Ipv6Addr>> = Lazy::new(|| {
    vec![
        "2001:b28:f23d:f001::e".parse().unwrap(),
        "2001:67c:4e8:f002::e".parse().unwrap(),
        "2001:b28:f23d:f003::e".parse().unwrap(),
    ]
});

/// Validity range for DC ids in the client handshake.
pub fn known_dc(dc: i16) -> bool {
    let idx = dc.unsigned_abs() as usize;
    idx >= 1 && idx <= TG_DATACENTERS_V4.len()
}

pub fn dc_addr_v4(dc: i16) -> Option<IpAddr> {
    let idx = (dc.unsigned_abs() as usize).checked_sub(1)?;
    let table: &[Ipv4Addr] = if dc < 0 {
        &TG_TEST_DATACENTERS_V4
    } else {
        &TG_DATACENTERS_V4
    };
    table.get(idx).map(|ip| IpAddr::V4(*ip))
}

pub fn dc_addr_v6(dc: i16) -> Option<IpAddr> {
    let idx = (dc.unsigned_abs() as usize).checked_sub(1)?;
    let table: &[Ipv6Addr] = if dc < 0 {
        &TG_TEST_DATACENTERS_V6
    } else {
        &TG_DATACENTERS_V6
    };
    table.get(idx).map(|ip| IpAddr::V6(*ip))
}

// ============= Middle-proxy RPC protocol =============

pub const RPC_NONCE: u32 = 0x7acb_87aa;
pub const RPC_HANDSHAKE: u32 = 0x7682_eef5;
pub const RPC_PROXY_REQ: u32 = 0x36ce_f1ee;
pub const RPC_PROXY_ANS: u32 = 0x4403_da0d;
pub const RPC_SIMPLE_ACK: u32 = 0x3bac_409b;
pub const RPC_CLOSE_EXT: u32 = 0x5eb6_34a2;
pub const RPC_CLOSE_CONN: u32 = 0x1fcf_425d;
pub const RPC_PING: u32 = 0x5730_a2df;
pub const RPC_PONG: u32 = 0x8430_eaa7;

/// Crypto schema selector inside RPC_NONCE: AES-256-CBC.
pub const RPC_CRYPTO_AES: u32 = 0x01;

/// Sequence numbers of the two plaintext/first-encrypted handshake frames.
pub const RPC_SEQ_NONCE: i32 = -2;
pub const RPC_SEQ_HANDSHAKE: i32 = -1;

/// RPC_PROXY_REQ flag bits.
pub const RPC_FLAG_HAS_AD_TAG: u32 = 0x8;
pub const RPC_FLAG_MAGIC: u32 = 0x1000;
pub const RPC_FLAG_EXT_MODE_2: u32 = 0x2_0000;
pub const RPC_FLAG_PAD: u32 = 0x800_0000;
pub const RPC_FLAG_INTERMEDIATE: u32 = 0x2000_0000;
pub const RPC_FLAG_ABRIDGED: u32 = 0x4000_0000;
pub const RPC_FLAG_QUICK_ACK: u32 = 0x8000_0000;

/// TL tag introducing the ad-tag string in the RPC_PROXY_REQ extra section.
pub const TL_PROXY_TAG: u32 = 0xae26_fe3e;

/// Bounds on a middle-proxy RPC frame (length word included).
pub const RPC_FRAME_MIN_LEN: usize = 12;
pub const RPC_FRAME_MAX_LEN: usize = 1 << 24;

/// CBC alignment padding bytes appended after the CRC trailer.
pub const RPC_PADDING: [u8; 4] = [0x04, 0x00, 0x00, 0x00];

/// Base flags for every proxy request; the transport bits vary per tag.
pub fn rpc_proxy_req_flags(tag: ProtoTag) -> u32 {
    let base = RPC_FLAG_HAS_AD_TAG | RPC_FLAG_MAGIC | RPC_FLAG_EXT_MODE_2;
    match tag {
        ProtoTag::Abridged => base | RPC_FLAG_ABRIDGED,
        ProtoTag::Intermediate => base | RPC_FLAG_INTERMEDIATE,
        ProtoTag::Secure => base | RPC_FLAG_PAD | RPC_FLAG_INTERMEDIATE,
    }
}
