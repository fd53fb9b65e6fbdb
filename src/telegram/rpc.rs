//! Middle-proxy RPC frame codec
//!
//! Every message on the middle-proxy channel rides in a CRC-framed RPC
//! envelope: `[len u32][seq i32][payload][crc32 u32]`, all little-endian,
//! padded to the AES block size with the fixed `04 00 00 00` pattern
//! before CBC encryption. The payload builders here follow the reference
//! byte layouts; the stream wrapper and the dialer drive them.

use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::crc32;
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;

/// Frame a payload: length, sequence number, payload, CRC trailer.
pub fn build_frame(seq: i32, payload: &[u8]) -> Vec<u8> {
    let total = 4 + 4 + payload.len() + 4;
    let mut frame = Vec::with_capacity(total);
    frame.put_u32_le(total as u32);
    frame.put_i32_le(seq);
    frame.put_slice(payload);
    let checksum = crc32(&frame);
    frame.put_u32_le(checksum);
    frame
}

/// Extend a frame to the AES block size with the fixed padding pattern.
pub fn pad_for_cbc(frame: &mut Vec<u8>) {
    let mut i = 0;
    while frame.len() % 16 != 0 {
        frame.push(RPC_PADDING[i % RPC_PADDING.len()]);
        i += 1;
    }
}

/// Pull one frame off the front of `buf`, verifying its CRC.
///
/// Returns `Ok(None)` when the buffer does not yet hold a whole frame.
/// Four-byte noop padding frames are skipped transparently.
pub fn try_parse_frame(buf: &mut BytesMut) -> Result<Option<(i32, Bytes)>> {
    loop {
        if buf.len() < 4 {
            return Ok(None);
        }

        let total = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if total == 4 {
            buf.advance(4);
            continue;
        }
        if !(RPC_FRAME_MIN_LEN..=RPC_FRAME_MAX_LEN).contains(&total) {
            return Err(ProxyError::InvalidFrameLength {
                len: total,
                min: RPC_FRAME_MIN_LEN,
                max: RPC_FRAME_MAX_LEN,
            });
        }
        if buf.len() < total {
            return Ok(None);
        }

        let frame = buf.split_to(total);
        let crc_offset = total - 4;
        let expected = u32::from_le_bytes(frame[crc_offset..].try_into().unwrap());
        let actual = crc32(&frame[..crc_offset]);
        if expected != actual {
            return Err(ProxyError::ChecksumMismatch { expected, got: actual });
        }

        let seq = i32::from_le_bytes(frame[4..8].try_into().unwrap());
        let payload = Bytes::copy_from_slice(&frame[8..crc_offset]);
        return Ok(Some((seq, payload)));
    }
}

/// RPC_NONCE payload: tag, key selector, crypto schema, timestamp, nonce.
pub fn build_nonce_payload(key_selector: u32, crypto_ts: u32, nonce: &[u8; 16]) -> [u8; 32] {
    let mut p = [0u8; 32];
    p[0..4].copy_from_slice(&RPC_NONCE.to_le_bytes());
    p[4..8].copy_from_slice(&key_selector.to_le_bytes());
    p[8..12].copy_from_slice(&RPC_CRYPTO_AES.to_le_bytes());
    p[12..16].copy_from_slice(&crypto_ts.to_le_bytes());
    p[16..32].copy_from_slice(nonce);
    p
}

/// Fields of the server's RPC_NONCE reply.
pub struct NonceReply {
    pub schema: u32,
    pub crypto_ts: u32,
    pub nonce: [u8; 16],
}

pub fn parse_nonce_payload(payload: &[u8]) -> Result<NonceReply> {
    if payload.len() < 32 {
        return Err(ProxyError::UpstreamHandshake {
            step: "rpc_nonce",
            cause: format!("nonce payload too short: {} bytes", payload.len()),
        });
    }
    let tag = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    if tag != RPC_NONCE {
        return Err(ProxyError::UpstreamHandshake {
            step: "rpc_nonce",
            cause: format!("expected RPC_NONCE, got 0x{:08x}", tag),
        });
    }
    Ok(NonceReply {
        schema: u32::from_le_bytes(payload[8..12].try_into().unwrap()),
        crypto_ts: u32::from_le_bytes(payload[12..16].try_into().unwrap()),
        nonce: payload[16..32].try_into().unwrap(),
    })
}

/// RPC_HANDSHAKE payload: flags plus sender and peer process blocks,
/// each `{ip4, port, pid, utime}`.
pub fn build_handshake_payload(
    our_ip: u32,
    our_port: u16,
    peer_ip: u32,
    peer_port: u16,
) -> [u8; 32] {
    let mut p = [0u8; 32];
    p[0..4].copy_from_slice(&RPC_HANDSHAKE.to_le_bytes());
    // flags at [4..8) stay zero

    p[8..12].copy_from_slice(&our_ip.to_le_bytes());
    p[12..14].copy_from_slice(&our_port.to_le_bytes());
    let pid = (std::process::id() & 0xffff) as u16;
    p[14..16].copy_from_slice(&pid.to_le_bytes());
    let utime = unix_time();
    p[16..20].copy_from_slice(&utime.to_le_bytes());

    p[20..24].copy_from_slice(&peer_ip.to_le_bytes());
    p[24..26].copy_from_slice(&peer_port.to_le_bytes());
    p
}

/// RPC_PROXY_REQ payload: flags, connection id, both endpoints as
/// IPv4-mapped-IPv6 + port, the TL-encoded ad-tag, then the client data.
pub fn build_proxy_req(
    flags: u32,
    conn_id: u64,
    client_addr: SocketAddr,
    our_addr: SocketAddr,
    ad_tag: &[u8],
    data: &[u8],
) -> Vec<u8> {
    let mut p = Vec::with_capacity(72 + ad_tag.len() + data.len());

    p.put_u32_le(RPC_PROXY_REQ);
    p.put_u32_le(flags);
    p.put_u64_le(conn_id);

    put_mapped_addr(&mut p, client_addr);
    put_mapped_addr(&mut p, our_addr);

    // Extra section: its byte length, then the TL-string ad-tag.
    let extra_start = p.len();
    p.put_u32_le(0);
    p.put_u32_le(TL_PROXY_TAG);
    put_tl_string(&mut p, ad_tag);
    let extra_len = (p.len() - extra_start - 4) as u32;
    p[extra_start..extra_start + 4].copy_from_slice(&extra_len.to_le_bytes());

    p.put_slice(data);
    p
}

pub fn build_pong(ping_id: i64) -> Vec<u8> {
    let mut p = Vec::with_capacity(12);
    p.put_u32_le(RPC_PONG);
    p.put_i64_le(ping_id);
    p
}

/// The IPv4 address of an endpoint as a big-endian u32; IPv6 peers map to
/// zero unless they carry an IPv4-mapped address.
pub fn ip_as_u32(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| u32::from_be_bytes(v4.octets()))
            .unwrap_or(0),
    }
}

fn put_mapped_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let mut mapped = [0u8; 16];
            mapped[10] = 0xff;
            mapped[11] = 0xff;
            mapped[12..].copy_from_slice(&v4.octets());
            out.put_slice(&mapped);
        }
        IpAddr::V6(v6) => out.put_slice(&v6.octets()),
    }
    out.put_u32_le(addr.port() as u32);
}

fn put_tl_string(out: &mut Vec<u8>, data: &[u8]) {
    if data.len() < 254 {
        out.put_u8(data.len() as u8);
        out.put_slice(data);
        let pad = (4 - (1 + data.len()) % 4) % 4;
        out.put_bytes(0, pad);
    } else {
        out.put_u8(0xfe);
        let len = (data.len() as u32).to_le_bytes();
        out.put_slice(&len[..3]);
        out.put_slice(data);
        let pad = (4 - data.len() % 4) % 4;
        out.put_bytes(0, pad);
    }
}

pub fn unix_time() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = build_frame(RPC_SEQ_NONCE, b"payload-bytes-xy");
        assert_eq!(frame.len(), 4 + 4 + 16 + 4);

        let mut buf = BytesMut::from(&frame[..]);
        let (seq, payload) = try_parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(seq, RPC_SEQ_NONCE);
        assert_eq!(&payload[..], b"payload-bytes-xy");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_crc_rejected_when_corrupted() {
        let mut frame = build_frame(0, b"payload-bytes-xy");
        frame[9] ^= 0x01;

        let mut buf = BytesMut::from(&frame[..]);
        match try_parse_frame(&mut buf) {
            Err(ProxyError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_frame_partial_and_noop_handling() {
        let frame = build_frame(1, b"data4444");

        // Partial: nothing consumed until the whole frame is present.
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(try_parse_frame(&mut buf).unwrap().is_none());

        // Noop padding frames before a real frame are skipped.
        let mut buf = BytesMut::new();
        buf.put_u32_le(4);
        buf.put_u32_le(4);
        buf.put_slice(&frame);
        let (seq, payload) = try_parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(&payload[..], b"data4444");
    }

    #[test]
    fn test_frame_length_bounds() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(8); // below minimum, not a noop
        assert!(try_parse_frame(&mut buf).is_err());
    }

    #[test]
    fn test_cbc_padding_pattern() {
        let mut frame = build_frame(0, b"xyz1"); // 16 bytes, already aligned
        pad_for_cbc(&mut frame);
        assert_eq!(frame.len(), 16);

        let mut frame = build_frame(0, b"xyz12"); // 17 bytes
        pad_for_cbc(&mut frame);
        assert_eq!(frame.len(), 32);
        assert_eq!(&frame[17..21], &RPC_PADDING);
    }

    #[test]
    fn test_nonce_payload_roundtrip() {
        let nonce = [0x42u8; 16];
        let payload = build_nonce_payload(0xdeadbeef, 1234567, &nonce);

        let reply = parse_nonce_payload(&payload).unwrap();
        assert_eq!(reply.schema, RPC_CRYPTO_AES);
        assert_eq!(reply.crypto_ts, 1234567);
        assert_eq!(reply.nonce, nonce);

        assert!(parse_nonce_payload(&payload[..31]).is_err());
        let mut wrong_tag = payload;
        wrong_tag[0] ^= 1;
        assert!(parse_nonce_payload(&wrong_tag).is_err());
    }

    #[test]
    fn test_handshake_payload_layout() {
        let p = build_handshake_payload(0x01020304, 443, 0x0a0b0c0d, 8888);
        assert_eq!(u32::from_le_bytes(p[0..4].try_into().unwrap()), RPC_HANDSHAKE);
        assert_eq!(u32::from_le_bytes(p[4..8].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(p[8..12].try_into().unwrap()), 0x01020304);
        assert_eq!(u16::from_le_bytes(p[12..14].try_into().unwrap()), 443);
        assert_eq!(u32::from_le_bytes(p[20..24].try_into().unwrap()), 0x0a0b0c0d);
        assert_eq!(u16::from_le_bytes(p[24..26].try_into().unwrap()), 8888);
    }

    #[test]
    fn test_proxy_req_layout() {
        let client: SocketAddr = "198.51.100.4:40001".parse().unwrap();
        let ours: SocketAddr = "203.0.113.9:443".parse().unwrap();
        let ad_tag = [0x77u8; 16];
        let data = b"client message bytes";

        let p = build_proxy_req(
            rpc_proxy_req_flags(ProtoTag::Intermediate),
            0x1122334455667788,
            client,
            ours,
            &ad_tag,
            data,
        );

        assert_eq!(u32::from_le_bytes(p[0..4].try_into().unwrap()), RPC_PROXY_REQ);
        assert_eq!(
            u64::from_le_bytes(p[8..16].try_into().unwrap()),
            0x1122334455667788
        );

        // Client address as IPv4-mapped IPv6 + LE port.
        assert_eq!(&p[16 + 10..16 + 12], &[0xff, 0xff]);
        assert_eq!(&p[16 + 12..16 + 16], &[198, 51, 100, 4]);
        assert_eq!(u32::from_le_bytes(p[32..36].try_into().unwrap()), 40001);

        // Extra section: length word, TL tag, then the 16-byte tag as a
        // TL string (1 length byte + 16 bytes + 3 padding).
        let extra_len = u32::from_le_bytes(p[56..60].try_into().unwrap()) as usize;
        assert_eq!(extra_len, 4 + 1 + 16 + 3);
        assert_eq!(u32::from_le_bytes(p[60..64].try_into().unwrap()), TL_PROXY_TAG);
        assert_eq!(p[64], 16);
        assert_eq!(&p[65..81], &ad_tag);

        // Payload rides at the very end.
        assert_eq!(&p[p.len() - data.len()..], data);
        assert_eq!(p.len() % 4, 0);
    }

    #[test]
    fn test_ip_as_u32() {
        let v4: SocketAddr = "1.2.3.4:80".parse().unwrap();
        assert_eq!(ip_as_u32(&v4), 0x01020304);

        let v6: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        assert_eq!(ip_as_u32(&v6), 0);
    }

    #[test]
    fn test_pong_layout() {
        let p = build_pong(-77);
        assert_eq!(u32::from_le_bytes(p[0..4].try_into().unwrap()), RPC_PONG);
        assert_eq!(i64::from_le_bytes(p[4..12].try_into().unwrap()), -77);
    }
}
