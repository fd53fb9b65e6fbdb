//! Client transport framing: abridged, intermediate, padded intermediate
//!
//! Middle-proxy mode must cut the client byte stream into whole MTProto
//! messages (each RPC_PROXY_REQ carries exactly one) and re-frame answers
//! on the way back. These are the pure codec halves of that work; the
//! stream wrapper in `stream::middle` drives them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProxyError, Result};

use super::constants::ProtoTag;

/// Upper bound on a single client message, padding included.
pub const MAX_MESSAGE_LEN: usize = 1 << 24;

/// One message cut out of the client stream.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientMessage {
    pub payload: Bytes,
    /// The client set the quick-ack bit on this message's header.
    pub quick_ack: bool,
}

/// Decode one message from the front of `buf`, consuming its bytes.
///
/// Returns `Ok(None)` when the buffer does not yet hold a whole message.
/// The quick-ack bit is stripped from the header during decoding.
pub fn decode_message(transport: ProtoTag, buf: &mut BytesMut) -> Result<Option<ClientMessage>> {
    match transport {
        ProtoTag::Abridged => decode_abridged(buf),
        ProtoTag::Intermediate | ProtoTag::Secure => decode_intermediate(buf),
    }
}

fn decode_abridged(buf: &mut BytesMut) -> Result<Option<ClientMessage>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let first = buf[0];
    let quick_ack = first & 0x80 != 0;
    let short_len = (first & 0x7f) as usize;

    let (header_len, payload_len) = if short_len < 0x7f {
        (1, short_len * 4)
    } else {
        if buf.len() < 4 {
            return Ok(None);
        }
        let words = u32::from_le_bytes([buf[1], buf[2], buf[3], 0]) as usize;
        (4, words * 4)
    };

    check_len(payload_len)?;
    if buf.len() < header_len + payload_len {
        return Ok(None);
    }

    buf.advance(header_len);
    let payload = buf.split_to(payload_len).freeze();
    Ok(Some(ClientMessage { payload, quick_ack }))
}

fn decode_intermediate(buf: &mut BytesMut) -> Result<Option<ClientMessage>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let quick_ack = word & 0x8000_0000 != 0;
    let payload_len = (word & 0x7fff_ffff) as usize;

    check_len(payload_len)?;
    if buf.len() < 4 + payload_len {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(payload_len).freeze();
    Ok(Some(ClientMessage { payload, quick_ack }))
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_MESSAGE_LEN {
        return Err(ProxyError::InvalidFrameLength {
            len,
            min: 0,
            max: MAX_MESSAGE_LEN,
        });
    }
    Ok(())
}

/// Frame an answer payload for the client.
///
/// `padding` is appended (length included in the header) and only
/// meaningful for the padded-intermediate transport; pass an empty slice
/// otherwise.
pub fn encode_message(
    transport: ProtoTag,
    payload: &[u8],
    padding: &[u8],
    out: &mut BytesMut,
) -> Result<()> {
    match transport {
        ProtoTag::Abridged => {
            if payload.len() % 4 != 0 {
                return Err(ProxyError::InvalidFrameLength {
                    len: payload.len(),
                    min: 0,
                    max: MAX_MESSAGE_LEN,
                });
            }
            let words = payload.len() / 4;
            if words < 0x7f {
                out.put_u8(words as u8);
            } else {
                out.put_u8(0x7f);
                let le = (words as u32).to_le_bytes();
                out.put_slice(&le[..3]);
            }
            out.put_slice(payload);
        }
        ProtoTag::Intermediate => {
            out.put_u32_le(payload.len() as u32);
            out.put_slice(payload);
        }
        ProtoTag::Secure => {
            out.put_u32_le((payload.len() + padding.len()) as u32);
            out.put_slice(payload);
            out.put_slice(padding);
        }
    }
    Ok(())
}

/// Encode the 4-byte simple-ack confirmation for the client.
///
/// Abridged reverses the byte order; the intermediate transports carry
/// the token verbatim.
pub fn encode_simple_ack(transport: ProtoTag, confirm: [u8; 4], out: &mut BytesMut) {
    match transport {
        ProtoTag::Abridged => {
            out.put_slice(&[confirm[3], confirm[2], confirm[1], confirm[0]]);
        }
        ProtoTag::Intermediate | ProtoTag::Secure => {
            out.put_slice(&confirm);
        }
    }
}
