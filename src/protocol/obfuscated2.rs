//! Obfuscated2 handshake codec
//!
//! The client opens every connection with a 64-byte frame. Bytes [8..56)
//! carry key material for the two AES-256-CTR directions, the trailing
//! bytes carry the transport tag and target DC, readable only after the
//! forward cipher has been derived. The same frame layout, without the
//! shared secret in the key derivation, is used when this proxy dials a
//! datacenter directly.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::crypto::{sha256_pair, AesCtr, SecureRandom};
use crate::error::{ProxyError, Result};

use super::conn_opts::ConnectionOpts;
use super::constants::*;

/// Hard deadline for the client to deliver its handshake frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection cipher pair derived from a client handshake.
///
/// Naming mirrors the client's view: the encryptor tracks the keystream
/// the client encrypts with, so applying it to inbound bytes recovers
/// plaintext; the decryptor transforms outbound bytes for the client.
pub struct Obfuscated2 {
    pub encryptor: AesCtr,
    pub decryptor: AesCtr,
}

/// Read the 64-byte handshake frame, enforcing the handshake deadline.
pub async fn extract_frame<R>(reader: &mut R) -> Result<[u8; HANDSHAKE_FRAME_LEN]>
where
    R: AsyncRead + Unpin,
{
    match timeout(HANDSHAKE_TIMEOUT, read_frame_bytes(reader)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::HandshakeTimeout),
    }
}

async fn read_frame_bytes<R>(reader: &mut R) -> Result<[u8; HANDSHAKE_FRAME_LEN]>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; HANDSHAKE_FRAME_LEN];
    let mut filled = 0usize;
    while filled < HANDSHAKE_FRAME_LEN {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            return Err(ProxyError::Truncated {
                expected: HANDSHAKE_FRAME_LEN,
                got: filled,
            });
        }
        filled += n;
    }
    Ok(frame)
}

/// Parse a client handshake frame against the shared secret.
///
/// Derives both cipher directions, validates the transport tag and
/// extracts the DC id. The returned encryptor has already consumed the
/// frame, so its keystream position lines up with the first payload byte
/// the client sends.
pub fn parse_client_frame(
    secret: &[u8],
    frame: &[u8; HANDSHAKE_FRAME_LEN],
    client_addr: SocketAddr,
) -> Result<(Obfuscated2, ConnectionOpts)> {
    let key_iv = &frame[FRAME_KEY_POS..FRAME_KEY_POS + FRAME_KEY_LEN + FRAME_IV_LEN];

    let enc_key = sha256_pair(secret, &key_iv[..FRAME_KEY_LEN]);
    let enc_iv: [u8; 16] = key_iv[FRAME_KEY_LEN..].try_into().unwrap();

    let reversed: Vec<u8> = key_iv.iter().rev().copied().collect();
    let dec_key = sha256_pair(secret, &reversed[..FRAME_KEY_LEN]);
    let dec_iv: [u8; 16] = reversed[FRAME_KEY_LEN..].try_into().unwrap();

    let mut encryptor = AesCtr::new(&enc_key, &enc_iv);
    let decryptor = AesCtr::new(&dec_key, &dec_iv);

    let mut decrypted = *frame;
    encryptor.apply(&mut decrypted);

    let tag_bytes: [u8; 4] = decrypted[FRAME_TAG_POS..FRAME_TAG_POS + 4].try_into().unwrap();
    let transport =
        ProtoTag::from_bytes(tag_bytes).ok_or(ProxyError::UnknownTransport(tag_bytes))?;

    let dc = i16::from_le_bytes(decrypted[FRAME_DC_POS..FRAME_DC_POS + 2].try_into().unwrap());
    let opts = ConnectionOpts::new(dc, transport, client_addr);

    Ok((Obfuscated2 { encryptor, decryptor }, opts))
}

/// Obfuscated2 handshake this proxy performs toward a datacenter.
pub struct UpstreamObfuscated2 {
    /// The 64 bytes to put on the wire before anything else.
    pub frame: [u8; HANDSHAKE_FRAME_LEN],
    /// Cipher for bytes this proxy sends to the DC.
    pub encryptor: AesCtr,
    /// Cipher for bytes the DC sends back.
    pub decryptor: AesCtr,
}

/// Generate the upstream handshake frame for a direct DC connection.
///
/// Unlike the client side, no secret enters the derivation: the key and
/// IV are the frame's own bytes [8..40) and [40..56), reversed for the
/// return direction. The trailing 8 bytes go out encrypted, so the
/// returned encryptor is already positioned past the frame.
pub fn generate_upstream_frame(rng: &SecureRandom, transport: ProtoTag) -> UpstreamObfuscated2 {
    let mut frame = [0u8; HANDSHAKE_FRAME_LEN];
    loop {
        rng.fill(&mut frame);

        if RESERVED_FIRST_BYTES.contains(&frame[0]) {
            continue;
        }
        let head: [u8; 4] = frame[..4].try_into().unwrap();
        if RESERVED_HEADS.contains(&head) {
            continue;
        }
        let cont: [u8; 4] = frame[4..8].try_into().unwrap();
        if cont == RESERVED_CONTINUATION {
            continue;
        }
        break;
    }

    frame[FRAME_TAG_POS..FRAME_TAG_POS + 4].copy_from_slice(&transport.to_bytes());

    let key_iv = &frame[FRAME_KEY_POS..FRAME_KEY_POS + FRAME_KEY_LEN + FRAME_IV_LEN];
    let enc_key: [u8; 32] = key_iv[..FRAME_KEY_LEN].try_into().unwrap();
    let enc_iv: [u8; 16] = key_iv[FRAME_KEY_LEN..].try_into().unwrap();

    let reversed: Vec<u8> = key_iv.iter().rev().copied().collect();
    let dec_key: [u8; 32] = reversed[..FRAME_KEY_LEN].try_into().unwrap();
    let dec_iv: [u8; 16] = reversed[FRAME_KEY_LEN..].try_into().unwrap();

    let mut encryptor = AesCtr::new(&enc_key, &enc_iv);
    let decryptor = AesCtr::new(&dec_key, &dec_iv);

    // Keep the head in the clear, ship the tail encrypted.
    let mut encrypted = frame;
    encryptor.apply(&mut encrypted);

    let mut wire = frame;
    wire[FRAME_TAG_POS..].copy_from_slice(&encrypted[FRAME_TAG_POS..]);

    UpstreamObfuscated2 {
        frame: wire,
        encryptor,
        decryptor,
    }
}
