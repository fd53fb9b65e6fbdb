//! Cryptographic hash functions
//!
//! MD5 and SHA-1 appear here because the Telegram middle-proxy key
//! derivation scheme mandates them; they are not used anywhere else.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// SHA-256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over two concatenated inputs, avoiding an intermediate buffer.
pub fn sha256_pair(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// CRC32 (IEEE), used by the middle-proxy RPC frame trailer.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Middle-proxy AES-256-CBC key derivation.
///
/// Builds the reference byte string from both nonces, the client
/// timestamp, the endpoint addresses, the purpose marker (`b"CLIENT"` for
/// the proxy-to-middle direction, `b"SERVER"` for the reverse) and the
/// binary proxy secret, then mixes it with MD5 + SHA-1 as the protocol
/// mandates. Returns (key, iv).
pub fn derive_middleproxy_keys(
    nonce_srv: &[u8; 16],
    nonce_clt: &[u8; 16],
    clt_ts: &[u8; 4],
    srv_ip: &[u8; 4],
    clt_port: &[u8; 2],
    purpose: &[u8],
    clt_ip: &[u8; 4],
    srv_port: &[u8; 2],
    secret: &[u8],
) -> ([u8; 32], [u8; 16]) {
    let mut s = Vec::with_capacity(96 + secret.len());
    s.extend_from_slice(nonce_srv);
    s.extend_from_slice(nonce_clt);
    s.extend_from_slice(clt_ts);
    s.extend_from_slice(srv_ip);
    s.extend_from_slice(clt_port);
    s.extend_from_slice(purpose);
    s.extend_from_slice(clt_ip);
    s.extend_from_slice(srv_port);
    s.extend_from_slice(secret);
    s.extend_from_slice(nonce_srv);
    s.extend_from_slice(nonce_clt);

    let md5_1 = md5(&s[1..]);
    let sha1_sum = sha1(&s);
    let md5_2 = md5(&s[2..]);

    let mut key = [0u8; 32];
    key[..12].copy_from_slice(&md5_1[..12]);
    key[12..].copy_from_slice(&sha1_sum);

    (key, md5_2)
}
