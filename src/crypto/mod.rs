//! Crypto

pub mod aes;
pub mod hash;
pub mod random;

pub use aes::{AesCbc, AesCtr};
pub use hash::{crc32, derive_middleproxy_keys, sha256, sha256_pair};
pub use random::SecureRandom;
