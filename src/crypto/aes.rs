//! AES primitives for the two proxy channels
//!
//! The client channel runs AES-256-CTR keystreams in both directions; the
//! middle-proxy channel runs AES-256-CBC over CRC-framed RPC messages.

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use cbc::{Decryptor as CbcDecryptor, Encryptor as CbcEncryptor};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

use crate::error::{ProxyError, Result};

type Aes256Ctr = Ctr128BE<Aes256>;
type Aes256CbcEnc = CbcEncryptor<Aes256>;
type Aes256CbcDec = CbcDecryptor<Aes256>;

/// AES-256-CTR keystream.
///
/// The stream position advances monotonically across calls; a single
/// instance must only ever be driven by one direction of one connection.
pub struct AesCtr {
    cipher: Aes256Ctr,
}

impl AesCtr {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self {
            cipher: Aes256Ctr::new(key.into(), iv.into()),
        }
    }

    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| ProxyError::InvalidKeyLength {
            expected: 32,
            got: key.len(),
        })?;
        let iv: [u8; 16] = iv.try_into().map_err(|_| ProxyError::InvalidKeyLength {
            expected: 16,
            got: iv.len(),
        })?;
        Ok(Self::new(&key, &iv))
    }

    /// Apply the keystream in place. CTR is symmetric: the same call
    /// encrypts and decrypts.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

/// One direction of the AES-256-CBC middle-proxy channel.
///
/// The IV chains across calls: after each operation it becomes the last
/// ciphertext block, so a single instance tracks one continuous stream.
pub struct AesCbc {
    key: [u8; 32],
    iv: [u8; 16],
}

impl AesCbc {
    pub fn new(key: [u8; 32], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Encrypt whole blocks in place, advancing the chained IV.
    pub fn encrypt_blocks(&mut self, data: &mut [u8]) -> Result<()> {
        self.check_aligned(data)?;
        if data.is_empty() {
            return Ok(());
        }

        let mut enc = Aes256CbcEnc::new((&self.key).into(), (&self.iv).into());
        for chunk in data.chunks_mut(16) {
            enc.encrypt_block_mut(chunk.into());
        }
        self.iv.copy_from_slice(&data[data.len() - 16..]);
        Ok(())
    }

    /// Decrypt whole blocks in place, advancing the chained IV.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) -> Result<()> {
        self.check_aligned(data)?;
        if data.is_empty() {
            return Ok(());
        }

        let mut next_iv = [0u8; 16];
        next_iv.copy_from_slice(&data[data.len() - 16..]);

        let mut dec = Aes256CbcDec::new((&self.key).into(), (&self.iv).into());
        for chunk in data.chunks_mut(16) {
            dec.decrypt_block_mut(chunk.into());
        }
        self.iv = next_iv;
        Ok(())
    }

    fn check_aligned(&self, data: &[u8]) -> Result<()> {
        if data.len() % 16 != 0 {
            return Err(ProxyError::Crypto(format!(
                "CBC data must be aligned to 16 bytes, got {}",
                data.len()
            )));
        }
        Ok(())
    }
}
