//! AES-256 in counter mode over a byte stream.
//!
//! The 16-byte counter block is `nonce (12 bytes) || block index (4 bytes,
//! big-endian, starting at 0)`. The index is never allowed to wrap: once
//! 2^32 keystream blocks (2^36 bytes) have been produced under one
//! (key, nonce) pair the stream returns `CryptoLimitExceeded` instead of
//! reusing counter values. Encryption and decryption are the same XOR.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;

use crate::{AES_KEY_LEN, BLOCK_LEN, NONCE_LEN};
use git_crypt_core::bytes::wipe;
use git_crypt_core::{GitCryptError, Result};

/// Hard ceiling on the number of bytes one (key, nonce) pair may process.
pub const MAX_STREAM_LEN: u64 = (1u64 << 32) * BLOCK_LEN as u64;

pub struct CtrStream {
    cipher: Aes256,
    nonce: [u8; NONCE_LEN],
    /// Index of the next keystream block to generate.
    next_block: u64,
    keystream: [u8; BLOCK_LEN],
    /// Bytes of `keystream` already consumed; `BLOCK_LEN` means empty.
    used: usize,
}

impl CtrStream {
    /// Build a stream from a 32-byte AES key and a 12-byte nonce.
    ///
    /// Lengths are checked here rather than silently truncated; the key file
    /// guarantees them, but raw callers (tests, future formats) may not.
    pub fn new(key: &[u8], nonce: &[u8]) -> Result<Self> {
        if key.len() != AES_KEY_LEN {
            return Err(GitCryptError::InvalidKeyLength(key.len()));
        }
        if nonce.len() != NONCE_LEN {
            return Err(GitCryptError::InvalidNonceLength(nonce.len()));
        }
        let mut nonce_buf = [0u8; NONCE_LEN];
        nonce_buf.copy_from_slice(nonce);
        Ok(Self {
            cipher: Aes256::new(GenericArray::from_slice(key)),
            nonce: nonce_buf,
            next_block: 0,
            keystream: [0u8; BLOCK_LEN],
            used: BLOCK_LEN,
        })
    }

    /// XOR the keystream into `data` in place. Same call for both directions.
    pub fn process(&mut self, data: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            if self.used == BLOCK_LEN {
                self.refill()?;
            }
            let take = (BLOCK_LEN - self.used).min(data.len() - offset);
            for (byte, pad) in data[offset..offset + take]
                .iter_mut()
                .zip(&self.keystream[self.used..self.used + take])
            {
                *byte ^= pad;
            }
            self.used += take;
            offset += take;
        }
        Ok(())
    }

    fn refill(&mut self) -> Result<()> {
        if self.next_block > u64::from(u32::MAX) {
            return Err(GitCryptError::CryptoLimitExceeded);
        }
        let mut block = [0u8; BLOCK_LEN];
        block[..NONCE_LEN].copy_from_slice(&self.nonce);
        block[NONCE_LEN..].copy_from_slice(&(self.next_block as u32).to_be_bytes());
        let ga = GenericArray::from_mut_slice(&mut block);
        self.cipher.encrypt_block(ga);
        self.keystream.copy_from_slice(&block);
        self.next_block += 1;
        self.used = 0;
        Ok(())
    }
}

impl Drop for CtrStream {
    fn drop(&mut self) {
        wipe(&mut self.keystream);
    }
}

impl std::fmt::Debug for CtrStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrStream")
            .field("next_block", &self.next_block)
            .field("keystream", &"[REDACTED]")
            .finish()
    }
}
