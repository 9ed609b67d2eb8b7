//! Incremental HMAC-SHA-1 keyed digest.
//!
//! Used only to derive the per-file nonce from the plaintext, so the 80-bit
//! collision bound of SHA-1 is not a confidentiality concern here: a
//! collision would merely make two files share a nonce, which convergent
//! encryption already accepts for identical files.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::{DIGEST_LEN, HMAC_KEY_LEN};
use git_crypt_core::{GitCryptError, Result};

pub struct HmacSha1 {
    inner: Hmac<Sha1>,
}

impl HmacSha1 {
    /// Key in from exactly 64 bytes of secret; other lengths are rejected.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != HMAC_KEY_LEN {
            return Err(GitCryptError::InvalidKeyLength(key.len()));
        }
        let inner =
            Hmac::<Sha1>::new_from_slice(key).map_err(|_| GitCryptError::InvalidKeyLength(key.len()))?;
        Ok(Self { inner })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consume the state and return the 20-byte tag.
    pub fn finalize(self) -> [u8; DIGEST_LEN] {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&self.inner.finalize().into_bytes());
        out
    }
}

impl std::fmt::Debug for HmacSha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha1").finish_non_exhaustive()
    }
}
