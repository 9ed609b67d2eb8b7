//! git-crypt-crypto: the cryptographic core of git-crypt
//!
//! Encrypted file format:
//! ```text
//! [10 bytes: magic "\0GITCRYPT\0"][12 bytes: nonce][N bytes: AES-256-CTR ciphertext]
//! nonce = first 12 bytes of HMAC-SHA1(hmac_key, plaintext)
//! counter block = nonce (12 bytes) || block index (4 bytes, big-endian, from 0)
//! ```
//!
//! The nonce is a deterministic function of the plaintext and the MAC key, so
//! encrypting the same content under the same key always yields the same
//! bytes (convergent encryption). Git's deduplication and delta machinery
//! keep working, at the usual convergent-encryption cost: an observer can
//! tell when two encrypted files are equal.
//!
//! Key hierarchy:
//! ```text
//! Key file (named or default, format v2, multiple versions for rotation)
//!   └── Key entry: version (u32) + AES-256 key (32 bytes) + HMAC key (64 bytes)
//! ```

pub mod ctr;
pub mod envelope;
pub mod keyfile;
pub mod mac;

pub use ctr::CtrStream;
pub use envelope::{Header, HEADER_LEN, MAGIC};
pub use keyfile::{validate_key_name, KeyEntry, KeyFile};
pub use mac::HmacSha1;

/// Size of an AES-256 cipher key
pub const AES_KEY_LEN: usize = 32;

/// Size of the HMAC-SHA-1 key used for nonce derivation
pub const HMAC_KEY_LEN: usize = 64;

/// Size of an HMAC-SHA-1 digest
pub const DIGEST_LEN: usize = 20;

/// Size of the per-file nonce stored in the envelope
pub const NONCE_LEN: usize = 12;

/// Size of an AES block (and of one counter-mode keystream block)
pub const BLOCK_LEN: usize = 16;
