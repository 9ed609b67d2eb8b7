//! The encrypted-file envelope: header detection, the deterministic-nonce
//! encryption pipeline, and decryption with key-version trial.
//!
//! ```text
//! [10 bytes: magic "\0GITCRYPT\0"][12 bytes: nonce][AES-256-CTR body]
//! ```
//!
//! Encryption is two-pass by construction: the nonce is derived from the
//! whole plaintext, so the input is spooled (memory first, then a private
//! temporary file) while the MAC runs, and only then streamed through the
//! cipher. Decryption verifies that re-MACing the recovered plaintext
//! reproduces the nonce before a single output byte is written, trying key
//! versions newest-first so rotated repositories keep working.
//!
//! A stream that does not start with the magic is copied through verbatim;
//! `lock`ed checkouts and never-encrypted files depend on that fall-through.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use tempfile::SpooledTempFile;

use crate::ctr::{CtrStream, MAX_STREAM_LEN};
use crate::keyfile::{KeyEntry, KeyFile};
use crate::mac::HmacSha1;
use crate::NONCE_LEN;
use git_crypt_core::bytes::constant_time_eq;
use git_crypt_core::{GitCryptError, Result};

/// Marker identifying an encrypted file.
pub const MAGIC: &[u8; 10] = b"\0GITCRYPT\0";

/// Magic plus nonce.
pub const HEADER_LEN: usize = MAGIC.len() + NONCE_LEN;

/// Spool contents stay in memory up to this size, then spill to a
/// mode-0600 temporary file that is already unlinked.
const SPOOL_MAX_IN_MEMORY: usize = 32 * 1024 * 1024;

const COPY_BUF_LEN: usize = 64 * 1024;

/// What the first bytes of a stream turned out to be.
pub enum Header {
    /// A well-formed envelope header; the body follows on the stream.
    Encrypted { nonce: [u8; NONCE_LEN] },
    /// Not encrypted (or too short to be); `prefix` holds the bytes
    /// consumed while looking.
    Plaintext { prefix: Vec<u8> },
}

/// Read up to one header's worth of bytes and classify the stream.
pub fn read_header<R: Read>(input: &mut R) -> Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = read_retry(input, &mut buf[filled..], "reading input")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == HEADER_LEN && buf[..MAGIC.len()] == MAGIC[..] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[MAGIC.len()..]);
        Ok(Header::Encrypted { nonce })
    } else {
        Ok(Header::Plaintext {
            prefix: buf[..filled].to_vec(),
        })
    }
}

/// Encrypt `input` into an envelope under one key entry.
///
/// Nothing is written until the whole input has been read and found to be
/// within the cipher's limit, so a failure never leaves partial output.
pub fn encrypt<R: Read, W: Write>(input: &mut R, key: &KeyEntry, output: &mut W) -> Result<()> {
    let mut mac = HmacSha1::new(key.hmac_key())?;
    let mut spool = SpooledTempFile::new(SPOOL_MAX_IN_MEMORY);
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut total: u64 = 0;

    loop {
        let n = read_retry(input, &mut buf, "reading plaintext input")?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
        spool
            .write_all(&buf[..n])
            .map_err(|e| GitCryptError::io_stream("buffering", "plaintext spool", e))?;
        total += n as u64;
    }
    if total > MAX_STREAM_LEN {
        return Err(GitCryptError::CryptoLimitExceeded);
    }

    let digest = mac.finalize();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);

    output
        .write_all(MAGIC)
        .and_then(|()| output.write_all(&nonce))
        .map_err(|e| GitCryptError::io_stream("writing", "encrypted output", e))?;

    let mut stream = CtrStream::new(key.aes_key(), &nonce)?;
    spool
        .seek(SeekFrom::Start(0))
        .map_err(|e| GitCryptError::io_stream("rewinding", "plaintext spool", e))?;
    loop {
        let n = read_retry(&mut spool, &mut buf, "reading plaintext spool")?;
        if n == 0 {
            break;
        }
        stream.process(&mut buf[..n])?;
        output
            .write_all(&buf[..n])
            .map_err(|e| GitCryptError::io_stream("writing", "encrypted output", e))?;
    }
    Ok(())
}

/// Decrypt an envelope body whose header was already consumed.
///
/// Key entries are tried newest-first; the plaintext is only released to
/// `output` after its digest reproduces the nonce.
pub fn decrypt_body<R: Read, W: Write>(
    nonce: &[u8; NONCE_LEN],
    input: &mut R,
    keys: &KeyFile,
    output: &mut W,
) -> Result<()> {
    if !keys.is_filled() {
        return Err(GitCryptError::KeyUnavailable);
    }

    let mut cipher_spool = SpooledTempFile::new(SPOOL_MAX_IN_MEMORY);
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut total: u64 = 0;
    loop {
        let n = read_retry(input, &mut buf, "reading encrypted input")?;
        if n == 0 {
            break;
        }
        cipher_spool
            .write_all(&buf[..n])
            .map_err(|e| GitCryptError::io_stream("buffering", "ciphertext spool", e))?;
        total += n as u64;
    }
    if total > MAX_STREAM_LEN {
        return Err(GitCryptError::CryptoLimitExceeded);
    }

    for entry in keys.entries_desc() {
        cipher_spool
            .seek(SeekFrom::Start(0))
            .map_err(|e| GitCryptError::io_stream("rewinding", "ciphertext spool", e))?;

        let mut plain_spool = SpooledTempFile::new(SPOOL_MAX_IN_MEMORY);
        let mut stream = CtrStream::new(entry.aes_key(), nonce)?;
        let mut mac = HmacSha1::new(entry.hmac_key())?;
        loop {
            let n = read_retry(&mut cipher_spool, &mut buf, "reading ciphertext spool")?;
            if n == 0 {
                break;
            }
            stream.process(&mut buf[..n])?;
            mac.update(&buf[..n]);
            plain_spool
                .write_all(&buf[..n])
                .map_err(|e| GitCryptError::io_stream("buffering", "plaintext spool", e))?;
        }

        let digest = mac.finalize();
        if constant_time_eq(&digest[..NONCE_LEN], nonce) {
            plain_spool
                .seek(SeekFrom::Start(0))
                .map_err(|e| GitCryptError::io_stream("rewinding", "plaintext spool", e))?;
            copy_stream(&mut plain_spool, output, "writing decrypted output")?;
            return Ok(());
        }
    }

    Err(GitCryptError::IntegrityCheckFailed)
}

/// Copy a non-envelope stream through unchanged, starting with the bytes
/// consumed by header detection.
pub fn passthrough<R: Read, W: Write>(prefix: &[u8], input: &mut R, output: &mut W) -> Result<()> {
    output
        .write_all(prefix)
        .map_err(|e| GitCryptError::io_stream("writing", "output", e))?;
    copy_stream(input, output, "writing output")
}

/// Decrypt a whole stream: envelopes are decrypted, everything else is
/// copied verbatim.
pub fn decrypt<R: Read, W: Write>(input: &mut R, keys: &KeyFile, output: &mut W) -> Result<()> {
    match read_header(input)? {
        Header::Encrypted { nonce } => decrypt_body(&nonce, input, keys, output),
        Header::Plaintext { prefix } => passthrough(&prefix, input, output),
    }
}

fn copy_stream<R: Read, W: Write>(input: &mut R, output: &mut W, action: &'static str) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        let n = read_retry(input, &mut buf, "reading input")?;
        if n == 0 {
            return Ok(());
        }
        output
            .write_all(&buf[..n])
            .map_err(|e| GitCryptError::io_stream(action, "stream", e))?;
    }
}

fn read_retry<R: Read>(input: &mut R, buf: &mut [u8], action: &'static str) -> Result<usize> {
    loop {
        match input.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(GitCryptError::io_stream(action, "stream", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_entry(version: u32) -> KeyEntry {
        KeyEntry::generate(version)
    }

    fn file_with(entries: Vec<KeyEntry>) -> KeyFile {
        let mut file = KeyFile::new();
        for e in entries {
            file.add(e).unwrap();
        }
        file
    }

    fn encrypt_vec(data: &[u8], key: &KeyEntry) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt(&mut &data[..], key, &mut out).unwrap();
        out
    }

    #[test]
    fn empty_plaintext_yields_header_only() {
        let key = test_entry(0);
        let sealed = encrypt_vec(b"", &key);
        assert_eq!(sealed.len(), HEADER_LEN);
        assert_eq!(&sealed[..MAGIC.len()], MAGIC);

        let keys = file_with(vec![key]);
        let mut out = Vec::new();
        decrypt(&mut &sealed[..], &keys, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn one_block_plaintext_yields_one_block_body() {
        let key = test_entry(0);
        let sealed = encrypt_vec(&[0xABu8; 16], &key);
        assert_eq!(sealed.len(), HEADER_LEN + 16);
    }

    #[test]
    fn nonce_is_prefix_of_plaintext_hmac() {
        let key = test_entry(0);
        let plaintext = b"deterministic nonce check";
        let sealed = encrypt_vec(plaintext, &key);

        let mut mac = HmacSha1::new(key.hmac_key()).unwrap();
        mac.update(plaintext);
        let digest = mac.finalize();
        assert_eq!(&sealed[MAGIC.len()..HEADER_LEN], &digest[..NONCE_LEN]);
    }

    #[test]
    fn encryption_is_deterministic() {
        let key = test_entry(0);
        let a = encrypt_vec(b"same content", &key);
        let b = encrypt_vec(b"same content", &key);
        assert_eq!(a, b);
    }

    #[test]
    fn different_keys_give_different_ciphertext() {
        let a = encrypt_vec(b"content", &test_entry(0));
        let b = encrypt_vec(b"content", &test_entry(0));
        assert_ne!(a, b, "independent random keys must disagree");
    }

    #[test]
    fn unencrypted_stream_passes_through() {
        let keys = file_with(vec![test_entry(0)]);
        let mut out = Vec::new();
        decrypt(&mut &b"hello"[..], &keys, &mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn stream_shorter_than_header_passes_through() {
        let keys = file_with(vec![test_entry(0)]);
        let input = &MAGIC[..8];
        let mut out = Vec::new();
        decrypt(&mut &input[..], &keys, &mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn wrong_key_fails_without_output() {
        let sealed = encrypt_vec(b"secret", &test_entry(0));
        let other = file_with(vec![test_entry(0)]);

        let mut out = Vec::new();
        let err = decrypt(&mut &sealed[..], &other, &mut out).unwrap_err();
        assert!(matches!(err, GitCryptError::IntegrityCheckFailed));
        assert!(out.is_empty(), "no partial plaintext may be released");
    }

    #[test]
    fn empty_key_file_reports_key_unavailable() {
        let sealed = encrypt_vec(b"secret", &test_entry(0));
        let keys = KeyFile::new();

        let mut out = Vec::new();
        let err = decrypt(&mut &sealed[..], &keys, &mut out).unwrap_err();
        assert!(matches!(err, GitCryptError::KeyUnavailable));
    }

    #[test]
    fn rotated_key_file_decrypts_old_envelopes() {
        let old = test_entry(0);
        let sealed = encrypt_vec(b"written before rotation", &old);

        let keys = file_with(vec![old, test_entry(1)]);
        let mut out = Vec::new();
        decrypt(&mut &sealed[..], &keys, &mut out).unwrap();
        assert_eq!(out, b"written before rotation");
    }

    #[test]
    fn tampered_body_fails_integrity_check() {
        let key = test_entry(0);
        let mut sealed = encrypt_vec(b"tamper target, long enough to matter", &key);
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        let keys = file_with(vec![key]);
        let mut out = Vec::new();
        let err = decrypt(&mut &sealed[..], &keys, &mut out).unwrap_err();
        assert!(matches!(err, GitCryptError::IntegrityCheckFailed));
    }

    proptest! {
        #[test]
        fn roundtrip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let key = KeyEntry::generate(0);
            let sealed = encrypt_vec(&data, &key);
            prop_assert_eq!(sealed.len(), HEADER_LEN + data.len());

            let keys = file_with(vec![key]);
            let mut out = Vec::new();
            decrypt(&mut &sealed[..], &keys, &mut out).unwrap();
            prop_assert_eq!(out, data);
        }

        #[test]
        fn passthrough_is_identity_for_unencrypted_input(
            mut data in proptest::collection::vec(any::<u8>(), 0..1024),
        ) {
            // Ensure the input cannot be mistaken for an envelope.
            if data.first() == Some(&0) {
                data[0] = 1;
            }
            let keys = file_with(vec![KeyEntry::generate(0)]);
            let mut out = Vec::new();
            decrypt(&mut &data[..], &keys, &mut out).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
