//! Key file parsing, generation, and serialization.
//!
//! Binary layout (format version 2):
//! ```text
//! [12 bytes: "\0GITCRYPTKEY"][4 bytes: format version, big-endian]
//! header fields:  (id: u32 BE, len: u32 BE, payload) ... terminated by id 0
//! key entries:    each a field sequence terminated by id 0, repeated to EOF
//! ```
//!
//! Header field 1 is the optional key name. Entry field 1 is the version
//! (4 bytes BE), field 3 the AES-256 key (32 bytes), field 5 the HMAC key
//! (64 bytes). Unknown fields follow an odd/even discipline: odd ids are
//! critical and make the file unreadable by this version, even ids are
//! skipped. This is the format's forward-compatibility mechanism and the
//! parity rule must never change.
//!
//! The pre-versioning legacy format is accepted on read only: exactly
//! 96 bytes, AES key at offset 0, HMAC key at offset 32, version 0.

use std::collections::BTreeMap;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::{AES_KEY_LEN, HMAC_KEY_LEN};
use git_crypt_core::bytes::{constant_time_eq, load_be32, wipe};
use git_crypt_core::{GitCryptError, Result};

/// Current key-file format version.
pub const FORMAT_VERSION: u32 = 2;

/// Longest accepted key name, in bytes.
pub const KEY_NAME_MAX_LEN: usize = 128;

const PREAMBLE: &[u8; 12] = b"\0GITCRYPTKEY";
const MAX_FIELD_LEN: u32 = 1 << 20;
const LEGACY_LEN: usize = AES_KEY_LEN + HMAC_KEY_LEN;

const FIELD_END: u32 = 0;
const HEADER_FIELD_KEY_NAME: u32 = 1;
const KEY_FIELD_VERSION: u32 = 1;
const KEY_FIELD_AES_KEY: u32 = 3;
const KEY_FIELD_HMAC_KEY: u32 = 5;

/// How the parser treats a field id it encounters.
#[derive(Debug, PartialEq, Eq)]
enum FieldKind {
    Recognized,
    SkippableUnknown,
    CriticalUnknown,
}

fn classify(id: u32, recognized: &[u32]) -> FieldKind {
    if recognized.contains(&id) {
        FieldKind::Recognized
    } else if id % 2 == 0 {
        FieldKind::SkippableUnknown
    } else {
        FieldKind::CriticalUnknown
    }
}

/// Check a key name against the naming rules: non-empty, at most 128 bytes,
/// no control characters, no path separators, no colon.
pub fn validate_key_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GitCryptError::InvalidKeyName("key name may not be empty"));
    }
    if name.len() > KEY_NAME_MAX_LEN {
        return Err(GitCryptError::InvalidKeyName(
            "key name is longer than 128 bytes",
        ));
    }
    for byte in name.bytes() {
        if byte < 0x20 || byte == 0x7F {
            return Err(GitCryptError::InvalidKeyName(
                "key name may not contain control characters",
            ));
        }
        if byte == b'/' || byte == b'\\' {
            return Err(GitCryptError::InvalidKeyName(
                "key name may not contain path separators",
            ));
        }
        if byte == b':' {
            return Err(GitCryptError::InvalidKeyName(
                "key name may not contain ':'",
            ));
        }
    }
    Ok(())
}

// ── key entry ────────────────────────────────────────────────────────────────

/// One (version, AES key, HMAC key) triple. Secrets are wiped on drop.
#[derive(Clone)]
pub struct KeyEntry {
    version: u32,
    aes_key: [u8; AES_KEY_LEN],
    hmac_key: [u8; HMAC_KEY_LEN],
}

impl KeyEntry {
    /// Fresh entry with OS-random key material.
    pub fn generate(version: u32) -> Self {
        let mut aes_key = [0u8; AES_KEY_LEN];
        let mut hmac_key = [0u8; HMAC_KEY_LEN];
        OsRng.fill_bytes(&mut aes_key);
        OsRng.fill_bytes(&mut hmac_key);
        Self {
            version,
            aes_key,
            hmac_key,
        }
    }

    pub fn from_parts(
        version: u32,
        aes_key: [u8; AES_KEY_LEN],
        hmac_key: [u8; HMAC_KEY_LEN],
    ) -> Self {
        Self {
            version,
            aes_key,
            hmac_key,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn aes_key(&self) -> &[u8; AES_KEY_LEN] {
        &self.aes_key
    }

    pub fn hmac_key(&self) -> &[u8; HMAC_KEY_LEN] {
        &self.hmac_key
    }

    fn parse(r: &mut Reader<'_>) -> Result<Self> {
        let mut version: Option<u32> = None;
        let mut aes_key: Option<[u8; AES_KEY_LEN]> = None;
        let mut hmac_key: Option<[u8; HMAC_KEY_LEN]> = None;

        loop {
            let id = r
                .read_u32()
                .ok_or(GitCryptError::MalformedKeyFile("truncated key entry"))?;
            if id == FIELD_END {
                break;
            }
            let len = r
                .read_u32()
                .ok_or(GitCryptError::MalformedKeyFile("truncated key field"))?;
            if len > MAX_FIELD_LEN {
                return Err(GitCryptError::MalformedKeyFile("oversized key field"));
            }
            let payload = r
                .take(len as usize)
                .ok_or(GitCryptError::MalformedKeyFile("truncated key field"))?;

            match classify(id, &[KEY_FIELD_VERSION, KEY_FIELD_AES_KEY, KEY_FIELD_HMAC_KEY]) {
                FieldKind::Recognized => match id {
                    KEY_FIELD_VERSION => {
                        if payload.len() != 4 {
                            return Err(GitCryptError::MalformedKeyFile(
                                "key version field must be 4 bytes",
                            ));
                        }
                        version = Some(load_be32(payload));
                    }
                    KEY_FIELD_AES_KEY => {
                        if payload.len() != AES_KEY_LEN {
                            return Err(GitCryptError::MalformedKeyFile(
                                "AES key field must be 32 bytes",
                            ));
                        }
                        let mut key = [0u8; AES_KEY_LEN];
                        key.copy_from_slice(payload);
                        aes_key = Some(key);
                    }
                    KEY_FIELD_HMAC_KEY => {
                        if payload.len() != HMAC_KEY_LEN {
                            return Err(GitCryptError::MalformedKeyFile(
                                "HMAC key field must be 64 bytes",
                            ));
                        }
                        let mut key = [0u8; HMAC_KEY_LEN];
                        key.copy_from_slice(payload);
                        hmac_key = Some(key);
                    }
                    _ => unreachable!("classified as recognized"),
                },
                FieldKind::SkippableUnknown => {}
                FieldKind::CriticalUnknown => {
                    return Err(GitCryptError::IncompatibleKeyFile(format!(
                        "unknown critical key field {id}"
                    )));
                }
            }
        }

        match (version, aes_key, hmac_key) {
            (Some(version), Some(aes_key), Some(hmac_key)) => Ok(Self {
                version,
                aes_key,
                hmac_key,
            }),
            _ => Err(GitCryptError::MalformedKeyFile(
                "key entry is missing a mandatory field",
            )),
        }
    }

    fn store(&self, out: &mut Vec<u8>) {
        push_field(out, KEY_FIELD_VERSION, &self.version.to_be_bytes());
        push_field(out, KEY_FIELD_AES_KEY, &self.aes_key);
        push_field(out, KEY_FIELD_HMAC_KEY, &self.hmac_key);
        out.extend_from_slice(&FIELD_END.to_be_bytes());
    }
}

impl Drop for KeyEntry {
    fn drop(&mut self) {
        wipe(&mut self.aes_key);
        wipe(&mut self.hmac_key);
    }
}

impl PartialEq for KeyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && constant_time_eq(&self.aes_key, &other.aes_key)
            && constant_time_eq(&self.hmac_key, &other.hmac_key)
    }
}

impl Eq for KeyEntry {}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("version", &self.version)
            .field("aes_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

// ── key file ─────────────────────────────────────────────────────────────────

/// A named (or default) collection of key entries, newest version last added.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KeyFile {
    name: Option<String>,
    entries: BTreeMap<u32, KeyEntry>,
}

impl KeyFile {
    /// Empty key file for the default key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty key file for a named key; the name is validated here.
    pub fn with_name(name: &str) -> Result<Self> {
        validate_key_name(name)?;
        Ok(Self {
            name: Some(name.to_string()),
            entries: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_filled(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Generate and add a fresh entry; version is one past the newest
    /// (0 for an empty file). Returns the new version.
    pub fn generate(&mut self) -> u32 {
        let version = self
            .entries
            .keys()
            .next_back()
            .map(|latest| latest + 1)
            .unwrap_or(0);
        let entry = KeyEntry::generate(version);
        self.entries.insert(version, entry);
        version
    }

    /// Insert an entry by version. Replacing an existing version is an error:
    /// old ciphertext must stay decryptable.
    pub fn add(&mut self, entry: KeyEntry) -> Result<()> {
        if self.entries.contains_key(&entry.version) {
            return Err(GitCryptError::MalformedKeyFile("duplicate key version"));
        }
        self.entries.insert(entry.version, entry);
        Ok(())
    }

    /// The entry with the highest version.
    pub fn latest(&self) -> Result<&KeyEntry> {
        self.entries
            .values()
            .next_back()
            .ok_or(GitCryptError::KeyUnavailable)
    }

    pub fn get(&self, version: u32) -> Option<&KeyEntry> {
        self.entries.get(&version)
    }

    /// Entries in descending version order, the order decryption tries them.
    pub fn entries_desc(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.values().rev()
    }

    /// Parse a key file: the versioned format when the preamble matches,
    /// otherwise the 96-byte legacy layout.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.starts_with(PREAMBLE) {
            Self::parse_current(data)
        } else {
            Self::parse_legacy(data)
        }
    }

    fn parse_current(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.take(PREAMBLE.len())
            .ok_or(GitCryptError::MalformedKeyFile("truncated preamble"))?;
        let format = r
            .read_u32()
            .ok_or(GitCryptError::MalformedKeyFile("truncated preamble"))?;
        if format != FORMAT_VERSION {
            return Err(GitCryptError::IncompatibleKeyFile(format!(
                "format version {format}"
            )));
        }

        let mut name: Option<String> = None;
        loop {
            let id = r
                .read_u32()
                .ok_or(GitCryptError::MalformedKeyFile("truncated header"))?;
            if id == FIELD_END {
                break;
            }
            let len = r
                .read_u32()
                .ok_or(GitCryptError::MalformedKeyFile("truncated header field"))?;
            if len > MAX_FIELD_LEN {
                return Err(GitCryptError::MalformedKeyFile("oversized header field"));
            }
            let payload = r
                .take(len as usize)
                .ok_or(GitCryptError::MalformedKeyFile("truncated header field"))?;

            match classify(id, &[HEADER_FIELD_KEY_NAME]) {
                FieldKind::Recognized => {
                    let value = std::str::from_utf8(payload)
                        .map_err(|_| GitCryptError::InvalidKeyName("key name is not UTF-8"))?;
                    validate_key_name(value)?;
                    name = Some(value.to_string());
                }
                FieldKind::SkippableUnknown => {}
                FieldKind::CriticalUnknown => {
                    return Err(GitCryptError::IncompatibleKeyFile(format!(
                        "unknown critical header field {id}"
                    )));
                }
            }
        }

        let mut file = Self {
            name,
            entries: BTreeMap::new(),
        };
        while !r.is_empty() {
            let entry = KeyEntry::parse(&mut r)?;
            file.add(entry)?;
        }
        Ok(file)
    }

    fn parse_legacy(data: &[u8]) -> Result<Self> {
        if data.len() != LEGACY_LEN {
            return Err(GitCryptError::MalformedKeyFile(
                "not a key file (wrong length for the legacy layout)",
            ));
        }
        let mut aes_key = [0u8; AES_KEY_LEN];
        let mut hmac_key = [0u8; HMAC_KEY_LEN];
        aes_key.copy_from_slice(&data[..AES_KEY_LEN]);
        hmac_key.copy_from_slice(&data[AES_KEY_LEN..]);

        let mut file = Self::new();
        file.add(KeyEntry::from_parts(0, aes_key, hmac_key))?;
        Ok(file)
    }

    /// Serialize in the current format. Round-trips byte-identically through
    /// [`KeyFile::parse`]; entries are emitted newest first.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(PREAMBLE);
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        if let Some(name) = &self.name {
            push_field(&mut out, HEADER_FIELD_KEY_NAME, name.as_bytes());
        }
        out.extend_from_slice(&FIELD_END.to_be_bytes());
        for entry in self.entries.values().rev() {
            entry.store(&mut out);
        }
        out
    }
}

fn push_field(out: &mut Vec<u8>, id: u32, payload: &[u8]) {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Bounds-checked cursor over the input; every read is explicit so a
/// truncated file can never index past the end.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(load_be32)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_file(name: Option<&str>, versions: &[u32]) -> KeyFile {
        let mut file = match name {
            Some(n) => KeyFile::with_name(n).unwrap(),
            None => KeyFile::new(),
        };
        for &v in versions {
            file.add(KeyEntry::generate(v)).unwrap();
        }
        file
    }

    #[test]
    fn generate_starts_at_zero_and_increments() {
        let mut file = KeyFile::new();
        assert!(!file.is_filled());
        assert_eq!(file.generate(), 0);
        assert_eq!(file.generate(), 1);
        assert!(file.is_filled());
        assert_eq!(file.latest().unwrap().version(), 1);
    }

    #[test]
    fn add_duplicate_version_fails() {
        let mut file = KeyFile::new();
        file.add(KeyEntry::generate(3)).unwrap();
        let err = file.add(KeyEntry::generate(3)).unwrap_err();
        assert!(matches!(err, GitCryptError::MalformedKeyFile(_)));
    }

    #[test]
    fn latest_on_empty_file_fails() {
        let file = KeyFile::new();
        assert!(matches!(
            file.latest().unwrap_err(),
            GitCryptError::KeyUnavailable
        ));
    }

    #[test]
    fn named_file_roundtrip() {
        let file = filled_file(Some("team-A"), &[1, 2]);
        let bytes = file.serialize();
        let parsed = KeyFile::parse(&bytes).unwrap();

        assert_eq!(parsed.name(), Some("team-A"));
        assert_eq!(parsed.latest().unwrap().version(), 2);
        assert_eq!(
            parsed.get(1).unwrap().aes_key(),
            file.get(1).unwrap().aes_key()
        );
        assert_eq!(parsed, file);
    }

    #[test]
    fn serialization_is_byte_stable() {
        let file = filled_file(Some("prod"), &[0, 1, 5]);
        let first = file.serialize();
        let second = KeyFile::parse(&first).unwrap().serialize();
        assert_eq!(first, second);
    }

    #[test]
    fn entries_serialize_newest_first() {
        let file = filled_file(None, &[1, 2]);
        let bytes = file.serialize();
        // preamble (12) + format (4) + header end (4) = 20; first entry's
        // version field is (id, len, payload) = 8 bytes in, payload 4 bytes.
        assert_eq!(load_be32(&bytes[28..]), 2);
    }

    #[test]
    fn legacy_ninety_six_bytes_parses_as_version_zero() {
        let mut raw = [0u8; 96];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        let file = KeyFile::parse(&raw).unwrap();
        assert_eq!(file.name(), None);
        let entry = file.latest().unwrap();
        assert_eq!(entry.version(), 0);
        assert_eq!(&entry.aes_key()[..], &raw[..32]);
        assert_eq!(&entry.hmac_key()[..], &raw[32..]);
    }

    #[test]
    fn legacy_with_trailing_byte_is_malformed() {
        let raw = [0u8; 97];
        assert!(matches!(
            KeyFile::parse(&raw).unwrap_err(),
            GitCryptError::MalformedKeyFile(_)
        ));
    }

    #[test]
    fn truncated_entry_is_malformed() {
        let file = filled_file(None, &[0]);
        let mut bytes = file.serialize();
        // Drop the entry's end marker.
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(
            KeyFile::parse(&bytes).unwrap_err(),
            GitCryptError::MalformedKeyFile(_)
        ));
    }

    #[test]
    fn entry_missing_mandatory_field_is_malformed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());
        // Entry with only a version field.
        push_field(&mut bytes, KEY_FIELD_VERSION, &0u32.to_be_bytes());
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());

        assert!(matches!(
            KeyFile::parse(&bytes).unwrap_err(),
            GitCryptError::MalformedKeyFile(_)
        ));
    }

    #[test]
    fn unknown_even_header_field_is_skipped() {
        let file = filled_file(None, &[0]);
        let entry_bytes = {
            let all = file.serialize();
            all[20..].to_vec()
        };

        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        push_field(&mut bytes, 6, b"future metadata");
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());
        bytes.extend_from_slice(&entry_bytes);

        let parsed = KeyFile::parse(&bytes).unwrap();
        assert_eq!(parsed.latest().unwrap(), file.latest().unwrap());
    }

    #[test]
    fn unknown_odd_header_field_is_incompatible() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        push_field(&mut bytes, 7, b"critical extension");
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());

        assert!(matches!(
            KeyFile::parse(&bytes).unwrap_err(),
            GitCryptError::IncompatibleKeyFile(_)
        ));
    }

    #[test]
    fn unknown_even_entry_field_is_skipped() {
        let file = filled_file(None, &[4]);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());
        push_field(&mut bytes, KEY_FIELD_VERSION, &4u32.to_be_bytes());
        push_field(&mut bytes, 8, &[0xEE; 10]);
        push_field(&mut bytes, KEY_FIELD_AES_KEY, file.get(4).unwrap().aes_key());
        push_field(
            &mut bytes,
            KEY_FIELD_HMAC_KEY,
            file.get(4).unwrap().hmac_key(),
        );
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());

        let parsed = KeyFile::parse(&bytes).unwrap();
        assert_eq!(parsed.get(4).unwrap(), file.get(4).unwrap());
    }

    #[test]
    fn unknown_odd_entry_field_is_incompatible() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());
        push_field(&mut bytes, 9, &[1, 2, 3]);
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());

        assert!(matches!(
            KeyFile::parse(&bytes).unwrap_err(),
            GitCryptError::IncompatibleKeyFile(_)
        ));
    }

    #[test]
    fn oversized_field_is_malformed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&(MAX_FIELD_LEN + 1).to_be_bytes());

        assert!(matches!(
            KeyFile::parse(&bytes).unwrap_err(),
            GitCryptError::MalformedKeyFile(_)
        ));
    }

    #[test]
    fn unsupported_format_version_is_incompatible() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&FIELD_END.to_be_bytes());

        assert!(matches!(
            KeyFile::parse(&bytes).unwrap_err(),
            GitCryptError::IncompatibleKeyFile(_)
        ));
    }

    #[test]
    fn key_name_rules() {
        assert!(validate_key_name("team-A").is_ok());
        assert!(validate_key_name(&"x".repeat(128)).is_ok());

        assert!(validate_key_name("").is_err());
        assert!(validate_key_name(&"x".repeat(129)).is_err());
        assert!(validate_key_name("a/b").is_err());
        assert!(validate_key_name("a\\b").is_err());
        assert!(validate_key_name("a:b").is_err());
        assert!(validate_key_name("a\tb").is_err());
        assert!(validate_key_name("a\x7fb").is_err());
    }

    #[test]
    fn debug_output_redacts_key_material() {
        let entry = KeyEntry::generate(0);
        let rendered = format!("{entry:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("aes_key: ["));
    }
}
