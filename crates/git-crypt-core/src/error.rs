use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GitCryptError>;

/// Everything that can go wrong across the workspace.
///
/// Parse and crypto errors bubble up unchanged to the CLI, which maps any
/// error to exit code 1. Lifecycle operations abort at the first error and
/// do not roll back.
#[derive(Debug, Error)]
pub enum GitCryptError {
    /// Structural key-file parse failure: bad preamble, oversized or
    /// truncated field, missing mandatory entry field, duplicate version.
    #[error("malformed key file: {0}")]
    MalformedKeyFile(&'static str),

    /// The key file is well-formed but uses a format we do not understand
    /// (unsupported format version or a critical unknown field).
    #[error("key file is not compatible with this version of git-crypt ({0}); upgrade git-crypt")]
    IncompatibleKeyFile(String),

    #[error("invalid key name: {0}")]
    InvalidKeyName(&'static str),

    #[error("this repository already has a key named '{0}'")]
    AlreadyInitialized(String),

    #[error("key '{0}' is not installed in this repository")]
    NotInitialized(String),

    #[error("working directory not clean; commit or stash your changes first")]
    WorkingDirectoryDirty,

    /// Decryption or encryption was requested but no key file is installed
    /// for the requested key name.
    #[error("unable to find the key for this file; run 'git-crypt unlock' first")]
    KeyUnavailable,

    /// More data than a single (key, nonce) pair may safely encrypt.
    #[error("file too long to encrypt securely under one key")]
    CryptoLimitExceeded,

    /// The envelope decrypted under no installed key entry: either the wrong
    /// key is installed or the ciphertext was modified.
    #[error("encrypted file failed its integrity check (wrong key or modified ciphertext)")]
    IntegrityCheckFailed,

    #[error("invalid cipher key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("invalid nonce length: {0} bytes")]
    InvalidNonceLength(usize),

    /// A git child process exited non-zero or spoke an unexpected protocol.
    #[error("'git {command}' failed{}", fmt_exit_status(.status))]
    GitFailed {
        command: String,
        status: Option<i32>,
    },

    /// Filesystem or stream failure, keeping what we were doing and to what.
    #[error("{action} {target}: {source}")]
    Io {
        action: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },
}

fn fmt_exit_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl GitCryptError {
    /// Wrap an I/O error with the attempted action and a path target.
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GitCryptError::Io {
            action,
            target: path.into().display().to_string(),
            source,
        }
    }

    /// Wrap an I/O error on a non-path target ("standard input", a pipe, ...).
    pub fn io_stream(action: &'static str, target: &str, source: std::io::Error) -> Self {
        GitCryptError::Io {
            action,
            target: target.to_string(),
            source,
        }
    }
}
