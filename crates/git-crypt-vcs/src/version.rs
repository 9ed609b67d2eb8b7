//! Git version detection.
//!
//! The only capability gate in the tool: `check-attr --stdin -z` (the batch
//! attribute query) needs git 1.8.5 or newer; older installations fall back
//! to one query per path.

use crate::process::Git;
use git_crypt_core::{GitCryptError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl GitVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for GitVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Oldest git whose `check-attr` supports `--stdin -z`.
pub const MIN_BATCH_CHECK_ATTR: GitVersion = GitVersion::new(1, 8, 5);

/// Ask the installed git for its version.
pub fn current() -> Result<GitVersion> {
    let out = Git::new(None).arg("version").output()?;
    let text = String::from_utf8_lossy(&out);
    parse(&text)
}

/// Parse `git version X.Y.Z[.extra] [(vendor)]`.
fn parse(text: &str) -> Result<GitVersion> {
    let protocol_err = || GitCryptError::GitFailed {
        command: "version".to_string(),
        status: None,
    };

    let token = text.split_whitespace().nth(2).ok_or_else(protocol_err)?;
    let mut parts = token.split('.');
    let mut component = |required: bool| -> Result<u32> {
        match parts.next() {
            Some(p) => {
                let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
                if digits.is_empty() {
                    if required {
                        Err(protocol_err())
                    } else {
                        Ok(0)
                    }
                } else {
                    digits.parse().map_err(|_| protocol_err())
                }
            }
            None if required => Err(protocol_err()),
            None => Ok(0),
        }
    };

    Ok(GitVersion {
        major: component(true)?,
        minor: component(true)?,
        patch: component(false)?,
    })
}
