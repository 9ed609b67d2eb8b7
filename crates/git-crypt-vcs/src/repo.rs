//! Repository discovery and the on-disk key store layout.
//!
//! Installed keys live under `<git-dir>/git-crypt/keys/`, one file per key
//! name (`default` for the unnamed key). The directory is created 0o700 and
//! the key files 0o600; nothing under the git dir is ever committed.

use std::path::{Path, PathBuf};

use crate::process::Git;
use git_crypt_core::{GitCryptError, Result};

pub struct Repository {
    git_dir: PathBuf,
    worktree: PathBuf,
}

impl Repository {
    /// Locate the enclosing repository from the current directory.
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| GitCryptError::io_stream("resolving", "current directory", e))?;
        Self::discover_in(&cwd)
    }

    /// Locate the repository enclosing `dir`.
    pub fn discover_in(dir: &Path) -> Result<Self> {
        let git_dir = rev_parse_path(dir, &["rev-parse", "--git-dir"])?;
        let worktree = rev_parse_path(dir, &["rev-parse", "--show-toplevel"])?;
        Ok(Self { git_dir, worktree })
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn worktree(&self) -> &Path {
        &self.worktree
    }

    /// A git builder rooted at the working tree, so pathspecs from the index
    /// resolve no matter where the process was started.
    pub fn git(&self) -> Git {
        Git::new(Some(&self.worktree))
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.git_dir.join("git-crypt").join("keys")
    }

    /// Path of the installed key file for a key name.
    pub fn key_path(&self, key_name: Option<&str>) -> PathBuf {
        self.keys_dir().join(key_name.unwrap_or("default"))
    }

    /// Fail with `WorkingDirectoryDirty` unless the index and working tree
    /// agree with HEAD (untracked files do not count).
    pub fn require_clean(&self) -> Result<()> {
        let out = self
            .git()
            .args(["status", "-uno", "--porcelain"])
            .output()?;
        if out.is_empty() {
            Ok(())
        } else {
            Err(GitCryptError::WorkingDirectoryDirty)
        }
    }
}

fn rev_parse_path(base: &Path, args: &[&str]) -> Result<PathBuf> {
    let out = Git::new(Some(base)).args(args.iter().copied()).output()?;
    let text = String::from_utf8_lossy(&out);
    let trimmed = text.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(GitCryptError::GitFailed {
            command: args.join(" "),
            status: None,
        });
    }
    // `--git-dir` may answer with a path like `.git`, relative to `base`.
    let path = if Path::new(trimmed).is_absolute() {
        PathBuf::from(trimmed)
    } else {
        base.join(trimmed)
    };
    std::fs::canonicalize(&path).map_err(|e| GitCryptError::io("resolving", path, e))
}
