//! Forcing files through the smudge filter again.
//!
//! `git checkout -- <paths>` consults the stat cache, so each file's mtime
//! is bumped first to make git consider it stale and rewrite it from the
//! index — through whatever filter configuration is active at that moment.
//! Paths go to git in bounded batches to stay clear of command-line limits.

use std::path::Path;
use std::time::SystemTime;

use tracing::info;

use crate::repo::Repository;
use git_crypt_core::{GitCryptError, Result};

/// Most paths handed to a single `git checkout` invocation.
pub const CHECKOUT_BATCH: usize = 100;

/// Bump a file's modification time to now.
pub fn touch(path: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| GitCryptError::io("touching", path, e))?;
    file.set_modified(SystemTime::now())
        .map_err(|e| GitCryptError::io("touching", path, e))
}

/// Touch and re-checkout the given index-relative paths in batches.
pub fn refresh_paths(repo: &Repository, paths: &[String]) -> Result<()> {
    for batch in paths.chunks(CHECKOUT_BATCH) {
        for path in batch {
            touch(&repo.worktree().join(path))?;
        }
        repo.git()
            .args(["checkout", "--"])
            .args(batch.iter().map(String::as_str))
            .run()?;
    }
    if !paths.is_empty() {
        info!(count = paths.len(), "re-checked out filtered paths");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_updates_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        touch(&path).unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(modified > old + std::time::Duration::from_secs(1800));
    }

    #[test]
    fn touch_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = touch(&dir.path().join("absent")).unwrap_err();
        match err {
            GitCryptError::Io { action, target, .. } => {
                assert_eq!(action, "touching");
                assert!(target.contains("absent"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
