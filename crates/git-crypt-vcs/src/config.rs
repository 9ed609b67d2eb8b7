//! Installing and removing the filter/diff driver configuration.
//!
//! `init` and `unlock` register, per key name:
//! ```text
//! filter.<name>.clean    = "<exe>" clean [--key-name=KEY]
//! filter.<name>.smudge   = "<exe>" smudge [--key-name=KEY]
//! filter.<name>.required = true
//! diff.<name>.textconv   = "<exe>" diff [--key-name=KEY]
//! ```
//! where `<name>` is `git-crypt` or `git-crypt-<KEY>`. The executable path
//! is double-quoted for git's shell.

use std::path::Path;

use tracing::{debug, info};

use crate::repo::Repository;
use git_crypt_core::{GitCryptError, Result};

/// The filter/diff driver name for a key.
pub fn filter_name(key_name: Option<&str>) -> String {
    match key_name {
        None => "git-crypt".to_string(),
        Some(name) => format!("git-crypt-{name}"),
    }
}

/// Quote an argument for git's `sh -c` invocation of filter commands.
pub fn shell_quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for ch in arg.chars() {
        if matches!(ch, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Register the clean/smudge/textconv commands for a key name.
pub fn install(repo: &Repository, key_name: Option<&str>, exe: &Path) -> Result<()> {
    let driver = filter_name(key_name);
    let exe = shell_quote(&exe.display().to_string());
    let suffix = match key_name {
        None => String::new(),
        Some(name) => format!(" --key-name={name}"),
    };

    set(repo, &format!("filter.{driver}.clean"), &format!("{exe} clean{suffix}"))?;
    set(
        repo,
        &format!("filter.{driver}.smudge"),
        &format!("{exe} smudge{suffix}"),
    )?;
    set(repo, &format!("filter.{driver}.required"), "true")?;
    set(
        repo,
        &format!("diff.{driver}.textconv"),
        &format!("{exe} diff{suffix}"),
    )?;
    info!(driver, "installed filter configuration");
    Ok(())
}

/// Remove the driver configuration for a key name. Sections that are
/// already gone are not an error.
pub fn uninstall(repo: &Repository, key_name: Option<&str>) -> Result<()> {
    let driver = filter_name(key_name);
    remove_section(repo, &format!("filter.{driver}"))?;
    remove_section(repo, &format!("diff.{driver}"))?;
    info!(driver, "removed filter configuration");
    Ok(())
}

fn set(repo: &Repository, key: &str, value: &str) -> Result<()> {
    repo.git().args(["config", key, value]).run()
}

fn remove_section(repo: &Repository, section: &str) -> Result<()> {
    match repo
        .git()
        .args(["config", "--remove-section", section])
        .run()
    {
        Ok(()) => Ok(()),
        Err(GitCryptError::GitFailed { .. }) => {
            debug!(section, "config section absent; nothing to remove");
            Ok(())
        }
        Err(other) => Err(other),
    }
}
