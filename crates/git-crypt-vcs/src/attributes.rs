//! Index listing and `filter` attribute queries.
//!
//! The question this module answers: which tracked regular files are bound
//! to which git-crypt key? The index listing comes from `ls-files -cs -z`;
//! attribute values come from `check-attr`, batched over NUL-framed stdin
//! when git is new enough (1.8.5) and one path at a time otherwise.

use std::collections::HashMap;

use crate::config::filter_name;
use crate::repo::Repository;
use crate::version::{self, MIN_BATCH_CHECK_ATTR};
use git_crypt_core::{GitCryptError, Result};

/// One staged regular-file entry from the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// File mode, e.g. 0o100644.
    pub mode: u32,
    /// Object id of the staged blob, hex.
    pub oid: String,
    /// Merge stage; 0 outside conflicts.
    pub stage: u32,
    /// Path relative to the working-tree root.
    pub path: String,
}

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;

impl IndexEntry {
    pub fn is_regular_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// Tracked regular files, in index order. Symlinks, gitlinks, and anything
/// else that is not a regular file are dropped here — filters never see them.
pub fn list_index(repo: &Repository) -> Result<Vec<IndexEntry>> {
    let out = repo.git().args(["ls-files", "-cs", "-z"]).output()?;
    Ok(parse_index(&out)?
        .into_iter()
        .filter(IndexEntry::is_regular_file)
        .collect())
}

/// The `filter` attribute value for each path, `None` when git reports the
/// attribute as empty, `unspecified`, `unset`, or bare `set`.
pub fn filter_attrs(repo: &Repository, paths: &[String]) -> Result<Vec<Option<String>>> {
    attr_values(repo, paths, "filter")
}

/// One attribute's value for each path, normalized as in [`filter_attrs`].
pub fn attr_values(repo: &Repository, paths: &[String], attr: &str) -> Result<Vec<Option<String>>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    if version::current()? >= MIN_BATCH_CHECK_ATTR {
        attr_values_batch(repo, paths, attr)
    } else {
        paths
            .iter()
            .map(|path| attr_value_single(repo, path, attr))
            .collect()
    }
}

/// Paths in the index bound to the given key name.
pub fn encrypted_paths(repo: &Repository, key_name: Option<&str>) -> Result<Vec<String>> {
    let paths: Vec<String> = list_index(repo)?.into_iter().map(|e| e.path).collect();
    let attrs = filter_attrs(repo, &paths)?;
    let wanted = filter_name(key_name);
    Ok(paths
        .into_iter()
        .zip(attrs)
        .filter(|(_, attr)| attr.as_deref() == Some(wanted.as_str()))
        .map(|(path, _)| path)
        .collect())
}

/// Map a `filter` attribute value back to a key name:
/// `git-crypt` → default, `git-crypt-X` → `X`, anything else → unbound.
pub fn key_name_of(attr_value: &str) -> Option<Option<&str>> {
    if attr_value == "git-crypt" {
        Some(None)
    } else {
        attr_value.strip_prefix("git-crypt-").map(Some)
    }
}

fn attr_values_batch(repo: &Repository, paths: &[String], attr: &str) -> Result<Vec<Option<String>>> {
    let mut input = Vec::new();
    for path in paths {
        input.extend_from_slice(path.as_bytes());
        input.push(0);
    }
    let out = repo
        .git()
        .args(["check-attr", "--stdin", "-z", attr])
        .output_with_input(&input)?;
    let by_path = parse_check_attr_z(&out)?;
    Ok(paths
        .iter()
        .map(|path| by_path.get(path).cloned().and_then(normalize_attr))
        .collect())
}

fn attr_value_single(repo: &Repository, path: &str, attr: &str) -> Result<Option<String>> {
    let out = repo.git().args(["check-attr", attr, "--", path]).output()?;
    let text = String::from_utf8_lossy(&out);
    parse_check_attr_line(text.trim_end(), attr).map(|v| v.and_then(normalize_attr))
}

/// Parse `check-attr -z` output: repeated `path NUL attr NUL value NUL`.
fn parse_check_attr_z(out: &[u8]) -> Result<HashMap<String, String>> {
    let mut fields = out.split(|&b| b == 0);
    let mut map = HashMap::new();
    loop {
        let Some(path) = fields.next() else { break };
        if path.is_empty() {
            // Trailing NUL.
            break;
        }
        let (Some(_attr), Some(value)) = (fields.next(), fields.next()) else {
            return Err(protocol_error("check-attr --stdin -z"));
        };
        let path = String::from_utf8(path.to_vec())
            .map_err(|_| protocol_error("check-attr --stdin -z"))?;
        let value = String::from_utf8(value.to_vec())
            .map_err(|_| protocol_error("check-attr --stdin -z"))?;
        map.insert(path, value);
    }
    Ok(map)
}

/// Parse single-query output `PATH: ATTR: VALUE` from the right, since the
/// path itself may contain `': '`.
fn parse_check_attr_line(line: &str, attr: &str) -> Result<Option<String>> {
    let mut parts = line.rsplitn(3, ": ");
    let value = parts.next().ok_or_else(|| protocol_error("check-attr"))?;
    let reported = parts.next().ok_or_else(|| protocol_error("check-attr"))?;
    if reported != attr {
        return Err(protocol_error("check-attr"));
    }
    Ok(Some(value.to_string()))
}

fn normalize_attr(value: String) -> Option<String> {
    match value.as_str() {
        "" | "unspecified" | "unset" | "set" => None,
        _ => Some(value),
    }
}

/// Parse `ls-files -cs -z` records: `MODE SP OID SP STAGE TAB PATH NUL`.
fn parse_index(out: &[u8]) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    for record in out.split(|&b| b == 0) {
        if record.is_empty() {
            continue;
        }
        let tab = record
            .iter()
            .position(|&b| b == b'\t')
            .ok_or_else(|| protocol_error("ls-files -cs -z"))?;
        let meta = std::str::from_utf8(&record[..tab])
            .map_err(|_| protocol_error("ls-files -cs -z"))?;
        let path = String::from_utf8(record[tab + 1..].to_vec())
            .map_err(|_| protocol_error("ls-files -cs -z"))?;

        let mut fields = meta.split_whitespace();
        let (Some(mode), Some(oid), Some(stage)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(protocol_error("ls-files -cs -z"));
        };
        entries.push(IndexEntry {
            mode: u32::from_str_radix(mode, 8).map_err(|_| protocol_error("ls-files -cs -z"))?,
            oid: oid.to_string(),
            stage: stage.parse().map_err(|_| protocol_error("ls-files -cs -z"))?,
            path,
        });
    }
    Ok(entries)
}

fn protocol_error(command: &str) -> GitCryptError {
    GitCryptError::GitFailed {
        command: command.to_string(),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_index_records() {
        let raw = b"100644 e69de29bb2d1d6434b8b29ae775ad8c2e48c5391 0\tsecrets/api.key\0\
100755 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 0\tbin/run.sh\0\
120000 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb 0\tlink\0";
        let entries = parse_index(raw).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "secrets/api.key");
        assert_eq!(entries[0].mode, 0o100644);
        assert_eq!(entries[0].stage, 0);
        assert!(entries[0].is_regular_file());
        assert!(entries[1].is_regular_file());
        assert!(!entries[2].is_regular_file(), "symlinks are not regular");
    }

    #[test]
    fn parse_index_path_with_spaces_and_tab_in_meta_only() {
        let raw = b"100644 e69de29bb2d1d6434b8b29ae775ad8c2e48c5391 0\ta dir/with space.txt\0";
        let entries = parse_index(raw).unwrap();
        assert_eq!(entries[0].path, "a dir/with space.txt");
    }

    #[test]
    fn parse_index_rejects_garbage() {
        assert!(parse_index(b"no tab here\0").is_err());
        assert!(parse_index(b"xyz aaaa 0\tp\0").is_err());
    }

    #[test]
    fn parse_check_attr_z_triples() {
        let raw = b"secrets/api.key\0filter\0git-crypt\0plain.txt\0filter\0unspecified\0";
        let map = parse_check_attr_z(raw).unwrap();
        assert_eq!(map.get("secrets/api.key").map(String::as_str), Some("git-crypt"));
        assert_eq!(map.get("plain.txt").map(String::as_str), Some("unspecified"));
    }

    #[test]
    fn parse_check_attr_z_truncated_triple_is_protocol_error() {
        // Record cut off before the value field arrives.
        assert!(parse_check_attr_z(b"path\0filter").is_err());
    }

    #[test]
    fn parse_single_line_from_the_right() {
        let value = parse_check_attr_line("weird: name.txt: filter: git-crypt-team", "filter")
            .unwrap()
            .unwrap();
        assert_eq!(value, "git-crypt-team");
    }

    #[test]
    fn parse_single_line_checks_the_attribute_name() {
        assert!(parse_check_attr_line("a.txt: diff: git-crypt", "filter").is_err());
        assert!(parse_check_attr_line("a.txt: diff: git-crypt", "diff").is_ok());
    }

    #[test]
    fn attr_values_that_mean_unbound() {
        for v in ["", "unspecified", "unset", "set"] {
            assert_eq!(normalize_attr(v.to_string()), None);
        }
        assert_eq!(
            normalize_attr("git-crypt".to_string()),
            Some("git-crypt".to_string())
        );
    }

    #[test]
    fn key_name_mapping() {
        assert_eq!(key_name_of("git-crypt"), Some(None));
        assert_eq!(key_name_of("git-crypt-team-A"), Some(Some("team-A")));
        assert_eq!(key_name_of("lfs"), None);
        assert_eq!(key_name_of(""), None);
    }
}
