//! Path manipulation utilities for patchstack

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Match a path against a glob pattern
///
/// `*` does not cross directory separators; use `**` for that.
pub fn glob_match(pattern: &str, path: &str) -> Result<bool> {
    let pattern = Pattern::new(pattern).map_err(Error::Glob)?;
    Ok(pattern.matches_with(path, MATCH_OPTIONS))
}

/// Whether `path` is covered by any exclusion pattern
///
/// A pattern excludes the paths it matches and everything beneath them, so
/// `paper-patches` excludes `paper-patches/0001-foo.patch`.
pub fn is_excluded(path: &str, excludes: &[String]) -> Result<bool> {
    for pattern in excludes {
        let pattern = pattern.trim_end_matches('/');
        if glob_match(pattern, path)? {
            return Ok(true);
        }
        let mut prefix = String::new();
        for segment in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if prefix.len() < path.len() && glob_match(pattern, &prefix)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Encode an arbitrary string into a single filesystem-safe path component
pub fn encode_path_component(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' => '-',
            '\\' => '-',
            ':' => '_',
            '*' => '_',
            '?' => '_',
            '"' => '_',
            '<' => '_',
            '>' => '_',
            '|' => '_',
            // Keep alphanumeric, dots, dashes, underscores as-is
            c if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect()
}

/// Whether `path` names something strictly inside its base directory
///
/// Absolute paths, `..` and paths that reduce to the base itself are not.
pub fn is_contained<P: AsRef<Path>>(path: P) -> bool {
    let mut normal = 0;
    for component in path.as_ref().components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            _ => return false,
        }
    }
    normal > 0
}

/// Drop `.` components so equal locations compare equal
pub fn normalize<P: AsRef<Path>>(path: P) -> PathBuf {
    path.as_ref()
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Strip the `a/` or `b/` prefix git puts on diff paths
///
/// Returns `None` for `/dev/null`.
pub fn strip_diff_prefix(raw: &str) -> Option<String> {
    // `--- a/file.txt\t2024-01-01 00:00:00` style timestamps
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    if raw == "/dev/null" {
        return None;
    }
    let raw = raw.trim_matches('"');
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}
