//! Repository name normalization.
//!
//! Placement hashes the canonical form of a repository name, so every
//! spelling of the same repository (case, `.git` suffix, soft-deletion
//! marker) must collapse to one string before it reaches the hash.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Soft-deleted repositories are renamed to `DELETED-<epoch seconds>.<fraction>-<name>`.
static DELETED_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DELETED-[0-9]+\.[0-9]+-").expect("valid deleted-marker regex"));

/// Strips every soft-deletion marker, recovering the name the repository was
/// registered under.
pub fn undeleted_repo_name(name: &str) -> Cow<'_, str> {
    DELETED_MARKER.replace_all(name, "")
}

/// Returns the canonical spelling of a repository name.
///
/// A trailing `.git` is dropped and the path is cleaned lexically. The host
/// segment is case-folded, and for `github.com` the whole name is, because
/// GitHub treats owner and repository names case-insensitively.
pub fn normalize_repo(name: &str) -> String {
    let trimmed = name.strip_suffix(".git").unwrap_or(name);
    let cleaned = clean_path(trimmed);

    if !cleaned.chars().any(char::is_uppercase) {
        return cleaned;
    }

    let Some(slash) = cleaned.find('/') else {
        return cleaned;
    };
    let host = cleaned[..slash].to_lowercase();
    let path = &cleaned[slash..];
    if host == "github.com" {
        format!("{host}{}", path.to_lowercase())
    } else {
        format!("{host}{path}")
    }
}

/// Canonical placement key: undeleted, then normalized.
pub fn placement_key(name: &str) -> String {
    normalize_repo(&undeleted_repo_name(name))
}

/// Lexical path cleaning: collapses repeated slashes, drops `.` elements,
/// resolves `..` against the preceding element and removes trailing slashes.
fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
