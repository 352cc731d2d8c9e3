//! Rewrite, alias and FastCGI rules.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::{Captures, Regex};

use crate::fastcgi::Target;

/// Stable identity of a FastCGI rule, assigned in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub usize);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fastcgi-{}", self.0)
    }
}

/// Regex substitution over the request target.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replace: String,
    pub last: bool,
}

impl RewriteRule {
    pub fn new(pattern: &str, replace: impl Into<String>, last: bool) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replace: replace.into(),
            last,
        })
    }

    /// Rewritten path, or `None` if the pattern does not occur.
    ///
    /// Every occurrence is replaced. `$N` and `${N}` expand to capture
    /// group N; `$0` and missing groups expand to nothing.
    pub fn apply(&self, path: &str) -> Option<String> {
        if !self.pattern.is_match(path) {
            return None;
        }
        let rewritten = self
            .pattern
            .replace_all(path, |caps: &Captures<'_>| expand(&self.replace, caps));
        Some(rewritten.into_owned())
    }
}

fn expand(template: &str, caps: &Captures<'_>) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let (digits, consumed) = if bytes.get(i + 1) == Some(&b'{') {
                let close = template[i + 2..].find('}').map(|p| i + 2 + p);
                match close {
                    Some(end) if end > i + 2 && template[i + 2..end].bytes().all(|b| b.is_ascii_digit()) => {
                        (&template[i + 2..end], end + 1 - i)
                    }
                    _ => ("", 0),
                }
            } else {
                let len = template[i + 1..].bytes().take_while(u8::is_ascii_digit).count();
                (&template[i + 1..i + 1 + len], len + 1)
            };
            if consumed > 0 && !digits.is_empty() {
                let group = digits.parse::<usize>().unwrap_or(0);
                if group > 0 {
                    if let Some(m) = caps.get(group) {
                        out.push_str(m.as_str());
                    }
                }
                i += consumed;
                continue;
            }
        }
        let ch_len = template[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }
    out
}

/// Maps a URL prefix onto a filesystem prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRule {
    pub source: String,
    pub dest: String,
}

impl AliasRule {
    pub fn new(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
        }
    }

    /// Real path for `path`, if the prefix matches on a segment boundary.
    pub fn apply(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(self.source.as_str())?;
        if self.source.ends_with('/') || rest.starts_with('/') {
            Some(format!("{}{}", self.dest, rest))
        } else {
            None
        }
    }
}

/// Routes real paths matching a pattern to a FastCGI pool.
#[derive(Debug, Clone)]
pub struct FastCgiRule {
    pub id: RuleId,
    pattern: Regex,
    pub targets: Vec<Target>,
    /// Index names for directory paths; `None` means the server's list.
    pub index: Option<Vec<String>>,
    pub timeout: Duration,
}

impl FastCgiRule {
    pub fn new(
        id: RuleId,
        pattern: &str,
        targets: Vec<Target>,
        index: Option<Vec<String>>,
        timeout: Duration,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id,
            pattern: Regex::new(pattern)?,
            targets,
            index,
            timeout,
        })
    }

    pub fn matches(&self, realpath: &str) -> bool {
        self.pattern.is_match(realpath)
    }
}

/// Percent-decode and collapse `.`/`..` segments, never rising above `/`.
pub fn normalize_path(path: &str) -> String {
    let decoded = percent_encoding::percent_decode_str(path).decode_utf8_lossy();
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut normalized = String::with_capacity(decoded.len());
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    let trailing = decoded.ends_with('/')
        || decoded.ends_with("/.")
        || decoded.ends_with("/..")
        || segments.is_empty();
    if trailing {
        normalized.push('/');
    }
    normalized
}

/// Resolve a real path to a file, trying `indexes` for directory paths.
///
/// Directory paths only resolve through an index when they end in `/`.
pub fn find_file(realpath: &str, indexes: &[String]) -> Option<PathBuf> {
    let path = Path::new(realpath);
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    if realpath.ends_with('/') && path.is_dir() {
        return indexes
            .iter()
            .map(|index| path.join(index))
            .find(|candidate| candidate.is_file());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_substitutes_groups() {
        let rule = RewriteRule::new(r"^/old/(\w+)/(\w+)$", "/new/$2/${1}x$0$9", false).unwrap();
        assert_eq!(rule.apply("/old/a/b").as_deref(), Some("/new/b/ax"));
        assert_eq!(rule.apply("/other"), None);
    }

    #[test]
    fn rewrite_keeps_literal_dollars() {
        let rule = RewriteRule::new("^/a$", "/b$x${y}$", false).unwrap();
        assert_eq!(rule.apply("/a").as_deref(), Some("/b$x${y}$"));
    }

    #[test]
    fn rewrite_replaces_every_occurrence() {
        let rule = RewriteRule::new("a", "b", false).unwrap();
        assert_eq!(rule.apply("/aa/a").as_deref(), Some("/bb/b"));
    }

    #[test]
    fn alias_respects_segment_boundary() {
        let rule = AliasRule::new("/foo", "/srv/foo");
        assert_eq!(rule.apply("/foo/x").as_deref(), Some("/srv/foo/x"));
        assert_eq!(rule.apply("/foobar"), None);

        let dir = AliasRule::new("/static/", "/srv/static/");
        assert_eq!(dir.apply("/static/app.css").as_deref(), Some("/srv/static/app.css"));
        assert_eq!(dir.apply("/static"), None);
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize_path("/a%20b/"), "/a b/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/a/.."), "/");
        assert_eq!(normalize_path("/a/b/.."), "/a/");
        assert_eq!(normalize_path("/%2e%2e/x"), "/x");
    }

    #[test]
    fn finds_files_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), b"<?php").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let root = format!("{}/", dir.path().display());

        let indexes = vec!["index.html".to_string(), "index.php".to_string()];
        assert_eq!(find_file(&root, &indexes), Some(dir.path().join("index.php")));
        assert_eq!(find_file(&format!("{}a.txt", root), &indexes), Some(dir.path().join("a.txt")));
        assert_eq!(find_file(root.trim_end_matches('/'), &indexes), None);
        assert_eq!(find_file(&format!("{}missing", root), &indexes), None);
    }
}
