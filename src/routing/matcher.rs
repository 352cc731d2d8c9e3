//! Handler-section predicates.
//!
//! # Responsibilities
//! - Match the request host against a glob (`h:*.example.com`)
//! - Match the request path by prefix, exact value or regex (`p:/api`, `p:=/x`, `p:~re`)
//! - Combine the entries of one section with OR semantics
//!
//! # Design Decisions
//! - Host matching is case-insensitive
//! - Path matching is case-sensitive
//! - An empty entry list always matches
//! - Patterns are compiled once, when the router is built

use regex::Regex;

use crate::config::ValidationError;

/// What a predicate can see of a request.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    /// Lowercased host name, if the request named one.
    pub host: Option<&'a str>,
    /// Request path without the query string.
    pub path: &'a str,
}

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, ctx: &MatchContext<'_>) -> bool;
}

/// Matches the host name against a glob.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    pattern: Regex,
}

impl HostMatcher {
    /// `*` matches any run of characters; everything else is literal.
    /// The pattern is searched, not anchored.
    pub fn new(glob: &str) -> Result<Self, regex::Error> {
        let escaped = regex::escape(&glob.to_ascii_lowercase()).replace(r"\*", ".*");
        Ok(Self {
            pattern: Regex::new(&format!("(?i){}", escaped))?,
        })
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        self.pattern.is_match(ctx.host.unwrap_or(""))
    }
}

/// Matches the request path.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    /// `path == prefix` or `path` starts with `prefix/`.
    Prefix(String),
    Exact(String),
    Regex(Regex),
}

impl Matcher for PathMatcher {
    fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        match self {
            PathMatcher::Prefix(prefix) => {
                ctx.path == prefix
                    || ctx
                        .path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            PathMatcher::Exact(exact) => ctx.path == exact,
            PathMatcher::Regex(re) => re.is_match(ctx.path),
        }
    }
}

/// Combines multiple matchers with OR semantics.
#[derive(Debug)]
pub struct AnyMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AnyMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AnyMatcher {
    fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        // Empty means unconditional
        self.matchers.is_empty() || self.matchers.iter().any(|m| m.matches(ctx))
    }
}

/// Compile one `h:` / `p:` match entry.
pub fn parse_match(entry: &str) -> Result<Box<dyn Matcher>, ValidationError> {
    let invalid = || ValidationError::InvalidMatch {
        entry: entry.to_string(),
    };
    let bad_pattern = |pattern: &str, e: regex::Error| ValidationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    };

    if let Some(glob) = entry.strip_prefix("h:") {
        if glob.is_empty() {
            return Err(invalid());
        }
        let matcher = HostMatcher::new(glob).map_err(|e| bad_pattern(glob, e))?;
        return Ok(Box::new(matcher));
    }

    let rule = entry.strip_prefix("p:").ok_or_else(invalid)?;
    if let Some(pattern) = rule.strip_prefix('~') {
        let re = Regex::new(pattern).map_err(|e| bad_pattern(pattern, e))?;
        return Ok(Box::new(PathMatcher::Regex(re)));
    }
    if let Some(exact) = rule.strip_prefix('=') {
        return Ok(Box::new(PathMatcher::Exact(exact.to_string())));
    }
    if rule.starts_with('/') {
        return Ok(Box::new(PathMatcher::Prefix(rule.trim_end_matches('/').to_string())));
    }
    Err(invalid())
}
