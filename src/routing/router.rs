//! Virtual-host lookup and per-request resolution.
//!
//! # Responsibilities
//! - Compile server blocks into immutable virtual hosts
//! - Pick the virtual host for `(port, host)` with fallback to the default bucket
//! - Map a request target to `(path, realpath, doc_root)` through rewrite and alias rules
//! - Flatten the handler tree into the ordered chain that applies to a request

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{HandlerEntry, HttpdConfig, ServerConfig, ValidationError};
use crate::fastcgi::parse_target;
use crate::handlers::Handler;
use crate::routing::matcher::{parse_match, AnyMatcher, MatchContext, Matcher};
use crate::routing::rules::{normalize_path, AliasRule, FastCgiRule, RewriteRule, RuleId};

/// Options a handler runs with, after section overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    pub root: String,
    pub index: Vec<String>,
}

/// One step of a resolved handler chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandler {
    pub handler: Handler,
    pub options: HandlerOptions,
}

/// Result of rewrite + alias mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Decoded, normalised path after rewriting.
    pub path: String,
    /// Query string after rewriting.
    pub query: String,
    /// Filesystem path the request maps to.
    pub realpath: String,
    /// Destination prefix of the alias that matched.
    pub doc_root: String,
}

#[derive(Debug)]
struct Section {
    port: Option<u16>,
    predicate: AnyMatcher,
    root: Option<String>,
    index: Option<Vec<String>>,
    children: Vec<RouteNode>,
}

#[derive(Debug)]
enum RouteNode {
    Handler(Handler),
    Section(Section),
}

/// A compiled server block.
#[derive(Debug)]
pub struct VirtualHost {
    pub host: String,
    pub port: u16,
    pub root: String,
    pub index: Vec<String>,
    pub gzip_types: Vec<String>,
    pub keep_alive_timeout: Duration,
    rewrites: Vec<RewriteRule>,
    aliases: Vec<AliasRule>,
    fastcgi: Vec<FastCgiRule>,
    handlers: Vec<RouteNode>,
}

impl VirtualHost {
    fn compile(server: &ServerConfig, next_rule: &mut usize) -> Result<Self, ValidationError> {
        let bad_pattern = |pattern: &str, e: regex::Error| ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        };

        let rewrites = server
            .rewrite
            .iter()
            .map(|r| RewriteRule::new(&r.pattern, r.replace.clone(), r.last).map_err(|e| bad_pattern(&r.pattern, e)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut aliases = Vec::with_capacity(server.alias.len());
        for alias in &server.alias {
            if alias.source.ends_with('/') != alias.dest.ends_with('/') {
                return Err(ValidationError::AliasSlashMismatch {
                    source_prefix: alias.source.clone(),
                    dest: alias.dest.clone(),
                });
            }
            aliases.push(AliasRule::new(alias.source.clone(), alias.dest.clone()));
        }

        let mut fastcgi = Vec::with_capacity(server.fastcgi.len());
        for rule in &server.fastcgi {
            let targets = rule
                .targets
                .iter()
                .map(|t| parse_target(t).ok_or_else(|| ValidationError::InvalidTarget { target: t.clone() }))
                .collect::<Result<Vec<_>, _>>()?;
            if targets.is_empty() {
                return Err(ValidationError::NoTargets {
                    pattern: rule.pattern.clone(),
                });
            }
            let id = RuleId(*next_rule);
            *next_rule += 1;
            let compiled = FastCgiRule::new(
                id,
                &rule.pattern,
                targets,
                rule.index.clone(),
                Duration::from_secs(rule.timeout_secs),
            )
            .map_err(|e| bad_pattern(&rule.pattern, e))?;
            fastcgi.push(compiled);
        }

        Ok(Self {
            host: server.host.to_ascii_lowercase(),
            port: server.port,
            root: server.root.clone(),
            index: server.index.clone(),
            gzip_types: server.gzip.clone(),
            keep_alive_timeout: Duration::from_secs(server.keep_alive_timeout_secs),
            rewrites,
            aliases,
            fastcgi,
            handlers: compile_nodes(&server.handlers)?,
        })
    }

    /// Name used in access logs.
    pub fn display_name(&self) -> String {
        if self.host.is_empty() {
            format!("*:{}", self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Apply rewrites to the raw target, then map the path to the filesystem.
    ///
    /// `root` backs the fallback alias used when no alias rule matches.
    pub fn resolve_path(&self, target: &str, root: &str) -> ResolvedPath {
        let mut current = target.to_string();
        for rule in &self.rewrites {
            if let Some(rewritten) = rule.apply(&current) {
                current = rewritten;
                if rule.last {
                    break;
                }
            }
        }
        let (raw_path, query) = match current.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (current, String::new()),
        };
        let path = normalize_path(&raw_path);

        for alias in &self.aliases {
            if let Some(realpath) = alias.apply(&path) {
                return ResolvedPath {
                    path,
                    query,
                    realpath,
                    doc_root: alias.dest.clone(),
                };
            }
        }
        let fallback = AliasRule::new("/", format!("{}/", root.trim_end_matches('/')));
        let realpath = fallback.apply(&path).unwrap_or_else(|| fallback.dest.clone());
        ResolvedPath {
            path,
            query,
            realpath,
            doc_root: fallback.dest,
        }
    }

    /// First FastCGI rule whose pattern occurs in `realpath`.
    pub fn fastcgi_rule(&self, realpath: &str) -> Option<&FastCgiRule> {
        self.fastcgi.iter().find(|rule| rule.matches(realpath))
    }

    /// Ordered handlers whose section predicates all pass.
    pub fn resolve_handlers(&self, ctx: &MatchContext<'_>, port: Option<u16>) -> Vec<ResolvedHandler> {
        let base = HandlerOptions {
            root: self.root.clone(),
            index: self.index.clone(),
        };
        let mut chain = Vec::new();
        collect(&self.handlers, ctx, port, &base, &mut chain);
        chain
    }
}

fn compile_nodes(entries: &[HandlerEntry]) -> Result<Vec<RouteNode>, ValidationError> {
    entries
        .iter()
        .map(|entry| match entry {
            HandlerEntry::Name(name) => Handler::from_name(name)
                .map(RouteNode::Handler)
                .ok_or_else(|| ValidationError::UnknownHandler { name: name.clone() }),
            HandlerEntry::Code(code) if (301..=999).contains(code) => Ok(RouteNode::Handler(Handler::Error(*code))),
            HandlerEntry::Code(code) => Err(ValidationError::InvalidStatusCode { code: *code }),
            HandlerEntry::Section(section) => {
                let matchers = section
                    .matches
                    .iter()
                    .map(|m| parse_match(m))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RouteNode::Section(Section {
                    port: section.port,
                    predicate: AnyMatcher::new(matchers),
                    root: section.options.root.clone(),
                    index: section.options.index.clone(),
                    children: compile_nodes(&section.handlers)?,
                }))
            }
        })
        .collect()
}

fn collect(
    nodes: &[RouteNode],
    ctx: &MatchContext<'_>,
    port: Option<u16>,
    options: &HandlerOptions,
    out: &mut Vec<ResolvedHandler>,
) {
    for node in nodes {
        match node {
            RouteNode::Handler(handler) => out.push(ResolvedHandler {
                handler: *handler,
                options: options.clone(),
            }),
            RouteNode::Section(section) => {
                let port_ok = match (section.port, port) {
                    (Some(want), Some(got)) => want == got,
                    _ => true,
                };
                if !port_ok || !section.predicate.matches(ctx) {
                    continue;
                }
                let merged = HandlerOptions {
                    root: section.root.clone().unwrap_or_else(|| options.root.clone()),
                    index: section.index.clone().unwrap_or_else(|| options.index.clone()),
                };
                collect(&section.children, ctx, port, &merged, out);
            }
        }
    }
}

#[derive(Debug)]
struct PortRoutes {
    bind: String,
    hosts: HashMap<String, Arc<VirtualHost>>,
    read_timeout: Duration,
}

/// All virtual hosts, keyed by port then host.
#[derive(Debug)]
pub struct Router {
    ports: HashMap<u16, PortRoutes>,
}

impl Router {
    /// Compile the server blocks. Expects a validated config; reports the
    /// first problem otherwise.
    pub fn from_config(config: &HttpdConfig) -> Result<Self, ValidationError> {
        let mut ports: HashMap<u16, PortRoutes> = HashMap::new();
        let mut next_rule = 0;
        for server in &config.servers {
            let vhost = Arc::new(VirtualHost::compile(server, &mut next_rule)?);
            let routes = ports.entry(server.port).or_insert_with(|| PortRoutes {
                bind: server.bind.clone(),
                hosts: HashMap::new(),
                read_timeout: vhost.keep_alive_timeout,
            });
            if vhost.host.is_empty() {
                routes.read_timeout = vhost.keep_alive_timeout;
            }
            if routes.hosts.contains_key(&vhost.host) {
                return Err(ValidationError::DuplicateServer {
                    host: server.host.clone(),
                    port: server.port,
                });
            }
            routes.hosts.insert(vhost.host.clone(), vhost);
        }
        if ports.is_empty() {
            return Err(ValidationError::NoServers);
        }
        Ok(Self { ports })
    }

    /// Virtual host for a request; unknown hosts fall back to the port's default bucket.
    pub fn lookup(&self, port: u16, host: Option<&str>) -> Option<Arc<VirtualHost>> {
        let routes = self.ports.get(&port)?;
        host.and_then(|h| routes.hosts.get(h))
            .or_else(|| routes.hosts.get(""))
            .cloned()
    }

    /// Read timeout before a request's host is known.
    pub fn read_timeout(&self, port: u16) -> Option<Duration> {
        self.ports.get(&port).map(|r| r.read_timeout)
    }

    /// `(port, bind address)` of every listening port, sorted by port.
    pub fn listen_addresses(&self) -> Vec<(u16, String)> {
        let mut addrs: Vec<(u16, String)> = self
            .ports
            .iter()
            .map(|(port, routes)| (*port, routes.bind.clone()))
            .collect();
        addrs.sort();
        addrs
    }
}
