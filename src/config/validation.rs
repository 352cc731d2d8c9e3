//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every pattern compiles and every target parses
//! - Validate value ranges (timeouts > 0, pool caps > 0, error codes)
//! - Detect conflicting server blocks
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HttpdConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::config::schema::{HandlerEntry, HttpdConfig, ServerConfig};
use crate::fastcgi::dispatcher::parse_target;
use crate::handlers::Handler;
use crate::routing::matcher::parse_match;

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no server blocks configured")]
    NoServers,

    #[error("server {host:?} on port {port} is defined twice")]
    DuplicateServer { host: String, port: u16 },

    #[error("port {port} is bound on both {first} and {second}")]
    ConflictingBind { port: u16, first: String, second: String },

    #[error("alias {source_prefix} -> {dest}: source and destination must both be files or both be directories")]
    AliasSlashMismatch { source_prefix: String, dest: String },

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("FastCGI rule {pattern:?} has no targets")]
    NoTargets { pattern: String },

    #[error("invalid FastCGI target {target:?}")]
    InvalidTarget { target: String },

    #[error("unknown handler {name:?}")]
    UnknownHandler { name: String },

    #[error("literal status {code} must be within 301..=999")]
    InvalidStatusCode { code: u16 },

    #[error("invalid match entry {entry:?}")]
    InvalidMatch { entry: String },

    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}

/// Validate a configuration, collecting every problem.
pub fn validate_config(config: &HttpdConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.servers.is_empty() {
        errors.push(ValidationError::NoServers);
    }
    if config.fastcgi.max_connections_per_target == 0 {
        errors.push(ValidationError::ZeroValue {
            field: "fastcgi.max_connections_per_target",
        });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroValue {
            field: "listener.max_connections",
        });
    }
    if config.limits.max_line_bytes == 0 {
        errors.push(ValidationError::ZeroValue {
            field: "limits.max_line_bytes",
        });
    }

    let mut seen = HashSet::new();
    let mut binds: HashMap<u16, &str> = HashMap::new();
    for server in &config.servers {
        if !seen.insert((server.host.to_ascii_lowercase(), server.port)) {
            errors.push(ValidationError::DuplicateServer {
                host: server.host.clone(),
                port: server.port,
            });
        }
        match binds.get(&server.port) {
            Some(first) if *first != server.bind => errors.push(ValidationError::ConflictingBind {
                port: server.port,
                first: first.to_string(),
                second: server.bind.clone(),
            }),
            Some(_) => {}
            None => {
                binds.insert(server.port, &server.bind);
            }
        }
        validate_server(server, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_server(server: &ServerConfig, errors: &mut Vec<ValidationError>) {
    if server.keep_alive_timeout_secs == 0 {
        errors.push(ValidationError::ZeroValue {
            field: "servers.keep_alive_timeout_secs",
        });
    }
    for rule in &server.rewrite {
        check_regex(&rule.pattern, errors);
    }
    for alias in &server.alias {
        if alias.source.ends_with('/') != alias.dest.ends_with('/') {
            errors.push(ValidationError::AliasSlashMismatch {
                source_prefix: alias.source.clone(),
                dest: alias.dest.clone(),
            });
        }
    }
    for rule in &server.fastcgi {
        check_regex(&rule.pattern, errors);
        if rule.timeout_secs == 0 {
            errors.push(ValidationError::ZeroValue {
                field: "servers.fastcgi.timeout_secs",
            });
        }
        if rule.targets.is_empty() {
            errors.push(ValidationError::NoTargets {
                pattern: rule.pattern.clone(),
            });
        }
        for target in &rule.targets {
            if parse_target(target).is_none() {
                errors.push(ValidationError::InvalidTarget {
                    target: target.clone(),
                });
            }
        }
    }
    validate_entries(&server.handlers, errors);
}

fn validate_entries(entries: &[HandlerEntry], errors: &mut Vec<ValidationError>) {
    for entry in entries {
        match entry {
            HandlerEntry::Name(name) => {
                if Handler::from_name(name).is_none() {
                    errors.push(ValidationError::UnknownHandler { name: name.clone() });
                }
            }
            HandlerEntry::Code(code) => {
                if !(301..=999).contains(code) {
                    errors.push(ValidationError::InvalidStatusCode { code: *code });
                }
            }
            HandlerEntry::Section(section) => {
                for entry in &section.matches {
                    if let Err(e) = parse_match(entry) {
                        errors.push(e);
                    }
                }
                validate_entries(&section.handlers, errors);
            }
        }
    }
}

fn check_regex(pattern: &str, errors: &mut Vec<ValidationError>) {
    if let Err(e) = regex::Regex::new(pattern) {
        errors.push(ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        });
    }
}
