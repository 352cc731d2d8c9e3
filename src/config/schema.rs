//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpdConfig {
    /// Accept loop settings shared by every listening port.
    pub listener: ListenerConfig,

    /// Request parsing limits.
    pub limits: LimitsConfig,

    /// FastCGI worker pool settings.
    pub fastcgi: FastCgiPoolConfig,

    /// Cache lifetime per MIME type (`"text/css"`) or family (`"image/*"`), in seconds.
    pub expires: HashMap<String, u64>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Virtual server blocks, one per `(host, port)`.
    pub servers: Vec<ServerConfig>,
}

impl Default for HttpdConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            limits: LimitsConfig::default(),
            fastcgi: FastCgiPoolConfig::default(),
            expires: HashMap::new(),
            observability: ObservabilityConfig::default(),
            servers: vec![ServerConfig::default()],
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// How long in-flight connections may run after a shutdown signal.
    pub shutdown_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Limits applied while reading requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Byte ceiling for the request line and for each header line.
    pub max_line_bytes: usize,

    /// Maximum number of header lines per request.
    pub max_headers: usize,

    /// Unread request bodies up to this size are skipped to keep the connection alive.
    pub max_discard_body_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: 65_536,
            max_headers: 100,
            max_discard_body_bytes: 1024 * 1024,
        }
    }
}

/// FastCGI pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FastCgiPoolConfig {
    /// Live upstream connections allowed per target address.
    ///
    /// Keep this at 1 for runtimes that cannot serve concurrent requests
    /// (PHP on Windows being the usual example).
    pub max_connections_per_target: usize,

    /// Timeout for establishing an upstream connection.
    pub connect_timeout_secs: u64,
}

impl Default for FastCgiPoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_target: 1,
            connect_timeout_secs: 5,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// One virtual server, addressed by `(host, port)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name served by this block; empty means the default bucket of the port.
    pub host: String,

    /// Listening port.
    pub port: u16,

    /// Address the port is bound on.
    pub bind: String,

    /// Document root used when no alias matches.
    pub root: String,

    /// Index file names tried for directory paths.
    pub index: Vec<String>,

    /// Content types eligible for gzip encoding.
    pub gzip: Vec<String>,

    /// Read timeout for the next request line and each header line.
    pub keep_alive_timeout_secs: u64,

    /// Ordered rewrite rules.
    pub rewrite: Vec<RewriteConfig>,

    /// Ordered alias rules.
    pub alias: Vec<AliasConfig>,

    /// Ordered FastCGI rules.
    pub fastcgi: Vec<FastCgiConfig>,

    /// Handler tree, resolved per request.
    pub handlers: Vec<HandlerEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 4000,
            bind: "0.0.0.0".to_string(),
            root: ".".to_string(),
            index: vec!["index.html".to_string()],
            gzip: vec![
                "text/html".to_string(),
                "text/css".to_string(),
                "application/javascript".to_string(),
            ],
            keep_alive_timeout_secs: 120,
            rewrite: Vec::new(),
            alias: Vec::new(),
            fastcgi: Vec::new(),
            handlers: default_handlers(),
        }
    }
}

fn default_handlers() -> Vec<HandlerEntry> {
    ["fastcgi", "file", "dir"]
        .into_iter()
        .map(|name| HandlerEntry::Name(name.to_string()))
        .collect()
}

/// Regex rewrite of the request target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewriteConfig {
    /// Pattern searched in the current path.
    pub pattern: String,

    /// Replacement with `$N` / `${N}` back-references.
    pub replace: String,

    /// Stop rewriting after this rule matches.
    #[serde(default)]
    pub last: bool,
}

/// Maps a URL prefix onto a filesystem prefix.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AliasConfig {
    /// URL prefix.
    pub source: String,

    /// Filesystem prefix. Must agree with `source` on the trailing slash.
    pub dest: String,
}

/// Routes matching real paths to FastCGI upstreams.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FastCgiConfig {
    /// Pattern searched in the real (post-alias) path.
    pub pattern: String,

    /// Upstream addresses (`host:port`).
    pub targets: Vec<String>,

    /// Index names for directory requests; falls back to the server index.
    #[serde(default)]
    pub index: Option<Vec<String>>,

    /// Read timeout for the request body relay and the upstream response.
    #[serde(default = "default_fastcgi_timeout")]
    pub timeout_secs: u64,
}

fn default_fastcgi_timeout() -> u64 {
    30
}

/// One entry of a handler tree.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HandlerEntry {
    /// A built-in handler by name.
    Name(String),
    /// A literal error response.
    Code(u16),
    /// A nested section guarded by match predicates.
    Section(SectionConfig),
}

/// Nested handler section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SectionConfig {
    /// Predicates (`h:<glob>` or `p:<rule>`); any one passing admits the section.
    #[serde(rename = "match")]
    pub matches: Vec<String>,

    /// Port the request's Host header must name, when it names one.
    pub port: Option<u16>,

    /// Options overriding the parent's for handlers in this section.
    pub options: OptionsConfig,

    /// Children, evaluated in order.
    pub handlers: Vec<HandlerEntry>,
}

/// Handler options that sections may override.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OptionsConfig {
    /// Document root override.
    pub root: Option<String>,

    /// Index names override.
    pub index: Option<Vec<String>>,
}
