//! httpd-fcgi
//!
//! An HTTP/1.x origin server with static files, directory listings and
//! FastCGI application support.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ http::context::Connection
//!                                      │  parse (http::request)
//!                                      │  route (routing::router)
//!                                      ▼
//!                                  handlers ──▶ file / dir  ──▶ content
//!                                      │    ──▶ fastcgi     ──▶ fastcgi::dispatcher ──▶ app
//!                                      │    ──▶ proxy       ──▶ CONNECT tunnel
//!                                      ▼
//!     Client ◀── http::writer (chunked / gzip) ◀── http::response
//! ```

use std::path::PathBuf;

use clap::Parser;

use httpd_fcgi::config::{load_config, validate_config, ConfigError, FastCgiConfig, HttpdConfig};
use httpd_fcgi::lifecycle::wait_for_signal;
use httpd_fcgi::observability::{logging, metrics};
use httpd_fcgi::HttpServer;

/// HTTP/1.x server with FastCGI support.
#[derive(Parser, Debug)]
#[command(name = "httpd-fcgi", version, about)]
struct Cli {
    /// TOML configuration file. Without one a single default server is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listening address of every server block.
    #[arg(short, long, value_name = "HOST:PORT")]
    bind: Option<String>,

    /// Override the document root of every server block.
    #[arg(short, long, value_name = "DIR")]
    root: Option<String>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    if let Some(bind) = &cli.bind {
        apply_bind(&mut config, bind)?;
    }
    if let Some(root) = &cli.root {
        for server in &mut config.servers {
            server.root = root.clone();
        }
    }
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init(&config.observability.log_level);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: HttpdConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "httpd-fcgi starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = HttpServer::new(&config)?;
    let listeners = server.bind().await?;
    for listener in &listeners {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, "Listening for connections");
        }
    }

    server.run(listeners, wait_for_signal()).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// One server on port 4000 serving `.` with PHP routed to `127.0.0.1:9000`.
fn default_config() -> HttpdConfig {
    let mut config = HttpdConfig::default();
    for server in &mut config.servers {
        server.fastcgi.push(FastCgiConfig {
            pattern: r"\.php$".to_string(),
            targets: vec!["127.0.0.1:9000".to_string()],
            index: Some(vec!["index.php".to_string()]),
            timeout_secs: 30,
        });
    }
    config
}

/// Apply `HOST:PORT` (or `:PORT`, `[v6]:PORT`) to every server block.
fn apply_bind(config: &mut HttpdConfig, raw: &str) -> Result<(), String> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid bind address {:?}: expected HOST:PORT", raw))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port in bind address {:?}", raw))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    for server in &mut config.servers {
        server.port = port;
        if !host.is_empty() {
            server.bind = host.to_string();
        }
    }
    Ok(())
}
