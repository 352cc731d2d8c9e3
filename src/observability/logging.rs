//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber
//! - Name the targets used for access and FastCGI stderr lines
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level when set
//! - Human-readable fmt output; one line per event

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target of the per-request access log lines.
pub const ACCESS_TARGET: &str = "httpd_fcgi::access";

/// Target of lines an application wrote to FastCGI stderr.
pub const FASTCGI_TARGET: &str = "httpd_fcgi::fastcgi";

/// Filter used when `RUST_LOG` is unset: `level` for this crate, warnings elsewhere.
pub fn default_filter(level: &str) -> String {
    format!("warn,httpd_fcgi={}", level)
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
