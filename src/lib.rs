//! HTTP/1.x origin server with FastCGI support.
//!
//! Serves static files and directory listings, relays matching requests to
//! pooled FastCGI applications and tunnels `CONNECT` requests.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;

// Request handling
pub mod content;
pub mod fastcgi;
pub mod handlers;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::HttpdConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
