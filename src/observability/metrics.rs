//! Metrics collection and exposition.
//!
//! # Metrics
//! - `httpd_requests_total` (counter): requests by status
//! - `httpd_request_duration_seconds` (histogram): time from request line to flush
//! - `httpd_active_connections` (gauge): open client connections
//! - `httpd_fastcgi_workers` (gauge): live upstream connections per rule
//! - `httpd_fastcgi_errors_total` (counter): upstream failures by kind

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(status: u16, elapsed: Duration) {
    counter!("httpd_requests_total", "status" => status.to_string()).increment(1);
    histogram!("httpd_request_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_fastcgi_error(kind: &'static str) {
    counter!("httpd_fastcgi_errors_total", "kind" => kind).increment(1);
}

pub fn set_fastcgi_workers(rule: &str, live: usize) {
    gauge!("httpd_fastcgi_workers", "rule" => rule.to_string()).set(live as f64);
}

pub fn set_active_connections(count: u64) {
    gauge!("httpd_active_connections").set(count as f64);
}
