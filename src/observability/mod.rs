//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (tracing subscriber, access log target)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or the configured level)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Access lines are ordinary `tracing` events on their own target,
//!   so they can be filtered independently of diagnostics
//! - Metric updates go through the `metrics` facade and are no-ops
//!   when no exporter is installed

pub mod logging;
pub mod metrics;
