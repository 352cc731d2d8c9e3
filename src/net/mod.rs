//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, shared connection limit)
//!     → connection.rs (id, state names, lifecycle tracking)
//!     → Hand off to http::context::Connection
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;
