//! FastCGI client subsystem.
//!
//! # Data Flow
//! ```text
//! FastCGI handler
//!     → dispatcher.rs (per-rule pool, concurrency cap, FIFO wait)
//!     → worker.rs (one persistent upstream connection + request id)
//!     → protocol.rs (record framing, name/value pairs)
//!     → upstream application server
//! ```
//!
//! # Design Decisions
//! - One exchange per worker at a time; no multiplexing over a connection
//! - A worker whose exchange did not reach END_REQUEST is closed before reuse
//! - Pools are keyed by the rule id assigned when the config is compiled

pub mod dispatcher;
pub mod protocol;
pub mod worker;

use thiserror::Error;

pub use dispatcher::{parse_target, Dispatcher, DispatcherRegistry, Target, WorkerLease};
pub use worker::{Output, Worker};

/// Failure talking to a FastCGI application.
#[derive(Debug, Error)]
pub enum FastCgiError {
    #[error("failed connecting to FastCGI server: {0}")]
    Connect(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("FastCGI protocol error: {0}")]
    Protocol(String),

    #[error("FastCGI exchange timed out")]
    Timeout,

    /// Reading the request body from the client failed.
    #[error("failed reading request body: {0}")]
    Client(#[source] std::io::Error),

    #[error("FastCGI pool closed")]
    PoolClosed,
}

impl FastCgiError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FastCgiError::Connect(_) => "connect",
            FastCgiError::Io(_) => "io",
            FastCgiError::Protocol(_) => "protocol",
            FastCgiError::Timeout => "timeout",
            FastCgiError::Client(_) => "client",
            FastCgiError::PoolClosed => "pool_closed",
        }
    }
}
