//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_signal() resolves
//!
//! Shutdown (shutdown.rs):
//!     trigger → accept loops stop → idle connections close → drain → exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: remaining connections are abandoned after the deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::wait_for_signal;
