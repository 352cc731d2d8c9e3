//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (port, host, target)
//!     → router.rs (virtual host lookup, handler chain)
//!     → matcher.rs (section predicates on host and path)
//!     → rules.rs (rewrite, alias, FastCGI rule, path normalisation)
//!     → Return: handler chain + realpath
//!
//! Route Compilation (at startup):
//!     ServerConfig[]
//!     → Compile regexes and matchers
//!     → Assign FastCGI rule ids
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - Deterministic: same input always resolves the same chain and realpath
//! - Rules apply in configuration order

pub mod matcher;
pub mod router;
pub mod rules;

pub use router::{Router, VirtualHost};
