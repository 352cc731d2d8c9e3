//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → HttpdConfig (validated, immutable)
//!     → compiled into routing::Router at startup
//! ```
//!
//! # Design Decisions
//! - Config is loaded once; no hot reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AliasConfig, FastCgiConfig, FastCgiPoolConfig, HandlerEntry, HttpdConfig, LimitsConfig,
    ListenerConfig, ObservabilityConfig, OptionsConfig, RewriteConfig, SectionConfig,
    ServerConfig,
};
pub use validation::{validate_config, ValidationError};
