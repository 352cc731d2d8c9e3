//! Reading `HttpdConfig` from TOML.

use std::path::Path;

use thiserror::Error;

use crate::config::schema::HttpdConfig;
use crate::config::validation::{validate_config, ValidationError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Read, parse and validate the file at `path`.
pub fn load_config(path: &Path) -> Result<HttpdConfig, ConfigError> {
    parse_config(&std::fs::read_to_string(path)?)
}

/// Parse and validate TOML text. Every validation failure is reported.
pub fn parse_config(content: &str) -> Result<HttpdConfig, ConfigError> {
    let config: HttpdConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}
