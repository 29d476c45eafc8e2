// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # scopelink Configuration
//!
//! Type-safe configuration surface for a scopelink run:
//! - TOML parsing (from a string or an explicit path)
//! - Environment variable overrides (`SCOPELINK_*`)
//! - CLI argument overrides
//! - Validation with every problem reported at once
//!
//! ## Usage
//!
//! ```rust
//! use scopelink_config::{load_config_str, ScopeConfig};
//!
//! let config: ScopeConfig = load_config_str("[pool]\nworkers = 2\n", None).unwrap();
//! assert_eq!(config.pool.workers, 2);
//! ```
//!
//! Locating the configuration file belongs to the embedding application;
//! this crate only parses what it is handed.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::{apply_cli_overrides, apply_environment_overrides, load_config, load_config_str};
pub use types::*;
pub use validation::{validate_config, ConfigValidationError};

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax: {0}")]
    ParseError(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ScopeConfig::default();
        assert!(validate_config(&config).is_ok());
    }
}
