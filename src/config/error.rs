//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the file that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a TOML configuration file.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path to the file that couldn't be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        #[source]
        source: Box<toml::de::Error>,
    },

    /// A filter rule is invalid.
    #[error("invalid filter configuration: {0}")]
    Filter(#[from] crate::proxy::filter::FilterError),

    /// A configuration value is invalid.
    #[error("invalid config value for {field}: {message}")]
    InvalidValue {
        /// The field name that has an invalid value.
        field: String,
        /// Description of why the value is invalid.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_names_file() {
        let parse_err = toml::from_str::<toml::Value>("not [ valid").unwrap_err();
        let err = ConfigError::Parse {
            path: PathBuf::from("/etc/devsandbox/config.toml"),
            source: Box::new(parse_err),
        };
        assert!(err.to_string().contains("/etc/devsandbox/config.toml"));
    }
}
