//! Error types for the bulkscan core library

use thiserror::Error;

/// Result type alias for bulkscan-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing targets, loading config, or evaluating the denylist
#[derive(Error, Debug)]
pub enum Error {
    /// Target string could not be parsed at all (malformed rank/quote/port syntax)
    #[error("failed to parse target {0:?}: {1}")]
    TargetParse(String, String),

    /// DNS resolution failed for a hostname
    #[error("DNS resolution failed for {0:?}: {1}")]
    Resolution(String, String),

    /// Denylist file could not be read
    #[error("failed to read denylist file {0:?}: {1}")]
    Denylist(String, std::io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid state transition (e.g. reading delivery_tag before it is set)
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML parse error: {err}"))
    }
}
