//! Errors raised while configuring and starting a node.
//!
//! Protocol layers keep their own error enums; this type only covers what the
//! node front-ends report before any session exists.

use thiserror::Error;

/// Result type alias using Tessel's error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rejected configuration value or unreadable config source
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}
