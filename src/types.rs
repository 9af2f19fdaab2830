//! Crate-wide error type for process plumbing (config, server, IO).
//!
//! Operation failures (authorize, login, sign) use the taxonomy in
//! [`crate::broker::error`]; this type covers everything around them.

use thiserror::Error;

/// Errors raised outside the broker operations themselves
#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GuardianError>;
