//! Error types shared across Beacon components

use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("no configuration directory available")]
    NoConfigDir,
}

/// Reasons a TURN credential fails validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("malformed username: {0}")]
    MalformedUsername(String),

    #[error("credential expired at {expires_at} (now {now})")]
    Expired { expires_at: u64, now: u64 },

    #[error("signature mismatch")]
    BadSignature,
}
