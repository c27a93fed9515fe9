//! Error types for sealgate

use thiserror::Error;

use crate::common::PeerAddress;

/// Main error type for sealgate
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Address resolution failed: {0}")]
    Resolve(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Session already exists for {0}")]
    SessionExists(PeerAddress),

    #[error("Session limit reached ({0} sessions)")]
    SessionLimit(usize),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid proxy state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Result type alias for sealgate
pub type Result<T> = std::result::Result<T, Error>;
