//! Engine error taxonomy

use thiserror::Error;

/// Errors surfaced to the host. Only startup-class variants ever cross the
/// lifecycle boundary; steady-state protocol faults are absorbed and logged.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Filter evaluation error: {0}")]
    FilterEvaluation(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Startup-class errors abort `start`; everything else is recovered locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_)
                | EngineError::Storage(_)
                | EngineError::Decryption(_)
                | EngineError::Schema(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<rsip::Error> for EngineError {
    fn from(err: rsip::Error) -> Self {
        EngineError::Protocol(err.to_string())
    }
}
