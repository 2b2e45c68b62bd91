//! Shared result type

use super::error::EngineError;

pub type Result<T> = std::result::Result<T, EngineError>;
