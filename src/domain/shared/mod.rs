//! Shared domain primitives

pub mod error;
pub mod result;

pub use error::EngineError;
pub use result::Result;
