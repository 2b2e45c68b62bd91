//! Infrastructure: persistence and protocol plumbing

pub mod persistence;
pub mod protocols;
