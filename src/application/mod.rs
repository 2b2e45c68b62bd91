//! Application services: lifecycle orchestration and notification dispatch

pub mod lifecycle;
pub mod notify;
