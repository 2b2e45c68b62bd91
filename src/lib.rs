//! sipis - an embedded SIP signaling relay and local push-notification gateway
//!
//! The engine is started on demand by a host extension, listens for inbound SIP
//! traffic and an administrative HTTP channel, persists account registration state
//! in an encrypted local store, and raises push notifications back into the host
//! through a caller-supplied sink.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export the lifecycle surface
pub use application::lifecycle::{Engine, StopOption};
pub use application::notify::{NotificationKind, NotificationSink};
pub use domain::shared::error::EngineError;
pub use domain::shared::result::Result;
