//! SIP signaling: message types, transports and the registrar/UA engine

pub mod auth;
pub mod builder;
pub mod engine;
pub mod message;
pub mod transport;

pub use engine::{SignalingEngine, SipEngineConfig};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use transport::{IncomingMessage, OutgoingMessage, TransportProtocol};
