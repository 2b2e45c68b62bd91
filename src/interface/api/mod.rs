//! Administrative HTTP channel

mod handlers;
mod router;

pub use router::{build_router, ApiState};
