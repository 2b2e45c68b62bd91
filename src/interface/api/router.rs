//! Route table for the admin HTTP listener

use super::handlers;
use crate::config::AdministratorSettings;
use crate::infrastructure::persistence::RecordCipher;
use crate::infrastructure::protocols::sip::SignalingEngine;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub signaling: Arc<SignalingEngine>,
    pub administrator: AdministratorSettings,
    /// Opens sealed provisioning bodies when a store key is configured
    pub cipher: Option<RecordCipher>,
    /// Log request bodies at debug level (config-gated)
    pub log_request_body: bool,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/account", post(handlers::create_account))
        .route("/account/:id", delete(handlers::delete_account))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
