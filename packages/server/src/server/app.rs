//! Application setup and router configuration.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::deps::ServerDeps;
use crate::dispatcher::Dispatcher;
use crate::server::routes::{events_handler, health_handler};

#[derive(Clone)]
pub struct AppState {
    pub deps: ServerDeps,
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the control-plane HTTP application.
pub fn build_app(deps: ServerDeps) -> Router {
    let state = AppState {
        dispatcher: Arc::new(Dispatcher::new(deps.clone())),
        deps,
    };

    Router::new()
        .route("/events", post(events_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
