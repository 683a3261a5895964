//! The Anthropic-facing surface: `/v1/messages` and `/v1/models`, guarded
//! by the Xcode user-agent gate, streaming SSE in the Messages API shape.

pub mod auth;
pub mod connection_monitor;
pub mod handler;
pub mod helper;
pub mod stream;
pub mod types;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::AppContext;

/// The `/v1` router. Only Xcode user agents get past the middleware.
pub fn routes(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/v1/messages", post(handler::handle_messages))
        .route("/v1/models", get(handler::handle_list_models))
        .layer(middleware::from_fn(auth::require_xcode_user_agent))
        .with_state(ctx)
}
