// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the hub.

pub mod http;
pub mod ws_client;
pub mod ws_runtime;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::HubState;

/// Build the axum `Router` with all hub routes.
pub fn build_router(state: Arc<HubState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Sessions
        .route("/api/v1/sessions", post(http::create_session).get(http::list_sessions))
        .route("/api/v1/sessions/{id}", delete(http::close_session))
        .route("/api/v1/sessions/{id}/messages", get(http::session_messages))
        // Inventory
        .route("/api/v1/endpoints", get(http::list_endpoints))
        .route("/api/v1/endpoints/{id}/config", put(http::put_endpoint_config))
        .route("/api/v1/runtimes", get(http::list_runtimes))
        // Audit (admin)
        .route("/api/v1/audit", get(http::list_audit))
        // WebSocket populations
        .route("/ws/runtime", get(ws_runtime::ws_handler))
        .route("/ws/client", get(ws_client::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
