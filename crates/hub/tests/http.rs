// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the HTTP admin surface.

use std::sync::Arc;

use axum::http::StatusCode;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use corral::auth::Auth;
use corral::config::HubConfig;
use corral::protocol::EndpointRegistration;
use corral::state::HubState;
use corral::store::Store;
use corral::transport::build_router;

/// Build hub state on an in-memory store with seeded users.
async fn test_state(mutate: impl FnOnce(&mut HubConfig)) -> Arc<HubState> {
    let mut config = HubConfig::parse_from(["corral"]);
    mutate(&mut config);

    let store = Store::open_in_memory().await.expect("open store");
    store.upsert_user("u-alice", "alice", "user", "org-a", "tok-alice").await.expect("user");
    store.upsert_user("u-bob", "bob", "user", "org-a", "tok-bob").await.expect("user");
    store.upsert_user("u-admin", "admin", "admin", "org-a", "tok-admin").await.expect("user");

    let auth = Auth::new(
        store.clone(),
        config.static_runtime_tokens(),
        config.rotating_token_secret.clone(),
        config.rotating_token_lifetime(),
    );
    Arc::new(HubState::new(config, store, auth, CancellationToken::new()))
}

async fn seed_endpoint(state: &Arc<HubState>, runtime_id: &str, endpoint_id: &str) {
    state.store.upsert_runtime(runtime_id, "org-a", false).await.expect("runtime");
    let reg = EndpointRegistration {
        id: endpoint_id.to_owned(),
        profile: "claude-code".to_owned(),
        name: format!("{endpoint_id} chat"),
        tags: vec![],
        caps: vec![],
        security: serde_json::json!({}),
    };
    state.store.upsert_endpoint(&reg, runtime_id, "org-a").await.expect("endpoint");
}

fn server(state: Arc<HubState>) -> axum_test::TestServer {
    axum_test::TestServer::new(build_router(state)).expect("create test server")
}

// -- Health -------------------------------------------------------------------

#[tokio::test]
async fn health_is_open_and_reports_counts() {
    let server = server(test_state(|_| {}).await);
    let resp = server.get("/api/v1/health").await;
    resp.assert_status(StatusCode::OK);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "running");
    assert_eq!(body["runtimes"], 0);
    assert_eq!(body["clients"], 0);
}

// -- Auth ---------------------------------------------------------------------

#[tokio::test]
async fn missing_bearer_is_unauthorized() {
    let server = server(test_state(|_| {}).await);
    let resp = server.get("/api/v1/sessions").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "invalid_credentials");
}

#[tokio::test]
async fn bad_bearer_is_unauthorized() {
    let server = server(test_state(|_| {}).await);
    let resp =
        server.get("/api/v1/sessions").add_header("authorization", "Bearer nope").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
}

// -- Session create / list / close --------------------------------------------

#[tokio::test]
async fn create_session_requires_known_endpoint() {
    let server = server(test_state(|_| {}).await);
    let resp = server
        .post("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-alice")
        .json(&serde_json::json!({"endpoint_id": "nope"}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_list_and_close_session() {
    let state = test_state(|_| {}).await;
    seed_endpoint(&state, "rt-1", "ep1").await;
    let server = server(Arc::clone(&state));

    let resp = server
        .post("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-alice")
        .json(&serde_json::json!({"endpoint_id": "ep1"}))
        .await;
    resp.assert_status(StatusCode::OK);
    let created: serde_json::Value = resp.json();
    let session_id = created["id"].as_str().expect("session id").to_owned();
    assert_eq!(created["state"], "creating");
    assert_eq!(created["user_id"], "u-alice");

    // The owner sees it; another user does not; an admin sees everything.
    let listed: Vec<serde_json::Value> = server
        .get("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-alice")
        .await
        .json();
    assert_eq!(listed.len(), 1);
    let listed: Vec<serde_json::Value> = server
        .get("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-bob")
        .await
        .json();
    assert!(listed.is_empty());
    let listed: Vec<serde_json::Value> = server
        .get("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-admin")
        .await
        .json();
    assert_eq!(listed.len(), 1);

    // Only the owner (or an admin) may close.
    let resp = server
        .delete(&format!("/api/v1/sessions/{session_id}"))
        .add_header("authorization", "Bearer tok-bob")
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);

    let resp = server
        .delete(&format!("/api/v1/sessions/{session_id}"))
        .add_header("authorization", "Bearer tok-alice")
        .await;
    resp.assert_status(StatusCode::OK);
    let sess = state.store.session(&session_id).await.expect("get").expect("present");
    assert_eq!(sess.state, "closed");

    let audit =
        state.store.list_audit(None, Some("session.close"), 10).await.expect("audit");
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn session_cap_returns_max_sessions() {
    let state = test_state(|c| c.max_sessions_per_user = 1).await;
    seed_endpoint(&state, "rt-1", "ep1").await;
    let server = server(Arc::clone(&state));

    let resp = server
        .post("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-alice")
        .json(&serde_json::json!({"endpoint_id": "ep1"}))
        .await;
    resp.assert_status(StatusCode::OK);

    let resp = server
        .post("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-alice")
        .json(&serde_json::json!({"endpoint_id": "ep1"}))
        .await;
    resp.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "max_sessions");
}

#[tokio::test]
async fn granted_endpoints_are_restricted() {
    let state = test_state(|_| {}).await;
    seed_endpoint(&state, "rt-1", "ep1").await;
    state.store.grant_endpoint_permission("ep1", "u-bob", "u-admin").await.expect("grant");
    let server = server(Arc::clone(&state));

    // Grants exist and alice has none.
    let resp = server
        .post("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-alice")
        .json(&serde_json::json!({"endpoint_id": "ep1"}))
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);

    // bob holds a grant; admins bypass.
    let resp = server
        .post("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-bob")
        .json(&serde_json::json!({"endpoint_id": "ep1"}))
        .await;
    resp.assert_status(StatusCode::OK);
    let resp = server
        .post("/api/v1/sessions")
        .add_header("authorization", "Bearer tok-admin")
        .json(&serde_json::json!({"endpoint_id": "ep1"}))
        .await;
    resp.assert_status(StatusCode::OK);
}

// -- Transcript page ----------------------------------------------------------

#[tokio::test]
async fn transcript_page_enforces_ownership() {
    let state = test_state(|_| {}).await;
    seed_endpoint(&state, "rt-1", "ep1").await;
    state
        .store
        .create_session("s1", "u-alice", "ep1", "rt-1", "org-a", "claude-code")
        .await
        .expect("session");
    for i in 1..=3 {
        state
            .store
            .append_message("s1", &format!("m{i}"), "user", "stdin", "hello")
            .await
            .expect("append");
    }
    let server = server(Arc::clone(&state));

    let resp = server
        .get("/api/v1/sessions/s1/messages?after_seq=1")
        .add_header("authorization", "Bearer tok-alice")
        .await;
    resp.assert_status(StatusCode::OK);
    let rows: Vec<serde_json::Value> = resp.json();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["seq"], 2);

    let resp = server
        .get("/api/v1/sessions/s1/messages")
        .add_header("authorization", "Bearer tok-bob")
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);

    let resp = server
        .get("/api/v1/sessions/missing/messages")
        .add_header("authorization", "Bearer tok-alice")
        .await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

// -- Endpoint config overrides ------------------------------------------------

#[tokio::test]
async fn config_put_validates_permission_mode() {
    let state = test_state(|_| {}).await;
    seed_endpoint(&state, "rt-1", "ep1").await;
    let server = server(Arc::clone(&state));

    let resp = server
        .put("/api/v1/endpoints/ep1/config")
        .add_header("authorization", "Bearer tok-admin")
        .json(&serde_json::json!({"security": {"permission_mode": "yolo"}}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    let resp = server
        .put("/api/v1/endpoints/ep1/config")
        .add_header("authorization", "Bearer tok-admin")
        .json(&serde_json::json!({"security": {"permission_mode": "strict"}}))
        .await;
    resp.assert_status(StatusCode::OK);
    let body: serde_json::Value = resp.json();
    // No runtime is connected, so nothing was pushed, but it persisted.
    assert_eq!(body["pushed"], false);
    let row = state.store.config_override("ep1").await.expect("get").expect("present");
    assert!(row.security.is_some());
}

#[tokio::test]
async fn config_put_is_admin_only() {
    let state = test_state(|_| {}).await;
    seed_endpoint(&state, "rt-1", "ep1").await;
    let server = server(state);

    let resp = server
        .put("/api/v1/endpoints/ep1/config")
        .add_header("authorization", "Bearer tok-alice")
        .json(&serde_json::json!({"security": {"permission_mode": "strict"}}))
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);
}

// -- Audit --------------------------------------------------------------------

#[tokio::test]
async fn audit_listing_is_admin_only() {
    let state = test_state(|_| {}).await;
    state
        .store
        .append_audit("runtime.connect", None, Some("rt-1"), None, serde_json::json!({}))
        .await
        .expect("audit");
    let server = server(state);

    let resp =
        server.get("/api/v1/audit").add_header("authorization", "Bearer tok-alice").await;
    resp.assert_status(StatusCode::FORBIDDEN);

    let resp =
        server.get("/api/v1/audit").add_header("authorization", "Bearer tok-admin").await;
    resp.assert_status(StatusCode::OK);
    let entries: Vec<serde_json::Value> = resp.json();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["event"], "runtime.connect");
}

// -- Inventory ----------------------------------------------------------------

#[tokio::test]
async fn endpoint_and_runtime_listings() {
    let state = test_state(|_| {}).await;
    seed_endpoint(&state, "rt-1", "ep1").await;
    let server = server(state);

    let endpoints: Vec<serde_json::Value> = server
        .get("/api/v1/endpoints")
        .add_header("authorization", "Bearer tok-alice")
        .await
        .json();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0]["id"], "ep1");
    assert_eq!(endpoints[0]["profile"], "claude-code");

    let runtimes: Vec<serde_json::Value> = server
        .get("/api/v1/runtimes")
        .add_header("authorization", "Bearer tok-alice")
        .await
        .json();
    assert_eq!(runtimes.len(), 1);
    assert_eq!(runtimes[0]["online"], false);
}
