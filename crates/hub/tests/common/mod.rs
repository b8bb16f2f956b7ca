// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness for integration tests: an in-process hub on an ephemeral
//! port, seeded users, and WebSocket helpers for both populations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use corral::auth::{Auth, Identity};
use corral::config::HubConfig;
use corral::protocol::EndpointRegistration;
use corral::state::HubState;
use corral::store::Store;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestHub {
    pub addr: SocketAddr,
    pub state: Arc<HubState>,
    shutdown: CancellationToken,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start a hub on an ephemeral port with an in-memory store and seeded users
/// (alice, bob, admin) plus a static runtime token for `rt-1`.
pub async fn start_hub(mutate: impl FnOnce(&mut HubConfig)) -> TestHub {
    let mut config = HubConfig::parse_from(["corral"]);
    config.runtime_tokens = "rt-1=rtok-1,rt-2=rtok-2".to_owned();
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
    let shutdown = CancellationToken::new();
    let state = Arc::new(HubState::new(config, store, auth, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = corral::transport::build_router(Arc::clone(&state));
    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(serve_shutdown.cancelled_owned())
        .await;
    });

    TestHub { addr, state, shutdown }
}

impl TestHub {
    pub fn ws_url(&self, path_and_query: &str) -> String {
        format!("ws://{}{}", self.addr, path_and_query)
    }

    /// Resolve a seeded user's identity through the auth layer.
    pub async fn identity(&self, token: &str) -> Identity {
        self.state.auth.validate_bearer(token).await.expect("identity")
    }

    /// Connect a runtime, run the hello handshake, and assert admission.
    pub async fn connect_runtime(
        &self,
        runtime_id: &str,
        token: &str,
        endpoint_ids: &[&str],
    ) -> Ws {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.ws_url("/ws/runtime"))
            .await
            .expect("runtime connect");

        let endpoints: Vec<EndpointRegistration> = endpoint_ids
            .iter()
            .map(|id| EndpointRegistration {
                id: (*id).to_owned(),
                profile: "claude-code".to_owned(),
                name: format!("{id} chat"),
                tags: vec![],
                caps: vec![],
                security: serde_json::json!({}),
            })
            .collect();
        send_env(
            &mut ws,
            "runtime.hello",
            None,
            serde_json::json!({
                "runtime_id": runtime_id,
                "token": token,
                "org_id": "org-a",
                "endpoints": endpoints,
            }),
        )
        .await;

        let ack = recv_kind(&mut ws, "hello.ack").await;
        assert_eq!(ack["payload"]["ok"], true, "runtime not admitted: {ack}");
        ws
    }

    /// Connect a client with a bearer token in the query string.
    pub async fn connect_client(&self, token: &str) -> Ws {
        let url = self.ws_url(&format!("/ws/client?token={token}"));
        let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("client connect");
        ws
    }

    /// Create a session through the router, as the admin API does.
    pub async fn create_session(&self, token: &str, endpoint_id: &str) -> String {
        let identity = self.identity(token).await;
        let sess = corral::router::sessions::create_session(&self.state, &identity, endpoint_id, None)
            .await
            .expect("create session");
        sess.id
    }
}

/// Send one envelope frame.
pub async fn send_env(
    ws: &mut Ws,
    kind: &str,
    session_id: Option<&str>,
    payload: serde_json::Value,
) {
    let mut frame = serde_json::json!({
        "type": kind,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "payload": payload,
    });
    if let Some(sid) = session_id {
        frame["session_id"] = serde_json::Value::from(sid);
    }
    ws.send(Message::Text(frame.to_string().into())).await.expect("ws send");
}

/// Receive the next text frame as JSON, skipping control frames.
pub async fn recv_env(ws: &mut Ws) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("recv timeout")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("frame json")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected ws message: {other:?}"),
        }
    }
}

/// Receive frames until one matches `kind`, skipping hub pings and unrelated
/// pushes.
pub async fn recv_kind(ws: &mut Ws, kind: &str) -> serde_json::Value {
    loop {
        let frame = recv_env(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Assert that no text frame of the given kind arrives within `window`.
pub async fn assert_silent(ws: &mut Ws, window: Duration) {
    let outcome = tokio::time::timeout(window, ws.next()).await;
    match outcome {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
        Ok(other) => panic!("expected silence, got: {other:?}"),
    }
}
