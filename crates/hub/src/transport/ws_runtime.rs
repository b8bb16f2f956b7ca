// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime WebSocket admitter: the `runtime.hello` handshake, the per-socket
//! read loop, and the keepalive pinger.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{self, Envelope, HelloAck, RuntimeHello};
use crate::router;
use crate::state::{HubState, RuntimeConn};

/// Deadline for the first (`runtime.hello`) frame after upgrade.
const HELLO_DEADLINE: Duration = Duration::from_secs(10);

/// Keepalive ping cadence and the staleness cutoff that closes a connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);
const STALE_AFTER_SECS: i64 = 60;

/// `GET /ws/runtime` — WebSocket upgrade for a runtime connection.
pub async fn ws_handler(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        return axum::http::Response::builder()
            .status(403)
            .body(axum::body::Body::from("origin not allowed"))
            .unwrap_or_default()
            .into_response();
    }

    let limit = protocol::max_runtime_frame_bytes(if state.config.file_transfer_enabled() {
        state.config.max_file_bytes
    } else {
        0
    });
    ws.max_message_size(limit)
        .on_upgrade(move |socket| handle_socket(state, socket))
        .into_response()
}

async fn handle_socket(state: Arc<HubState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // One frame, 10 s deadline, or the socket is dropped.
    let hello = match read_hello(&mut ws_rx).await {
        Ok(hello) => hello,
        Err(reason) => {
            tracing::debug!(reason, "runtime handshake failed");
            let nack = Envelope::new(
                "hello.ack",
                None,
                HelloAck { ok: false, error: Some(reason.to_owned()) },
            );
            let _ = ws_tx.send(Message::Text(nack.to_text().into())).await;
            let _ = ws_tx.close().await;
            return;
        }
    };

    if !state.auth.validate_runtime_credentials(&hello.runtime_id, &hello.token) {
        tracing::warn!(runtime_id = %hello.runtime_id, "runtime token rejected");
        let nack = Envelope::new(
            "hello.ack",
            None,
            HelloAck { ok: false, error: Some("invalid_credentials".to_owned()) },
        );
        let _ = ws_tx.send(Message::Text(nack.to_text().into())).await;
        let _ = ws_tx.close().await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let cancel = state.shutdown.child_token();
    let conn = Arc::new(RuntimeConn::new(
        hello.runtime_id.clone(),
        hello.org_id.clone().unwrap_or_default(),
        hello.endpoints.clone(),
        tx,
        cancel.clone(),
    ));

    // Atomic displacement: any previous socket with this id is cancelled
    // inside the registry lock.
    if state.registry.insert_runtime(Arc::clone(&conn)).await.is_some() {
        tracing::info!(runtime_id = %conn.id, "displaced previous runtime connection");
    }

    if let Err(e) = state.store.upsert_runtime(&conn.id, &conn.org_id, true).await {
        tracing::error!(runtime_id = %conn.id, err = %e, "runtime upsert failed");
    }
    for endpoint in &conn.endpoints {
        if let Err(e) = state.store.upsert_endpoint(endpoint, &conn.id, &conn.org_id).await {
            tracing::error!(runtime_id = %conn.id, endpoint_id = %endpoint.id, err = %e, "endpoint upsert failed");
        }
    }
    let _ = state
        .store
        .append_audit(
            "runtime.connect",
            None,
            Some(&conn.id),
            None,
            serde_json::json!({"endpoints": conn.endpoints.len()}),
        )
        .await;

    // Writer task: the single consumer of this socket's outbound channel.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            writer_cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    conn.send(&Envelope::new("hello.ack", None, HelloAck { ok: true, error: None }));
    tracing::info!(runtime_id = %conn.id, endpoints = conn.endpoints.len(), "runtime connected");

    // Replay persisted config overrides for the just-registered endpoints.
    for endpoint in &conn.endpoints {
        match state.store.config_override(&endpoint.id).await {
            Ok(Some(row)) => {
                let update = Envelope::new(
                    "endpoint.config.update",
                    None,
                    crate::protocol::EndpointConfigUpdate {
                        endpoint_id: endpoint.id.clone(),
                        security: row.security.as_deref().and_then(|s| serde_json::from_str(s).ok()),
                        limits: row.limits.as_deref().and_then(|s| serde_json::from_str(s).ok()),
                    },
                );
                conn.send(&update);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(endpoint_id = %endpoint.id, err = %e, "config override lookup failed");
            }
        }
    }

    spawn_keepalive(Arc::clone(&conn));
    if state.auth.rotating_secret_configured() {
        crate::tasks::refresh::spawn_token_refresher(Arc::clone(&state), Arc::clone(&conn));
    }

    // Read loop.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    conn.touch();
                    match Envelope::parse(&text) {
                        Ok(env) => router::runtime::handle_frame(&state, &conn, env).await,
                        Err(e) => {
                            tracing::debug!(runtime_id = %conn.id, err = %e, "unparseable runtime frame dropped");
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(runtime_id = %conn.id, err = %e, "runtime socket error");
                    break;
                }
                _ => {}
            }
        }
    }

    cancel.cancel();
    let was_current = state.registry.remove_runtime(&conn).await;
    if was_current {
        if let Err(e) = state.store.set_runtime_online(&conn.id, false).await {
            tracing::error!(runtime_id = %conn.id, err = %e, "offline mark failed");
        }
        let _ = state
            .store
            .append_audit("runtime.disconnect", None, Some(&conn.id), None, serde_json::json!({}))
            .await;
        tracing::info!(runtime_id = %conn.id, "runtime disconnected");
    }
    let _ = writer.await;
}

/// Read the `runtime.hello` payload from the first text frame.
async fn read_hello(ws_rx: &mut SplitStream<WebSocket>) -> Result<RuntimeHello, &'static str> {
    let deadline = tokio::time::Instant::now() + HELLO_DEADLINE;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| "hello deadline exceeded")?;
        match msg {
            Some(Ok(Message::Text(text))) => {
                let env = Envelope::parse(&text).map_err(|_| "malformed hello frame")?;
                if env.kind != "runtime.hello" {
                    return Err("expected runtime.hello");
                }
                return env.payload_as::<RuntimeHello>().map_err(|_| "malformed hello payload");
            }
            Some(Ok(Message::Close(_))) | None => return Err("socket closed before hello"),
            Some(Err(_)) => return Err("socket error before hello"),
            _ => {} // control frames while waiting
        }
    }
}

/// Protocol-level keepalive: ping every 30 s, drop the connection when no
/// inbound traffic has been seen for over a minute.
fn spawn_keepalive(conn: Arc<RuntimeConn>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(PING_INTERVAL);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = conn.cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            if conn.idle_secs() > STALE_AFTER_SECS {
                tracing::warn!(runtime_id = %conn.id, "runtime unresponsive, closing");
                conn.cancel.cancel();
                break;
            }
            if !conn.send(&Envelope::new("ping", None, serde_json::json!({}))) {
                break;
            }
        }
    });
}
