// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client WebSocket admitter: bearer auth on the handshake, the per-user
//! connection cap, and the per-socket read loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::protocol::{self, Envelope};
use crate::router;
use crate::state::{ClientConn, HubState};
use crate::transport::http::bearer_from_headers;

/// WS close code for policy violations (RFC 6455 §7.4.1).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientWsQuery {
    /// Bearer token fallback: browsers cannot set headers on WS handshakes.
    pub token: Option<String>,
}

/// Wraps [`ConnectInfo`] extraction so a missing connect-info extension
/// (e.g. when the service isn't run via `into_make_service_with_connect_info`)
/// yields `None` instead of failing the extractor chain.
pub struct MaybeConnectInfo(Option<SocketAddr>);

impl<S> axum::extract::FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        match ConnectInfo::<SocketAddr>::from_request_parts(parts, state).await {
            Ok(ConnectInfo(addr)) => Ok(MaybeConnectInfo(Some(addr))),
            Err(_) => Ok(MaybeConnectInfo(None)),
        }
    }
}

/// `GET /ws/client` — WebSocket upgrade for a UI client.
pub async fn ws_handler(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    Query(query): Query<ClientWsQuery>,
    connect_info: MaybeConnectInfo,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        return plain_response(403, "origin not allowed");
    }

    // Throttle unauthenticated handshake attempts per source IP.
    let ip = connect_info.0.map(|addr| addr.ip().to_string());
    if let Some(ref ip) = ip {
        if !state.conn_buckets.allow(ip).await {
            return plain_response(429, "rate limited");
        }
    }

    let Some(token) = bearer_from_headers(&headers).or(query.token) else {
        return plain_response(401, "missing bearer token");
    };
    let identity = match state.auth.validate_bearer(&token).await {
        Ok(identity) => identity,
        Err(_) => return plain_response(401, "invalid bearer token"),
    };

    let limit = protocol::max_client_frame_bytes(state.config.max_client_msg_bytes);
    ws.max_message_size(limit)
        .on_upgrade(move |socket| handle_socket(state, identity, socket))
        .into_response()
}

fn plain_response(status: u16, body: &'static str) -> axum::response::Response {
    axum::http::Response::builder()
        .status(status)
        .body(axum::body::Body::from(body))
        .unwrap_or_default()
        .into_response()
}

async fn handle_socket(state: Arc<HubState>, identity: Identity, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let cancel = state.shutdown.child_token();
    let conn = Arc::new(ClientConn::new(&identity, tx, cancel.clone()));

    // The cap is checked post-upgrade so the refusal carries a proper
    // policy-violation close code instead of a failed handshake.
    let admitted = state
        .registry
        .insert_client_capped(Arc::clone(&conn), state.config.max_client_conns_per_user)
        .await;
    if !admitted {
        tracing::warn!(user_id = %identity.user_id, "client connection cap reached");
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: "connection limit reached".into(),
            })))
            .await;
        return;
    }
    tracing::debug!(user_id = %conn.user_id, conn_id = %conn.id, "client connected");

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

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match Envelope::parse(&text) {
                        Ok(env) => router::client::handle_frame(&state, &conn, env).await,
                        Err(e) => {
                            let _ = conn.send(
                                &crate::error::HubError::BadRequest
                                    .to_envelope(None, format!("unparseable frame: {e}")),
                            );
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn.id, err = %e, "client socket error");
                    break;
                }
                _ => {}
            }
        }
    }

    cancel.cancel();
    state.registry.remove_client(&conn.id).await;
    tracing::debug!(user_id = %conn.user_id, conn_id = %conn.id, "client disconnected");
    let _ = writer.await;
}
