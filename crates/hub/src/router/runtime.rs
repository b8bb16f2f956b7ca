// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound dispatch for runtime connections.
//!
//! Runtime-side problems have no reply channel beyond the three ack types, so
//! malformed or unauthorized frames are logged and dropped.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::files;
use crate::protocol::{AgentOutput, Envelope, PermissionRequest, TurnCompleted};
use crate::state::{HubState, PendingPermission, RuntimeConn};
use crate::store::SessionRow;

/// Dispatch one frame from a runtime connection.
pub async fn handle_frame(state: &Arc<HubState>, conn: &Arc<RuntimeConn>, env: Envelope) {
    match env.kind.as_str() {
        "agent.output" => handle_agent_output(state, conn, env).await,
        "turn.started" => handle_turn_started(state, conn, env).await,
        "turn.completed" => handle_turn_completed(state, conn, env).await,
        "stop.ack" => {
            if let Some(sess) = owned_session(state, conn, &env).await {
                state.broadcast(&sess.id, &env).await;
            }
        }
        "endpoint.config.ack" => {
            // Config acks carry no session; surface the outcome in the log.
            tracing::info!(runtime_id = %conn.id, payload = %env.payload, "endpoint config ack");
        }
        "pong" => {}
        "permission.request" => handle_permission_request(state, conn, env).await,
        "file.available" => files::handle_file_available(state, conn, env).await,
        other => {
            tracing::debug!(runtime_id = %conn.id, kind = other, "unknown runtime frame dropped");
        }
    }
}

/// Resolve the envelope's session and verify the sender owns it. Frames for
/// unknown or foreign sessions are dropped.
async fn owned_session(
    state: &HubState,
    conn: &RuntimeConn,
    env: &Envelope,
) -> Option<SessionRow> {
    let session_id = env.session_id.as_deref()?;
    let sess = match state.store.session(session_id).await {
        Ok(Some(sess)) => sess,
        Ok(None) => {
            tracing::debug!(runtime_id = %conn.id, session_id, "frame for unknown session dropped");
            return None;
        }
        Err(e) => {
            tracing::error!(session_id, err = %e, "session lookup failed");
            return None;
        }
    };
    if sess.runtime_id != conn.id {
        tracing::warn!(
            runtime_id = %conn.id,
            session_id,
            owner = %sess.runtime_id,
            "frame from non-owning runtime dropped"
        );
        return None;
    }
    Some(sess)
}

async fn handle_agent_output(state: &Arc<HubState>, conn: &Arc<RuntimeConn>, env: Envelope) {
    let Some(sess) = owned_session(state, conn, &env).await else {
        return;
    };
    let output: AgentOutput = match env.payload_as() {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(session_id = %sess.id, err = %e, "malformed agent.output dropped");
            return;
        }
    };
    if output.content.len() > state.config.max_runtime_msg_bytes {
        tracing::warn!(
            session_id = %sess.id,
            size = output.content.len(),
            "oversize agent.output dropped"
        );
        return;
    }

    let message_id = uuid::Uuid::new_v4().to_string();
    let seq = match state
        .store
        .append_message(&sess.id, &message_id, "agent", &output.channel, &output.content)
        .await
    {
        Ok(seq) => seq,
        Err(e) => {
            tracing::error!(session_id = %sess.id, err = %e, "agent message append failed");
            return;
        }
    };
    let _ = state.store.touch_session(&sess.id).await;

    // Stamp the assigned seq into the payload before fan-out.
    let mut payload = env.payload;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("seq".to_owned(), serde_json::Value::from(seq));
    }
    let out = Envelope::with_value("agent.output", Some(sess.id.clone()), payload);
    state.broadcast(&sess.id, &out).await;
}

async fn handle_turn_started(state: &Arc<HubState>, conn: &Arc<RuntimeConn>, env: Envelope) {
    let Some(sess) = owned_session(state, conn, &env).await else {
        return;
    };
    if let Err(e) = state.store.update_session_state(&sess.id, "responding").await {
        tracing::error!(session_id = %sess.id, err = %e, "state update failed");
    }
    state.registry.set_turn_started(&sess.id).await;
    state.broadcast(&sess.id, &env).await;
}

async fn handle_turn_completed(state: &Arc<HubState>, conn: &Arc<RuntimeConn>, env: Envelope) {
    let Some(sess) = owned_session(state, conn, &env).await else {
        return;
    };
    let completed: TurnCompleted = env.payload_as().unwrap_or(TurnCompleted {
        exit_code: None,
        native_handle: None,
    });

    if let Err(e) = state.store.update_session_state(&sess.id, "active").await {
        tracing::error!(session_id = %sess.id, err = %e, "state update failed");
    }
    if let Some(ref handle) = completed.native_handle {
        if let Err(e) = state.store.set_native_handle(&sess.id, handle).await {
            tracing::error!(session_id = %sess.id, err = %e, "native handle update failed");
        }
    }

    let duration_ms = state
        .registry
        .take_turn_started(&sess.id)
        .await
        .map(|started| started.elapsed().as_millis() as i64);
    let mut detail = serde_json::json!({});
    if let Some(ms) = duration_ms {
        detail["duration_ms"] = serde_json::Value::from(ms);
    }
    if let Some(code) = completed.exit_code {
        detail["exit_code"] = serde_json::Value::from(code);
    }
    let _ = state
        .store
        .append_audit("turn.completed", Some(&sess.id), Some(&conn.id), None, detail)
        .await;

    state.broadcast(&sess.id, &env).await;
}

async fn handle_permission_request(state: &Arc<HubState>, conn: &Arc<RuntimeConn>, env: Envelope) {
    let Some(sess) = owned_session(state, conn, &env).await else {
        return;
    };
    let request: PermissionRequest = match env.payload_as() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(session_id = %sess.id, err = %e, "malformed permission.request dropped");
            return;
        }
    };

    let timer = CancellationToken::new();
    state
        .registry
        .insert_pending_permission(
            &request.request_id,
            PendingPermission {
                session_id: sess.id.clone(),
                runtime_id: conn.id.clone(),
                timer: timer.clone(),
            },
        )
        .await;
    spawn_permission_timer(Arc::clone(state), request.request_id.clone(), timer);

    let _ = state
        .store
        .append_audit(
            "permission.requested",
            Some(&sess.id),
            Some(&conn.id),
            None,
            serde_json::json!({"request_id": request.request_id, "tool": request.tool}),
        )
        .await;

    state.broadcast(&sess.id, &env).await;
}

/// Arm the one-shot denial timer for a pending permission.
fn spawn_permission_timer(state: Arc<HubState>, request_id: String, timer: CancellationToken) {
    let timeout = state.config.permission_timeout();
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => return,
            _ = state.shutdown.cancelled() => return,
            _ = tokio::time::sleep(timeout) => {}
        }
        expire_permission(&state, &request_id).await;
    });
}

/// Fabricate a denial for an unanswered permission prompt.
async fn expire_permission(state: &Arc<HubState>, request_id: &str) {
    let Some(pending) = state.registry.remove_pending_permission(request_id).await else {
        // A client answered between the timer firing and this cleanup.
        return;
    };

    let denial = Envelope::new(
        "permission.response",
        Some(pending.session_id.clone()),
        serde_json::json!({"request_id": request_id, "approved": false}),
    );

    if let Some(runtime) = state.registry.runtime(&pending.runtime_id).await {
        runtime.send(&denial);
    } else {
        tracing::debug!(
            runtime_id = %pending.runtime_id,
            request_id,
            "permission timeout with runtime offline"
        );
    }
    state.broadcast(&pending.session_id, &denial).await;

    let _ = state
        .store
        .append_audit(
            "permission.timeout",
            Some(&pending.session_id),
            Some(&pending.runtime_id),
            None,
            serde_json::json!({"request_id": request_id}),
        )
        .await;
}
