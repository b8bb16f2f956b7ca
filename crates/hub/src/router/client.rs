// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound dispatch for client connections.
//!
//! Every operation resolves the session from the store and checks ownership:
//! reads (subscribe) admit the owner or an admin, writes and stop require the
//! owner. Violations surface to the offending client as `forbidden`.

use std::sync::Arc;

use super::{load_session, send_error};
use crate::error::HubError;
use crate::protocol::{
    Envelope, HistoryResponse, PermissionResponse, StoredMessage, Subscribe, UserMessage,
};
use crate::state::{ClientConn, HubState};

/// Cap on messages returned in one `history.response`.
const HISTORY_PAGE_LIMIT: i64 = 1000;

/// Dispatch one frame from a client connection.
pub async fn handle_frame(state: &Arc<HubState>, client: &Arc<ClientConn>, env: Envelope) {
    if !client.allow_message().await {
        send_error(client, HubError::RateLimited, env.session_id.clone(), "slow down");
        return;
    }

    match env.kind.as_str() {
        "user.message" => handle_user_message(state, client, env).await,
        "client.subscribe" => handle_subscribe(state, client, env).await,
        "client.unsubscribe" => {
            if let Some(session_id) = env.session_id.as_deref() {
                state.registry.unsubscribe(session_id, &client.id).await;
            }
        }
        "stop.request" => handle_stop_request(state, client, env).await,
        "permission.response" => handle_permission_response(state, client, env).await,
        other => {
            send_error(
                client,
                HubError::BadRequest,
                env.session_id.clone(),
                &format!("unknown message type: {other}"),
            );
        }
    }
}

async fn handle_user_message(state: &Arc<HubState>, client: &Arc<ClientConn>, env: Envelope) {
    let Some(session_id) = env.session_id.clone() else {
        send_error(client, HubError::BadRequest, None, "session_id required");
        return;
    };
    let sess = match load_session(state, &session_id).await {
        Ok(sess) => sess,
        Err(e) => {
            send_error(client, e, Some(session_id), "unknown session");
            return;
        }
    };
    if !client.owns(&sess.user_id) {
        send_error(client, HubError::Forbidden, Some(session_id), "not your session");
        return;
    }
    let msg: UserMessage = match env.payload_as() {
        Ok(m) => m,
        Err(e) => {
            send_error(client, HubError::BadRequest, Some(session_id), &format!("bad payload: {e}"));
            return;
        }
    };

    // A retried message collides on its client-supplied id and is dropped
    // without an error: the first attempt already owns the transcript row.
    match state.store.message_exists(&sess.id, &msg.message_id).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            tracing::error!(session_id = %sess.id, err = %e, "idempotency probe failed");
            send_error(client, HubError::PersistFailed, Some(session_id), "store unavailable");
            return;
        }
    }

    if state.config.turn_based && sess.state == "responding" {
        send_error(client, HubError::TurnInProgress, Some(session_id), "turn in progress");
        return;
    }
    if msg.content.len() > state.config.max_client_msg_bytes {
        send_error(client, HubError::MessageTooLarge, Some(session_id), "message too large");
        return;
    }

    if let Err(e) = state
        .store
        .append_message(&sess.id, &msg.message_id, "user", "stdin", &msg.content)
        .await
    {
        tracing::error!(session_id = %sess.id, err = %e, "user message append failed");
        send_error(client, HubError::PersistFailed, Some(session_id), "persist failed");
        return;
    }
    let _ = state.store.touch_session(&sess.id).await;

    let Some(runtime) = state.registry.runtime(&sess.runtime_id).await else {
        send_error(client, HubError::SessionNotFound, Some(session_id), "runtime offline");
        return;
    };

    // Forward the raw payload so optional fields we do not model survive,
    // with the stored recovery hints stamped on top.
    let mut payload = env.payload;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("endpoint_id".to_owned(), serde_json::Value::from(sess.endpoint_id.clone()));
        if let Some(ref handle) = sess.native_handle {
            obj.insert("native_handle".to_owned(), serde_json::Value::from(handle.clone()));
        }
    }
    let out = Envelope::with_value("user.message", Some(sess.id.clone()), payload);
    if !runtime.send(&out) {
        send_error(client, HubError::SessionNotFound, Some(sess.id), "runtime offline");
    }
}

async fn handle_subscribe(state: &Arc<HubState>, client: &Arc<ClientConn>, env: Envelope) {
    let Some(session_id) = env.session_id.clone() else {
        send_error(client, HubError::BadRequest, None, "session_id required");
        return;
    };
    let sess = match load_session(state, &session_id).await {
        Ok(sess) => sess,
        Err(e) => {
            send_error(client, e, Some(session_id), "unknown session");
            return;
        }
    };
    if !client.can_read(&sess.user_id) {
        send_error(client, HubError::Forbidden, Some(session_id), "not your session");
        return;
    }
    let sub: Subscribe = env.payload_as().unwrap_or(Subscribe { after_seq: 0 });

    state.registry.subscribe(&sess.id, Arc::clone(client)).await;

    let rows = match state
        .store
        .messages_after(&sess.id, sub.after_seq, HISTORY_PAGE_LIMIT)
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(session_id = %sess.id, err = %e, "history load failed");
            send_error(client, HubError::PersistFailed, Some(session_id), "history unavailable");
            return;
        }
    };
    let messages = rows
        .into_iter()
        .map(|r| StoredMessage {
            id: r.id,
            session_id: r.session_id,
            seq: r.seq,
            direction: r.direction,
            channel: r.channel,
            content: r.content,
            created_at: r.created_at,
        })
        .collect();
    let history =
        Envelope::new("history.response", Some(sess.id.clone()), HistoryResponse { messages });
    let _ = client.send(&history);
}

async fn handle_stop_request(state: &Arc<HubState>, client: &Arc<ClientConn>, env: Envelope) {
    let Some(session_id) = env.session_id.clone() else {
        send_error(client, HubError::BadRequest, None, "session_id required");
        return;
    };
    let sess = match load_session(state, &session_id).await {
        Ok(sess) => sess,
        Err(e) => {
            send_error(client, e, Some(session_id), "unknown session");
            return;
        }
    };
    if !client.owns(&sess.user_id) {
        send_error(client, HubError::Forbidden, Some(session_id), "not your session");
        return;
    }

    let Some(runtime) = state.registry.runtime(&sess.runtime_id).await else {
        send_error(client, HubError::SessionNotFound, Some(session_id), "runtime offline");
        return;
    };
    runtime.send(&env);

    let _ = state
        .store
        .append_audit("session.stop", Some(&sess.id), None, Some(&client.user_id), serde_json::json!({}))
        .await;
}

async fn handle_permission_response(
    state: &Arc<HubState>,
    client: &Arc<ClientConn>,
    env: Envelope,
) {
    let resp: PermissionResponse = match env.payload_as() {
        Ok(r) => r,
        Err(e) => {
            send_error(client, HubError::BadRequest, env.session_id.clone(), &format!("bad payload: {e}"));
            return;
        }
    };

    let Some(pending) = state.registry.remove_pending_permission(&resp.request_id).await else {
        // Already answered or timed out; the prompt outcome is settled.
        tracing::debug!(request_id = %resp.request_id, "permission response for unknown request");
        return;
    };

    let sess = match load_session(state, &pending.session_id).await {
        Ok(sess) => sess,
        Err(_) => {
            pending.timer.cancel();
            return;
        }
    };
    if !client.can_read(&sess.user_id) {
        // Put the prompt back; someone authorized may still answer in time.
        state.registry.insert_pending_permission(&resp.request_id, pending).await;
        send_error(client, HubError::Forbidden, Some(sess.id), "not your session");
        return;
    }
    pending.timer.cancel();

    let verdict = if resp.approved { "permission.granted" } else { "permission.denied" };
    let _ = state
        .store
        .append_audit(
            verdict,
            Some(&pending.session_id),
            Some(&pending.runtime_id),
            Some(&client.user_id),
            serde_json::json!({"request_id": resp.request_id.clone()}),
        )
        .await;

    let out = Envelope::with_value(
        "permission.response",
        Some(pending.session_id.clone()),
        env.payload,
    );
    if let Some(runtime) = state.registry.runtime(&pending.runtime_id).await {
        runtime.send(&out);
    } else {
        tracing::debug!(
            runtime_id = %pending.runtime_id,
            request_id = %resp.request_id,
            "permission verdict with runtime offline"
        );
    }
    // Mirror the verdict to subscribers so every open UI settles the prompt.
    state.broadcast(&pending.session_id, &out).await;
}
