// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP admin handlers: a thin shell over the store plus router operations.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::error::HubError;
use crate::router::sessions;
use crate::state::HubState;
use crate::store::SessionRow;

/// Accepted `permission_mode` values on endpoint config overrides.
const PERMISSION_MODES: &[&str] = &["skip", "strict", "auto"];

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub runtimes: usize,
    pub clients: usize,
    pub subscribed_sessions: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub endpoint_id: String,
    #[serde(default)]
    pub resume_session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub endpoint_id: String,
    pub runtime_id: String,
    pub profile: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_handle: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<SessionRow> for SessionInfo {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            endpoint_id: row.endpoint_id,
            runtime_id: row.runtime_id,
            profile: row.profile,
            state: row.state,
            native_handle: row.native_handle,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CloseSessionResponse {
    pub id: String,
    pub closed: bool,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub after_seq: i64,
    #[serde(default = "default_message_limit")]
    pub limit: i64,
}

fn default_message_limit() -> i64 {
    1000
}

#[derive(Debug, Serialize)]
pub struct EndpointInfo {
    pub id: String,
    pub runtime_id: String,
    pub profile: String,
    pub name: String,
    pub tags: serde_json::Value,
    pub caps: serde_json::Value,
    pub security: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RuntimeInfo {
    pub id: String,
    pub org_id: String,
    pub online: bool,
    pub last_seen_at: String,
}

#[derive(Debug, Deserialize)]
pub struct EndpointConfigRequest {
    #[serde(default)]
    pub security: Option<serde_json::Value>,
    #[serde(default)]
    pub limits: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct EndpointConfigResponse {
    pub endpoint_id: String,
    /// Whether the owning runtime was online to receive the push.
    pub pushed: bool,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
}

fn default_audit_limit() -> i64 {
    200
}

#[derive(Debug, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: String,
}

// -- Auth helper --------------------------------------------------------------

/// Extract a bearer token from an `Authorization` header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Authenticate an HTTP request and apply the per-user rate limit.
async fn require_identity(state: &HubState, headers: &HeaderMap) -> Result<Identity, HubError> {
    let token = bearer_from_headers(headers).ok_or(HubError::InvalidCredentials)?;
    let identity = state.auth.validate_bearer(&token).await?;
    if !state.http_buckets.allow(&identity.user_id).await {
        return Err(HubError::RateLimited);
    }
    Ok(identity)
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<HubState>>) -> impl IntoResponse {
    let (runtimes, clients, subscribed_sessions) = s.registry.counts().await;
    Json(HealthResponse { status: "running".to_owned(), runtimes, clients, subscribed_sessions })
}

/// `POST /api/v1/sessions` — create a session on an endpoint.
pub async fn create_session(
    State(s): State<Arc<HubState>>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let identity = match require_identity(&s, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.to_http_response("unauthorized").into_response(),
    };
    match sessions::create_session(&s, &identity, &req.endpoint_id, req.resume_session_id).await {
        Ok(sess) => Json(SessionInfo::from(sess)).into_response(),
        Err(e) => e.to_http_response("session create failed").into_response(),
    }
}

/// `GET /api/v1/sessions` — the caller's sessions; all sessions for admins.
pub async fn list_sessions(
    State(s): State<Arc<HubState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let identity = match require_identity(&s, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.to_http_response("unauthorized").into_response(),
    };
    let rows = if identity.role.is_admin() {
        s.store.list_sessions().await
    } else {
        s.store.list_sessions_for_user(&identity.user_id).await
    };
    match rows {
        Ok(rows) => {
            Json(rows.into_iter().map(SessionInfo::from).collect::<Vec<_>>()).into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "session listing failed");
            HubError::PersistFailed.to_http_response("listing failed").into_response()
        }
    }
}

/// `DELETE /api/v1/sessions/{id}` — close a session.
pub async fn close_session(
    State(s): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let identity = match require_identity(&s, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.to_http_response("unauthorized").into_response(),
    };
    match sessions::close_session(&s, &identity, &id).await {
        Ok(()) => Json(CloseSessionResponse { id, closed: true }).into_response(),
        Err(e) => e.to_http_response("close failed").into_response(),
    }
}

/// `GET /api/v1/sessions/{id}/messages` — a transcript page.
pub async fn session_messages(
    State(s): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    let identity = match require_identity(&s, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.to_http_response("unauthorized").into_response(),
    };
    let sess = match s.store.session(&id).await {
        Ok(Some(sess)) => sess,
        Ok(None) => {
            return HubError::SessionNotFound.to_http_response("unknown session").into_response()
        }
        Err(e) => {
            tracing::error!(session_id = %id, err = %e, "session lookup failed");
            return HubError::PersistFailed.to_http_response("lookup failed").into_response();
        }
    };
    if !identity.role.is_admin() && sess.user_id != identity.user_id {
        return HubError::Forbidden.to_http_response("not your session").into_response();
    }

    let limit = query.limit.clamp(1, 1000);
    match s.store.messages_after(&id, query.after_seq, limit).await {
        Ok(rows) => {
            let messages: Vec<crate::protocol::StoredMessage> = rows
                .into_iter()
                .map(|r| crate::protocol::StoredMessage {
                    id: r.id,
                    session_id: r.session_id,
                    seq: r.seq,
                    direction: r.direction,
                    channel: r.channel,
                    content: r.content,
                    created_at: r.created_at,
                })
                .collect();
            Json(messages).into_response()
        }
        Err(e) => {
            tracing::error!(session_id = %id, err = %e, "message listing failed");
            HubError::PersistFailed.to_http_response("listing failed").into_response()
        }
    }
}

/// `GET /api/v1/endpoints`
pub async fn list_endpoints(
    State(s): State<Arc<HubState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = require_identity(&s, &headers).await {
        return e.to_http_response("unauthorized").into_response();
    }
    match s.store.list_endpoints().await {
        Ok(rows) => {
            let endpoints: Vec<EndpointInfo> = rows
                .into_iter()
                .map(|r| EndpointInfo {
                    id: r.id,
                    runtime_id: r.runtime_id,
                    profile: r.profile,
                    name: r.name,
                    tags: parse_json_column(&r.tags),
                    caps: parse_json_column(&r.caps),
                    security: parse_json_column(&r.security),
                })
                .collect();
            Json(endpoints).into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "endpoint listing failed");
            HubError::PersistFailed.to_http_response("listing failed").into_response()
        }
    }
}

/// `GET /api/v1/runtimes`
pub async fn list_runtimes(
    State(s): State<Arc<HubState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = require_identity(&s, &headers).await {
        return e.to_http_response("unauthorized").into_response();
    }
    match s.store.list_runtimes().await {
        Ok(rows) => {
            let runtimes: Vec<RuntimeInfo> = rows
                .into_iter()
                .map(|r| RuntimeInfo {
                    id: r.id,
                    org_id: r.org_id,
                    online: r.online != 0,
                    last_seen_at: r.last_seen_at,
                })
                .collect();
            Json(runtimes).into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "runtime listing failed");
            HubError::PersistFailed.to_http_response("listing failed").into_response()
        }
    }
}

/// `PUT /api/v1/endpoints/{id}/config` — persist an override and push it to
/// the owning runtime.
pub async fn put_endpoint_config(
    State(s): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<EndpointConfigRequest>,
) -> impl IntoResponse {
    let identity = match require_identity(&s, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.to_http_response("unauthorized").into_response(),
    };
    if !identity.role.is_admin() {
        return HubError::Forbidden.to_http_response("admin only").into_response();
    }

    if let Some(mode) = req.security.as_ref().and_then(|v| v.get("permission_mode")) {
        let valid = mode.as_str().is_some_and(|m| PERMISSION_MODES.contains(&m));
        if !valid {
            return HubError::BadRequest
                .to_http_response(format!("permission_mode must be one of {PERMISSION_MODES:?}"))
                .into_response();
        }
    }

    if let Err(e) =
        s.store.upsert_config_override(&id, req.security.as_ref(), req.limits.as_ref()).await
    {
        tracing::error!(endpoint_id = %id, err = %e, "config override upsert failed");
        return HubError::PersistFailed.to_http_response("persist failed").into_response();
    }
    let pushed = sessions::push_endpoint_config_update(&s, &id, req.security, req.limits).await;
    Json(EndpointConfigResponse { endpoint_id: id, pushed }).into_response()
}

/// `GET /api/v1/audit` — admin-only filtered audit listing.
pub async fn list_audit(
    State(s): State<Arc<HubState>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    let identity = match require_identity(&s, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.to_http_response("unauthorized").into_response(),
    };
    if !identity.role.is_admin() {
        return HubError::Forbidden.to_http_response("admin only").into_response();
    }

    let limit = query.limit.clamp(1, 1000);
    match s.store.list_audit(query.session_id.as_deref(), query.event.as_deref(), limit).await {
        Ok(rows) => {
            let entries: Vec<AuditEntry> = rows
                .into_iter()
                .map(|r| AuditEntry {
                    id: r.id,
                    event: r.event,
                    session_id: r.session_id,
                    runtime_id: r.runtime_id,
                    user_id: r.user_id,
                    detail: parse_json_column(&r.detail),
                    created_at: r.created_at,
                })
                .collect();
            Json(entries).into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "audit listing failed");
            HubError::PersistFailed.to_http_response("listing failed").into_response()
        }
    }
}

fn parse_json_column(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}
