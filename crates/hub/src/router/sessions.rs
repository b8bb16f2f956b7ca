// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle operations shared by the WS router and the HTTP admin
//! surface.

use std::sync::Arc;

use super::load_session;
use crate::auth::Identity;
use crate::error::HubError;
use crate::protocol::{Envelope, SessionCreate};
use crate::state::HubState;
use crate::store::SessionRow;

/// Create a session on an endpoint and notify the owning runtime.
pub async fn create_session(
    state: &Arc<HubState>,
    identity: &Identity,
    endpoint_id: &str,
    resume_session_id: Option<String>,
) -> Result<SessionRow, HubError> {
    let endpoint = state
        .store
        .endpoint(endpoint_id)
        .await
        .map_err(|e| {
            tracing::error!(endpoint_id, err = %e, "endpoint lookup failed");
            HubError::PersistFailed
        })?
        .ok_or(HubError::BadRequest)?;

    // Endpoints with grants are restricted to granted users; ungranted
    // endpoints are open. Admins always pass.
    if !identity.role.is_admin() {
        let has_grants = state
            .store
            .endpoint_has_grants(endpoint_id)
            .await
            .map_err(|_| HubError::PersistFailed)?;
        if has_grants {
            let allowed = state
                .store
                .check_endpoint_permission(endpoint_id, &identity.user_id)
                .await
                .map_err(|_| HubError::PersistFailed)?;
            if !allowed {
                return Err(HubError::Forbidden);
            }
        }
    }

    let open = state
        .store
        .count_open_sessions_for_user(&identity.user_id)
        .await
        .map_err(|_| HubError::PersistFailed)?;
    if open >= state.config.max_sessions_per_user {
        return Err(HubError::MaxSessions);
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let sess = state
        .store
        .create_session(
            &session_id,
            &identity.user_id,
            &endpoint.id,
            &endpoint.runtime_id,
            &endpoint.org_id,
            &endpoint.profile,
        )
        .await
        .map_err(|e| {
            tracing::error!(endpoint_id, err = %e, "session insert failed");
            HubError::PersistFailed
        })?;

    let _ = state
        .store
        .append_audit(
            "session.create",
            Some(&sess.id),
            Some(&sess.runtime_id),
            Some(&identity.user_id),
            serde_json::json!({"endpoint_id": endpoint.id}),
        )
        .await;

    let create = Envelope::new(
        "session.create",
        Some(sess.id.clone()),
        SessionCreate {
            endpoint_id: endpoint.id.clone(),
            user_id: identity.user_id.clone(),
            resume_session_id,
        },
    );
    let runtime = match state.registry.runtime_for_endpoint(&endpoint.id).await {
        Some(conn) => Some(conn),
        None => state.registry.runtime(&endpoint.runtime_id).await,
    };
    match runtime {
        Some(conn) => {
            conn.send(&create);
        }
        None => {
            tracing::warn!(
                session_id = %sess.id,
                runtime_id = %endpoint.runtime_id,
                "session created with runtime offline"
            );
        }
    }

    Ok(sess)
}

/// Close a session: durable state first, then runtime notice and fan-out.
pub async fn close_session(
    state: &Arc<HubState>,
    identity: &Identity,
    session_id: &str,
) -> Result<(), HubError> {
    let sess = load_session(state, session_id).await?;
    if !identity.role.is_admin() && sess.user_id != identity.user_id {
        return Err(HubError::Forbidden);
    }

    state
        .store
        .update_session_state(&sess.id, "closed")
        .await
        .map_err(|_| HubError::PersistFailed)?;

    if let Some(runtime) = state.registry.runtime(&sess.runtime_id).await {
        runtime.send(&Envelope::new("session.close", Some(sess.id.clone()), serde_json::json!({})));
    }
    broadcast_session_closed(state, &sess.id).await;

    let _ = state
        .store
        .append_audit(
            "session.close",
            Some(&sess.id),
            Some(&sess.runtime_id),
            Some(&identity.user_id),
            serde_json::json!({}),
        )
        .await;
    Ok(())
}

/// Emit `session.closed` to every subscriber and drop the subscriber set.
pub async fn broadcast_session_closed(state: &Arc<HubState>, session_id: &str) {
    let subs = state.registry.clear_subscribers(session_id).await;
    if subs.is_empty() {
        return;
    }
    let env = Envelope::new("session.closed", Some(session_id.to_owned()), serde_json::json!({}));
    let text = env.to_text();
    for client in subs {
        client.send_text(text.clone());
    }
}

/// Push a config override to the runtime currently offering an endpoint.
/// Returns false when no such runtime is connected.
pub async fn push_endpoint_config_update(
    state: &Arc<HubState>,
    endpoint_id: &str,
    security: Option<serde_json::Value>,
    limits: Option<serde_json::Value>,
) -> bool {
    let Some(runtime) = state.registry.runtime_for_endpoint(endpoint_id).await else {
        return false;
    };
    let update = Envelope::new(
        "endpoint.config.update",
        None,
        crate::protocol::EndpointConfigUpdate {
            endpoint_id: endpoint_id.to_owned(),
            security,
            limits,
        },
    );
    runtime.send(&update)
}
