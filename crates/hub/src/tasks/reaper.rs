// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idle-session reaper and retention sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::router::sessions::broadcast_session_closed;
use crate::state::HubState;

/// Spawn the periodic reaper: closes sessions idle past their profile
/// timeout and, when retention is configured, purges aged rows.
pub fn spawn_idle_reaper(state: Arc<HubState>) {
    let interval = state.config.reaper_interval();

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            reap_idle_sessions(&state).await;
            run_retention(&state).await;
        }
    });
}

pub(crate) async fn reap_idle_sessions(state: &Arc<HubState>) {
    let sessions = match state.store.list_reapable_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::error!(err = %e, "reaper session listing failed");
            return;
        }
    };

    for sess in sessions {
        let timeout = state.config.idle_timeout_for(&sess.profile);
        if timeout <= 0 {
            continue;
        }
        let Ok(updated_at) = DateTime::parse_from_rfc3339(&sess.updated_at) else {
            tracing::warn!(session_id = %sess.id, updated_at = %sess.updated_at, "unparseable updated_at");
            continue;
        };
        let idle_secs = Utc::now().signed_duration_since(updated_at).num_seconds();
        if idle_secs <= timeout {
            continue;
        }

        tracing::info!(session_id = %sess.id, idle_secs, timeout, "closing idle session");
        if let Err(e) = state.store.update_session_state(&sess.id, "closed").await {
            tracing::error!(session_id = %sess.id, err = %e, "idle close failed");
            continue;
        }
        if let Some(runtime) = state.registry.runtime(&sess.runtime_id).await {
            runtime.send(&crate::protocol::Envelope::new(
                "session.close",
                Some(sess.id.clone()),
                serde_json::json!({}),
            ));
        }
        broadcast_session_closed(state, &sess.id).await;
        let _ = state
            .store
            .append_audit(
                "session.idle_close",
                Some(&sess.id),
                Some(&sess.runtime_id),
                Some(&sess.user_id),
                serde_json::json!({"idle_secs": idle_secs}),
            )
            .await;
    }
}

pub(crate) async fn run_retention(state: &Arc<HubState>) {
    if state.config.retention_days <= 0 {
        return;
    }
    let cutoff = Utc::now() - chrono::Duration::days(state.config.retention_days);
    match state.store.purge_before(cutoff).await {
        Ok((0, 0)) => {}
        Ok((messages, audit)) => {
            tracing::info!(messages, audit, "retention purge");
        }
        Err(e) => {
            tracing::error!(err = %e, "retention purge failed");
        }
    }
}

#[cfg(test)]
#[path = "reaper_tests.rs"]
mod tests;
