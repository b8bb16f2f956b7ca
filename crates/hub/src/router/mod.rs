// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session router: dispatches inbound envelopes from both WebSocket
//! populations, enforces ownership and turn invariants, persists transcript
//! rows, and fans events out to subscribers.

pub mod client;
pub mod files;
pub mod runtime;
pub mod sessions;

use crate::error::HubError;
use crate::state::{ClientConn, HubState};
use crate::store::SessionRow;

/// Load a session row, mapping absence to `session_not_found`.
pub(crate) async fn load_session(
    state: &HubState,
    session_id: &str,
) -> Result<SessionRow, HubError> {
    state
        .store
        .session(session_id)
        .await
        .map_err(|e| {
            tracing::error!(session_id, err = %e, "session lookup failed");
            HubError::PersistFailed
        })?
        .ok_or(HubError::SessionNotFound)
}

/// Push an `error.response` frame to a client.
pub(crate) fn send_error(
    client: &ClientConn,
    err: HubError,
    session_id: Option<String>,
    message: &str,
) {
    let _ = client.send(&err.to_envelope(session_id, message));
}
