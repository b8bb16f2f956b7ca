// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rotating-token refresher: one task per live runtime connection.

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{Envelope, TokenRefresh};
use crate::state::{HubState, RuntimeConn};

/// Spawn the refresher for one runtime connection. At 80 % of the token
/// lifetime a fresh token is minted and pushed; the runtime presents it on
/// its next reconnect. Stops with the connection.
pub fn spawn_token_refresher(state: Arc<HubState>, conn: Arc<RuntimeConn>) {
    let lifetime = state.auth.rotating_token_lifetime();
    let tick = refresh_interval(lifetime);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = conn.cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }
            match state.auth.mint_rotating_runtime_token(&conn.id) {
                Ok(token) => {
                    let refresh = Envelope::new("runtime.token.refresh", None, TokenRefresh { token });
                    if !conn.send(&refresh) {
                        break;
                    }
                    tracing::debug!(runtime_id = %conn.id, "pushed rotated runtime token");
                }
                Err(e) => {
                    // Mint failures retry at the next tick.
                    tracing::warn!(runtime_id = %conn.id, err = %e, "token mint failed");
                }
            }
        }
    });
}

/// 80 % of the lifetime, with a floor so a tiny lifetime cannot busy-loop.
fn refresh_interval(lifetime: Duration) -> Duration {
    lifetime.mul_f64(0.8).max(Duration::from_secs(1))
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
