// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identity provider: bearer validation for clients, static and rotating
//! HMAC tokens for runtimes.
//!
//! Rotating tokens are `runtime_id:unix_ts:hex(HMAC-SHA256(secret,
//! "runtime_id:unix_ts"))`. They expire after the configured lifetime and a
//! small forward clock skew is tolerated.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ring::hmac;

use crate::error::HubError;
use crate::store::Store;

/// Max tolerated forward clock skew on a rotating token timestamp.
const MAX_FUTURE_SKEW_SECS: u64 = 60;

/// Role of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "admin" {
            Self::Admin
        } else {
            Self::User
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// An authenticated client identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub org_id: String,
}

/// Identity provider backed by the user table and hub configuration.
pub struct Auth {
    store: Store,
    static_tokens: HashMap<String, String>,
    rotating_secret: Option<String>,
    rotating_lifetime: Duration,
}

impl Auth {
    pub fn new(
        store: Store,
        static_tokens: HashMap<String, String>,
        rotating_secret: Option<String>,
        rotating_lifetime: Duration,
    ) -> Self {
        Self { store, static_tokens, rotating_secret, rotating_lifetime }
    }

    /// Resolve a client bearer token to an identity.
    pub async fn validate_bearer(&self, token: &str) -> Result<Identity, HubError> {
        if token.is_empty() {
            return Err(HubError::InvalidCredentials);
        }
        let user = self
            .store
            .user_by_token(token)
            .await
            .map_err(|e| {
                tracing::error!(err = %e, "bearer lookup failed");
                HubError::PersistFailed
            })?
            .ok_or(HubError::InvalidCredentials)?;

        Ok(Identity {
            user_id: user.id,
            username: user.username,
            role: Role::parse(&user.role),
            org_id: user.org_id,
        })
    }

    /// Validate a runtime credential: rotating scheme first, then the static
    /// token list.
    pub fn validate_runtime_credentials(&self, runtime_id: &str, token: &str) -> bool {
        match self.validate_rotating_runtime_token(token) {
            Ok(id) => return id == runtime_id,
            Err(e) => {
                if self.rotating_secret.is_some() && token.matches(':').count() >= 2 {
                    tracing::debug!(runtime_id, err = %e, "rotating token rejected");
                }
            }
        }
        self.validate_static_runtime_token(runtime_id, token)
    }

    /// Validate a runtime token against the configured static list.
    pub fn validate_static_runtime_token(&self, runtime_id: &str, token: &str) -> bool {
        match self.static_tokens.get(runtime_id) {
            Some(expected) => constant_time_eq(expected, token),
            None => false,
        }
    }

    /// Verify a rotating token and return the runtime id it was minted for.
    pub fn validate_rotating_runtime_token(&self, token: &str) -> anyhow::Result<String> {
        let Some(ref secret) = self.rotating_secret else {
            anyhow::bail!("rotating token scheme not configured");
        };

        // Split from the right: the runtime id itself may contain colons.
        let mut parts = token.rsplitn(3, ':');
        let (Some(sig_hex), Some(ts_str), Some(runtime_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("malformed rotating token");
        };

        let ts: u64 = ts_str.parse().map_err(|_| anyhow::anyhow!("bad token timestamp"))?;
        let now = epoch_secs();
        if ts > now + MAX_FUTURE_SKEW_SECS {
            anyhow::bail!("token timestamp in the future");
        }
        if now.saturating_sub(ts) > self.rotating_lifetime.as_secs() {
            anyhow::bail!("token expired");
        }

        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let payload = format!("{runtime_id}:{ts}");
        let sig = hex::decode(sig_hex).map_err(|_| anyhow::anyhow!("bad token signature hex"))?;
        hmac::verify(&key, payload.as_bytes(), &sig)
            .map_err(|_| anyhow::anyhow!("token signature mismatch"))?;

        Ok(runtime_id.to_owned())
    }

    /// Mint a fresh rotating token for a runtime.
    pub fn mint_rotating_runtime_token(&self, runtime_id: &str) -> anyhow::Result<String> {
        let Some(ref secret) = self.rotating_secret else {
            anyhow::bail!("rotating token scheme not configured");
        };
        let ts = epoch_secs();
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let payload = format!("{runtime_id}:{ts}");
        let tag = hmac::sign(&key, payload.as_bytes());
        Ok(format!("{payload}:{}", hex::encode(tag.as_ref())))
    }

    pub fn rotating_token_lifetime(&self) -> Duration {
        self.rotating_lifetime
    }

    pub fn rotating_secret_configured(&self) -> bool {
        self.rotating_secret.is_some()
    }
}

/// Compare a presented static runtime token against the configured value
/// without short-circuiting on the first mismatched byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().min(b.len()) {
        diff |= usize::from(a[i] ^ b[i]);
    }
    diff == 0
}

fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
