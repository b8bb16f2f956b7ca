// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the corral hub.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "corral", about = "Session hub for agent runtimes")]
pub struct HubConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "CORRAL_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9700, env = "CORRAL_PORT")]
    pub port: u16,

    /// Path to the SQLite database file.
    #[arg(long, default_value = "corral.db", env = "CORRAL_DB_PATH")]
    pub db_path: PathBuf,

    /// Reject user messages while the session is mid-turn.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "CORRAL_TURN_BASED")]
    pub turn_based: bool,

    /// Max open (non-closed) sessions per user.
    #[arg(long, default_value_t = 20, env = "CORRAL_MAX_SESSIONS_PER_USER")]
    pub max_sessions_per_user: i64,

    /// Max concurrent client WebSocket connections per user.
    #[arg(long, default_value_t = 10, env = "CORRAL_MAX_CLIENT_CONNS_PER_USER")]
    pub max_client_conns_per_user: usize,

    /// Max user message content size in bytes.
    #[arg(long, default_value_t = 64 * 1024, env = "CORRAL_MAX_CLIENT_MSG_BYTES")]
    pub max_client_msg_bytes: usize,

    /// Max agent output content size in bytes.
    #[arg(long, default_value_t = 1024 * 1024, env = "CORRAL_MAX_RUNTIME_MSG_BYTES")]
    pub max_runtime_msg_bytes: usize,

    /// Max staged file size in bytes. 0 disables file transfer.
    #[arg(long, default_value_t = 8 * 1024 * 1024, env = "CORRAL_MAX_FILE_BYTES")]
    pub max_file_bytes: usize,

    /// Directory for staged session files. Unset disables file transfer.
    #[arg(long, env = "CORRAL_FILE_STORAGE_PATH")]
    pub file_storage_path: Option<PathBuf>,

    /// Seconds before an unanswered permission prompt is denied.
    #[arg(long, default_value_t = 60, env = "CORRAL_PERMISSION_TIMEOUT_SECS")]
    pub permission_timeout_secs: u64,

    /// Default idle timeout in seconds. 0 disables idle reaping.
    #[arg(long, default_value_t = 3600, env = "CORRAL_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: i64,

    /// Per-profile idle timeout overrides, `profile=secs` CSV. 0 disables for that profile.
    #[arg(long, default_value = "", env = "CORRAL_PROFILE_IDLE_TIMEOUTS")]
    pub profile_idle_timeouts: String,

    /// Allowed browser origins, CSV. `*` allows all; empty Origin headers always pass.
    #[arg(long, default_value = "*", env = "CORRAL_ALLOWED_ORIGINS")]
    pub allowed_origins: String,

    /// Static runtime tokens, `runtime_id=token` CSV.
    #[arg(long, default_value = "", env = "CORRAL_RUNTIME_TOKENS")]
    pub runtime_tokens: String,

    /// HMAC secret for rotating runtime tokens. Unset disables the rotating scheme.
    #[arg(long, env = "CORRAL_ROTATING_TOKEN_SECRET")]
    pub rotating_token_secret: Option<String>,

    /// Rotating runtime token lifetime in seconds.
    #[arg(long, default_value_t = 900, env = "CORRAL_ROTATING_TOKEN_LIFETIME_SECS")]
    pub rotating_token_lifetime_secs: u64,

    /// Authenticated HTTP rate limit per user (requests per second).
    #[arg(long, default_value_t = 50.0, env = "CORRAL_HTTP_RATE_PER_SEC")]
    pub http_rate_per_sec: f64,

    /// Authenticated HTTP burst per user.
    #[arg(long, default_value_t = 100.0, env = "CORRAL_HTTP_BURST")]
    pub http_burst: f64,

    /// Idle reaper tick interval in seconds.
    #[arg(long, default_value_t = 60, env = "CORRAL_REAPER_INTERVAL_SECS")]
    pub reaper_interval_secs: u64,

    /// Rate-limit bucket GC interval in seconds.
    #[arg(long, default_value_t = 300, env = "CORRAL_BUCKET_GC_INTERVAL_SECS")]
    pub bucket_gc_interval_secs: u64,

    /// Purge transcript and audit rows older than this many days. 0 disables.
    #[arg(long, default_value_t = 0, env = "CORRAL_RETENTION_DAYS")]
    pub retention_days: i64,

    /// Bootstrap admin bearer token, upserted into the user table at startup.
    #[arg(long, env = "CORRAL_ADMIN_TOKEN")]
    pub admin_token: Option<String>,
}

impl HubConfig {
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn bucket_gc_interval(&self) -> Duration {
        Duration::from_secs(self.bucket_gc_interval_secs)
    }

    pub fn rotating_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.rotating_token_lifetime_secs)
    }

    /// Whether file transfer is enabled (a storage path and a positive size cap).
    pub fn file_transfer_enabled(&self) -> bool {
        self.file_storage_path.is_some() && self.max_file_bytes > 0
    }

    /// Effective idle timeout for a profile, in seconds. `<= 0` disables reaping.
    pub fn idle_timeout_for(&self, profile: &str) -> i64 {
        parse_kv_csv(&self.profile_idle_timeouts)
            .get(profile)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(self.idle_timeout_secs)
    }

    /// Static runtime token table parsed from the `runtime_id=token` CSV.
    pub fn static_runtime_tokens(&self) -> HashMap<String, String> {
        parse_kv_csv(&self.runtime_tokens)
    }

    /// Whether the given `Origin` header value is acceptable.
    ///
    /// Non-browser clients send no Origin header and are always admitted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.allowed_origins
            .split(',')
            .map(str::trim)
            .any(|allowed| allowed == "*" || allowed == origin)
    }
}

/// Parse a `key=value` CSV into a map. Entries without `=` are skipped.
fn parse_kv_csv(s: &str) -> HashMap<String, String> {
    s.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_owned(), v.trim().to_owned()))
        })
        .collect()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
