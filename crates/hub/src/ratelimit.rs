// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token-bucket rate limiting: a plain bucket for per-connection use and a
//! keyed collection (per user, per IP) with periodic garbage collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::state::HubState;

/// Per-WS-connection message rate.
pub const WS_MSG_RATE: f64 = 30.0;
pub const WS_MSG_BURST: f64 = 50.0;

/// Unauthenticated connection attempts per source IP.
pub const CONN_RATE: f64 = 5.0;
pub const CONN_BURST: f64 = 10.0;

/// A standard token bucket: `rate` tokens per second, capped at `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self { rate, burst, tokens: burst, last_refill: Instant::now() }
    }

    /// Take one token if available.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct KeyedBucket {
    bucket: TokenBucket,
    last_used: Instant,
}

/// A keyed family of token buckets sharing one rate/burst setting.
pub struct Buckets {
    rate: f64,
    burst: f64,
    inner: Mutex<HashMap<String, KeyedBucket>>,
}

impl Buckets {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self { rate, burst, inner: Mutex::new(HashMap::new()) }
    }

    /// Take one token from the bucket for `key`, creating it on first use.
    pub async fn allow(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let entry = inner.entry(key.to_owned()).or_insert_with(|| KeyedBucket {
            bucket: TokenBucket::new(self.rate, self.burst),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        entry.bucket.allow()
    }

    /// Drop buckets untouched for longer than `idle`.
    pub async fn sweep(&self, idle: Duration) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        inner.retain(|_, e| e.last_used.elapsed() <= idle);
        before - inner.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Spawn the periodic bucket GC for both keyed families.
pub fn spawn_bucket_gc(state: Arc<HubState>) {
    let interval = state.config.bucket_gc_interval();

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            let dropped = state.http_buckets.sweep(interval).await
                + state.conn_buckets.sweep(interval).await;
            if dropped > 0 {
                tracing::debug!(dropped, "rate-limit bucket GC");
            }
        }
    });
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
