// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared hub state and the in-memory routing table.
//!
//! The registry holds the volatile maps (runtime connections, client
//! connections, subscriber sets, turn timestamps, pending permissions) behind
//! one mutex. Registry operations are short map edits returning cloned `Arc`
//! snapshots; no I/O ever happens under the lock. Outbound frames go through
//! each connection's unbounded channel, drained by a per-socket writer task,
//! which serializes writes without holding any shared lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::auth::{Auth, Identity, Role};
use crate::config::HubConfig;
use crate::protocol::{Envelope, EndpointRegistration};
use crate::ratelimit::{Buckets, TokenBucket, WS_MSG_BURST, WS_MSG_RATE};
use crate::store::Store;

/// Everything the transport and router layers share.
pub struct HubState {
    pub config: HubConfig,
    pub store: Store,
    pub auth: Auth,
    pub registry: Registry,
    pub shutdown: CancellationToken,
    /// User-keyed bucket for authenticated HTTP requests.
    pub http_buckets: Buckets,
    /// IP-keyed bucket for unauthenticated connection attempts.
    pub conn_buckets: Buckets,
}

impl HubState {
    pub fn new(config: HubConfig, store: Store, auth: Auth, shutdown: CancellationToken) -> Self {
        let http_buckets = Buckets::new(config.http_rate_per_sec, config.http_burst);
        Self {
            config,
            store,
            auth,
            registry: Registry::new(),
            shutdown,
            http_buckets,
            conn_buckets: Buckets::new(crate::ratelimit::CONN_RATE, crate::ratelimit::CONN_BURST),
        }
    }

    /// Fan an envelope out to every subscriber of a session. Snapshot first,
    /// send after the registry lock is released.
    pub async fn broadcast(&self, session_id: &str, env: &Envelope) {
        let subs = self.registry.subscribers_snapshot(session_id).await;
        if subs.is_empty() {
            return;
        }
        let text = env.to_text();
        for client in subs {
            client.send_text(text.clone());
        }
    }
}

// -- Connections --------------------------------------------------------------

/// One live runtime WebSocket.
pub struct RuntimeConn {
    pub id: String,
    pub org_id: String,
    pub endpoints: Vec<EndpointRegistration>,
    pub connected_at: Instant,
    /// Epoch seconds of the last inbound frame, for keepalive staleness.
    last_seen: AtomicI64,
    tx: mpsc::UnboundedSender<String>,
    pub cancel: CancellationToken,
}

impl RuntimeConn {
    pub fn new(
        id: String,
        org_id: String,
        endpoints: Vec<EndpointRegistration>,
        tx: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            org_id,
            endpoints,
            connected_at: Instant::now(),
            last_seen: AtomicI64::new(epoch_secs()),
            tx,
            cancel,
        }
    }

    /// Queue a frame for the writer task. Returns false if the writer is gone.
    pub fn send(&self, env: &Envelope) -> bool {
        self.tx.send(env.to_text()).is_ok()
    }

    pub fn touch(&self) {
        self.last_seen.store(epoch_secs(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self) -> i64 {
        epoch_secs().saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }

    pub fn offers_endpoint(&self, endpoint_id: &str) -> bool {
        self.endpoints.iter().any(|e| e.id == endpoint_id)
    }
}

/// One live client WebSocket.
pub struct ClientConn {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub org_id: String,
    tx: mpsc::UnboundedSender<String>,
    pub cancel: CancellationToken,
    bucket: Mutex<TokenBucket>,
}

impl ClientConn {
    pub fn new(
        identity: &Identity,
        tx: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            role: identity.role,
            org_id: identity.org_id.clone(),
            tx,
            cancel,
            bucket: Mutex::new(TokenBucket::new(WS_MSG_RATE, WS_MSG_BURST)),
        }
    }

    pub fn send(&self, env: &Envelope) -> bool {
        self.tx.send(env.to_text()).is_ok()
    }

    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(text).is_ok()
    }

    /// Per-connection message rate limit.
    pub async fn allow_message(&self) -> bool {
        self.bucket.lock().await.allow()
    }

    pub fn can_read(&self, session_user_id: &str) -> bool {
        self.role.is_admin() || self.user_id == session_user_id
    }

    pub fn owns(&self, session_user_id: &str) -> bool {
        self.user_id == session_user_id
    }
}

/// A permission prompt awaiting a client verdict.
pub struct PendingPermission {
    pub session_id: String,
    pub runtime_id: String,
    /// Cancels the timeout timer when a client answers first.
    pub timer: CancellationToken,
}

// -- Registry -----------------------------------------------------------------

#[derive(Default)]
struct RegistryInner {
    runtimes: HashMap<String, Arc<RuntimeConn>>,
    clients: HashMap<String, Arc<ClientConn>>,
    /// session_id → conn_id → client.
    subscribers: HashMap<String, HashMap<String, Arc<ClientConn>>>,
    turn_started: HashMap<String, Instant>,
    pending_permissions: HashMap<String, PendingPermission>,
}

/// The in-memory routing table. One mutex, short critical sections.
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(RegistryInner::default()) }
    }

    // -- Runtimes -------------------------------------------------------------

    /// Insert a runtime connection, displacing any previous connection with
    /// the same id. The displaced connection is cancelled under the lock so
    /// there is no window where both are writeable, and returned for logging.
    pub async fn insert_runtime(&self, conn: Arc<RuntimeConn>) -> Option<Arc<RuntimeConn>> {
        let mut inner = self.inner.lock().await;
        let displaced = inner.runtimes.insert(conn.id.clone(), conn);
        if let Some(ref old) = displaced {
            old.cancel.cancel();
        }
        displaced
    }

    /// Remove a runtime connection, but only if it is still the registered one
    /// (a displaced connection's cleanup must not evict its replacement).
    pub async fn remove_runtime(&self, conn: &Arc<RuntimeConn>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.runtimes.get(&conn.id) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                inner.runtimes.remove(&conn.id);
                true
            }
            _ => false,
        }
    }

    pub async fn runtime(&self, id: &str) -> Option<Arc<RuntimeConn>> {
        self.inner.lock().await.runtimes.get(id).map(Arc::clone)
    }

    /// Find the live runtime offering an endpoint. When several claim it, the
    /// most recently connected one wins.
    pub async fn runtime_for_endpoint(&self, endpoint_id: &str) -> Option<Arc<RuntimeConn>> {
        let inner = self.inner.lock().await;
        inner
            .runtimes
            .values()
            .filter(|r| r.offers_endpoint(endpoint_id))
            .max_by_key(|r| r.connected_at)
            .map(Arc::clone)
    }

    // -- Clients --------------------------------------------------------------

    pub async fn insert_client(&self, conn: Arc<ClientConn>) {
        self.inner.lock().await.clients.insert(conn.id.clone(), conn);
    }

    /// Insert a client unless the user already holds `max` connections.
    /// Count and insert happen under one lock so racing handshakes cannot
    /// both slip past the cap.
    pub async fn insert_client_capped(&self, conn: Arc<ClientConn>, max: usize) -> bool {
        let mut inner = self.inner.lock().await;
        let held = inner.clients.values().filter(|c| c.user_id == conn.user_id).count();
        if held >= max {
            return false;
        }
        inner.clients.insert(conn.id.clone(), conn);
        true
    }

    /// Remove a client connection and drop it from every subscriber set.
    pub async fn remove_client(&self, conn_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.clients.remove(conn_id);
        inner.subscribers.retain(|_, subs| {
            subs.remove(conn_id);
            !subs.is_empty()
        });
    }

    pub async fn client_count_for_user(&self, user_id: &str) -> usize {
        self.inner.lock().await.clients.values().filter(|c| c.user_id == user_id).count()
    }

    // -- Subscribers ----------------------------------------------------------

    pub async fn subscribe(&self, session_id: &str, client: Arc<ClientConn>) {
        self.inner
            .lock()
            .await
            .subscribers
            .entry(session_id.to_owned())
            .or_default()
            .insert(client.id.clone(), client);
    }

    pub async fn unsubscribe(&self, session_id: &str, conn_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(subs) = inner.subscribers.get_mut(session_id) {
            subs.remove(conn_id);
            if subs.is_empty() {
                inner.subscribers.remove(session_id);
            }
        }
    }

    pub async fn subscribers_snapshot(&self, session_id: &str) -> Vec<Arc<ClientConn>> {
        self.inner
            .lock()
            .await
            .subscribers
            .get(session_id)
            .map(|subs| subs.values().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// Drop a session's subscriber set (on close). Returns the final snapshot.
    pub async fn clear_subscribers(&self, session_id: &str) -> Vec<Arc<ClientConn>> {
        self.inner
            .lock()
            .await
            .subscribers
            .remove(session_id)
            .map(|subs| subs.into_values().collect())
            .unwrap_or_default()
    }

    // -- Turn timestamps ------------------------------------------------------

    pub async fn set_turn_started(&self, session_id: &str) {
        self.inner.lock().await.turn_started.insert(session_id.to_owned(), Instant::now());
    }

    pub async fn take_turn_started(&self, session_id: &str) -> Option<Instant> {
        self.inner.lock().await.turn_started.remove(session_id)
    }

    // -- Pending permissions --------------------------------------------------

    pub async fn insert_pending_permission(&self, request_id: &str, pending: PendingPermission) {
        self.inner.lock().await.pending_permissions.insert(request_id.to_owned(), pending);
    }

    pub async fn remove_pending_permission(&self, request_id: &str) -> Option<PendingPermission> {
        self.inner.lock().await.pending_permissions.remove(request_id)
    }

    // -- Introspection --------------------------------------------------------

    /// (runtime count, client count, sessions with subscribers).
    pub async fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().await;
        (inner.runtimes.len(), inner.clients.len(), inner.subscribers.len())
    }
}

fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
