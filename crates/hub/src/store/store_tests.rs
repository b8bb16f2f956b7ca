// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::protocol::EndpointRegistration;

async fn store_with_session(session_id: &str) -> Store {
    let store = Store::open_in_memory().await.expect("open store");
    store.upsert_runtime("rt-1", "org-a", true).await.expect("runtime");
    let reg = EndpointRegistration {
        id: "ep1".to_owned(),
        profile: "claude-code".to_owned(),
        name: "chat".to_owned(),
        tags: vec![],
        caps: vec![],
        security: serde_json::json!({}),
    };
    store.upsert_endpoint(&reg, "rt-1", "org-a").await.expect("endpoint");
    store
        .create_session(session_id, "u-alice", "ep1", "rt-1", "org-a", "claude-code")
        .await
        .expect("session");
    store
}

// -- Sequence assignment ------------------------------------------------------

#[tokio::test]
async fn seq_is_contiguous_from_one() {
    let store = store_with_session("s1").await;
    for i in 1..=5 {
        let seq = store
            .append_message("s1", &format!("m{i}"), "user", "stdin", "hello")
            .await
            .expect("append");
        assert_eq!(seq, i);
    }
    let rows = store.messages_after("s1", 0, 100).await.expect("list");
    let seqs: Vec<i64> = rows.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn seq_is_per_session() {
    let store = store_with_session("s1").await;
    store
        .create_session("s2", "u-alice", "ep1", "rt-1", "org-a", "claude-code")
        .await
        .expect("session");

    assert_eq!(store.append_message("s1", "a", "user", "stdin", "x").await.expect("append"), 1);
    assert_eq!(store.append_message("s2", "b", "user", "stdin", "y").await.expect("append"), 1);
    assert_eq!(store.append_message("s1", "c", "agent", "stdout", "z").await.expect("append"), 2);
}

#[tokio::test]
async fn append_is_idempotent_on_message_id() {
    let store = store_with_session("s1").await;
    let first = store.append_message("s1", "m1", "user", "stdin", "original").await.expect("append");
    let second = store.append_message("s1", "m1", "user", "stdin", "retry").await.expect("append");
    assert_eq!(first, second);

    let rows = store.messages_after("s1", 0, 100).await.expect("list");
    assert_eq!(rows.len(), 1);
    // The original row survives; the retry does not overwrite it.
    assert_eq!(rows[0].content, "original");
}

#[tokio::test]
async fn message_exists_reflects_appends() {
    let store = store_with_session("s1").await;
    assert!(!store.message_exists("s1", "m1").await.expect("exists"));
    store.append_message("s1", "m1", "user", "stdin", "x").await.expect("append");
    assert!(store.message_exists("s1", "m1").await.expect("exists"));
    assert!(!store.message_exists("s2", "m1").await.expect("exists"));
}

#[tokio::test]
async fn messages_after_pages_by_seq() {
    let store = store_with_session("s1").await;
    for i in 1..=10 {
        store.append_message("s1", &format!("m{i}"), "agent", "stdout", "x").await.expect("append");
    }
    let page = store.messages_after("s1", 4, 3).await.expect("page");
    let seqs: Vec<i64> = page.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![5, 6, 7]);
}

// -- Sessions -----------------------------------------------------------------

#[tokio::test]
async fn session_state_and_native_handle_updates() {
    let store = store_with_session("s1").await;
    store.update_session_state("s1", "active").await.expect("state");
    store.set_native_handle("s1", "h1").await.expect("handle");

    let sess = store.session("s1").await.expect("get").expect("present");
    assert_eq!(sess.state, "active");
    assert_eq!(sess.native_handle.as_deref(), Some("h1"));
}

#[tokio::test]
async fn open_session_count_ignores_closed() {
    let store = store_with_session("s1").await;
    store
        .create_session("s2", "u-alice", "ep1", "rt-1", "org-a", "claude-code")
        .await
        .expect("session");
    assert_eq!(store.count_open_sessions_for_user("u-alice").await.expect("count"), 2);

    store.update_session_state("s2", "closed").await.expect("state");
    assert_eq!(store.count_open_sessions_for_user("u-alice").await.expect("count"), 1);
    assert_eq!(store.count_open_sessions_for_user("u-bob").await.expect("count"), 0);
}

#[tokio::test]
async fn reapable_excludes_creating_and_closed() {
    let store = store_with_session("s1").await;
    store
        .create_session("s2", "u-alice", "ep1", "rt-1", "org-a", "claude-code")
        .await
        .expect("session");
    store.update_session_state("s2", "active").await.expect("state");

    let ids: Vec<String> =
        store.list_reapable_sessions().await.expect("list").into_iter().map(|s| s.id).collect();
    // s1 is still 'creating' and must not be reaped out from under its runtime.
    assert_eq!(ids, vec!["s2".to_owned()]);
}

// -- Endpoints and runtimes ---------------------------------------------------

#[tokio::test]
async fn endpoint_reregistration_moves_runtime_claim() {
    let store = store_with_session("s1").await;
    store.upsert_runtime("rt-2", "org-a", true).await.expect("runtime");
    let reg = EndpointRegistration {
        id: "ep1".to_owned(),
        profile: "claude-code".to_owned(),
        name: "chat".to_owned(),
        tags: vec![],
        caps: vec![],
        security: serde_json::json!({}),
    };
    store.upsert_endpoint(&reg, "rt-2", "org-a").await.expect("endpoint");

    let ep = store.endpoint("ep1").await.expect("get").expect("present");
    assert_eq!(ep.runtime_id, "rt-2");
}

#[tokio::test]
async fn runtime_online_flag_round_trips() {
    let store = Store::open_in_memory().await.expect("open store");
    store.upsert_runtime("rt-1", "", true).await.expect("runtime");
    assert_eq!(store.runtime("rt-1").await.expect("get").expect("present").online, 1);
    store.set_runtime_online("rt-1", false).await.expect("set");
    assert_eq!(store.runtime("rt-1").await.expect("get").expect("present").online, 0);
}

// -- Permissions --------------------------------------------------------------

#[tokio::test]
async fn endpoint_permission_grant_revoke() {
    let store = Store::open_in_memory().await.expect("open store");
    assert!(!store.endpoint_has_grants("ep1").await.expect("grants"));

    store.grant_endpoint_permission("ep1", "u-alice", "u-admin").await.expect("grant");
    assert!(store.endpoint_has_grants("ep1").await.expect("grants"));
    assert!(store.check_endpoint_permission("ep1", "u-alice").await.expect("check"));
    assert!(!store.check_endpoint_permission("ep1", "u-bob").await.expect("check"));

    store.revoke_endpoint_permission("ep1", "u-alice").await.expect("revoke");
    assert!(!store.check_endpoint_permission("ep1", "u-alice").await.expect("check"));
}

// -- Audit --------------------------------------------------------------------

#[tokio::test]
async fn audit_filtering() {
    let store = Store::open_in_memory().await.expect("open store");
    store
        .append_audit("session.stop", Some("s1"), None, Some("u1"), serde_json::json!({}))
        .await
        .expect("audit");
    store
        .append_audit(
            "permission.timeout",
            Some("s1"),
            Some("rt-1"),
            None,
            serde_json::json!({"request_id": "r1"}),
        )
        .await
        .expect("audit");
    store
        .append_audit("session.stop", Some("s2"), None, Some("u1"), serde_json::json!({}))
        .await
        .expect("audit");

    let all = store.list_audit(None, None, 100).await.expect("list");
    assert_eq!(all.len(), 3);

    let s1 = store.list_audit(Some("s1"), None, 100).await.expect("list");
    assert_eq!(s1.len(), 2);

    let timeouts = store.list_audit(None, Some("permission.timeout"), 100).await.expect("list");
    assert_eq!(timeouts.len(), 1);
    let detail: serde_json::Value =
        serde_json::from_str(&timeouts[0].detail).expect("detail json");
    assert_eq!(detail["request_id"], "r1");
}

// -- Config overrides ---------------------------------------------------------

#[tokio::test]
async fn config_override_upsert_and_get() {
    let store = Store::open_in_memory().await.expect("open store");
    let security = serde_json::json!({"permission_mode": "strict"});
    store.upsert_config_override("ep1", Some(&security), None).await.expect("upsert");

    let row = store.config_override("ep1").await.expect("get").expect("present");
    assert_eq!(row.security.as_deref(), Some(security.to_string().as_str()));
    assert!(row.limits.is_none());

    let limits = serde_json::json!({"max_turns": 50});
    store.upsert_config_override("ep1", Some(&security), Some(&limits)).await.expect("upsert");
    let row = store.config_override("ep1").await.expect("get").expect("present");
    assert!(row.limits.is_some());
    assert_eq!(store.list_config_overrides().await.expect("list").len(), 1);
}

// -- Retention ----------------------------------------------------------------

#[tokio::test]
async fn purge_removes_old_rows_only() {
    let store = store_with_session("s1").await;
    store.append_message("s1", "m1", "user", "stdin", "x").await.expect("append");
    store.append_audit("session.stop", Some("s1"), None, None, serde_json::json!({})).await.expect("audit");

    // A cutoff in the past removes nothing.
    let (m, a) = store.purge_before(Utc::now() - chrono::Duration::days(1)).await.expect("purge");
    assert_eq!((m, a), (0, 0));

    // A cutoff in the future removes everything.
    let (m, a) = store.purge_before(Utc::now() + chrono::Duration::days(1)).await.expect("purge");
    assert_eq!((m, a), (1, 1));
}

// -- Users --------------------------------------------------------------------

#[tokio::test]
async fn user_token_lookup() {
    let store = Store::open_in_memory().await.expect("open store");
    store.upsert_user("u1", "alice", "admin", "org-a", "tok-1").await.expect("user");

    let user = store.user_by_token("tok-1").await.expect("get").expect("present");
    assert_eq!(user.username, "alice");
    assert_eq!(user.role, "admin");
    assert!(store.user_by_token("tok-2").await.expect("get").is_none());

    // Re-upsert rotates the token.
    store.upsert_user("u1", "alice", "admin", "org-a", "tok-9").await.expect("user");
    assert!(store.user_by_token("tok-1").await.expect("get").is_none());
    assert!(store.user_by_token("tok-9").await.expect("get").is_some());
}
