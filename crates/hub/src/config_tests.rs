// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::Parser;

fn base_config() -> HubConfig {
    HubConfig::parse_from(["corral"])
}

#[test]
fn profile_timeout_falls_back_to_default() {
    let mut config = base_config();
    config.idle_timeout_secs = 1800;
    config.profile_idle_timeouts = "claude-code=600".to_owned();

    assert_eq!(config.idle_timeout_for("claude-code"), 600);
    assert_eq!(config.idle_timeout_for("codex"), 1800);
}

#[test]
fn profile_timeout_zero_disables() {
    let mut config = base_config();
    config.profile_idle_timeouts = "batch=0".to_owned();
    assert_eq!(config.idle_timeout_for("batch"), 0);
}

#[test]
fn static_runtime_tokens_parse() {
    let mut config = base_config();
    config.runtime_tokens = "rt-1=secret-a, rt-2=secret-b".to_owned();

    let tokens = config.static_runtime_tokens();
    assert_eq!(tokens.get("rt-1").map(String::as_str), Some("secret-a"));
    assert_eq!(tokens.get("rt-2").map(String::as_str), Some("secret-b"));
    assert_eq!(tokens.len(), 2);
}

#[test]
fn malformed_token_entries_are_skipped() {
    let tokens = parse_kv_csv("no-equals,=orphan,ok=yes");
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens.get("ok").map(String::as_str), Some("yes"));
}

#[test]
fn origin_wildcard_allows_everything() {
    let config = base_config();
    assert!(config.origin_allowed(Some("https://anything.example")));
    assert!(config.origin_allowed(None));
}

#[test]
fn origin_allow_list_is_exact() {
    let mut config = base_config();
    config.allowed_origins = "https://ui.example, https://staging.example".to_owned();

    assert!(config.origin_allowed(Some("https://ui.example")));
    assert!(config.origin_allowed(Some("https://staging.example")));
    assert!(!config.origin_allowed(Some("https://evil.example")));
    // Non-browser clients (no Origin header) always pass.
    assert!(config.origin_allowed(None));
}

#[test]
fn file_transfer_requires_path_and_cap() {
    let mut config = base_config();
    assert!(!config.file_transfer_enabled());

    config.file_storage_path = Some(std::path::PathBuf::from("/tmp/corral-files"));
    assert!(config.file_transfer_enabled());

    config.max_file_bytes = 0;
    assert!(!config.file_transfer_enabled());
}
