// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File staging for `file.available` frames.
//!
//! Files land at `<storage>/<session_id>/<file_id>/<name>`. Every path
//! component is sanitized and the final directory is canonicalized and checked
//! against the storage root before anything is written.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;

use crate::protocol::{Envelope, FileAvailable, FileMeta};
use crate::state::{HubState, RuntimeConn};

/// Stage a file announced by a runtime, record it in the transcript, and
/// mirror it to subscribers as `agent.output{channel:"file"}`.
pub async fn handle_file_available(state: &Arc<HubState>, conn: &Arc<RuntimeConn>, env: Envelope) {
    if !state.config.file_transfer_enabled() {
        tracing::warn!(runtime_id = %conn.id, "file.available with file transfer disabled");
        return;
    }
    let Some(session_id) = env.session_id.clone() else {
        tracing::warn!(runtime_id = %conn.id, "file.available without session_id dropped");
        return;
    };
    let sess = match state.store.session(&session_id).await {
        Ok(Some(sess)) if sess.runtime_id == conn.id => sess,
        Ok(_) => {
            tracing::warn!(runtime_id = %conn.id, session_id, "file for foreign or unknown session dropped");
            return;
        }
        Err(e) => {
            tracing::error!(session_id, err = %e, "session lookup failed");
            return;
        }
    };

    let fa: FileAvailable = match env.payload_as() {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(session_id = %sess.id, err = %e, "malformed file.available dropped");
            return;
        }
    };
    let bytes = match base64::engine::general_purpose::STANDARD.decode(&fa.data) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(session_id = %sess.id, err = %e, "bad base64 in file.available");
            return;
        }
    };
    if bytes.len() > state.config.max_file_bytes {
        tracing::warn!(
            session_id = %sess.id,
            size = bytes.len(),
            limit = state.config.max_file_bytes,
            "oversize file dropped"
        );
        return;
    }

    let Some(root) = state.config.file_storage_path.clone() else {
        return;
    };
    let path = match stage_file(&root, &sess.id, &fa.metadata, &bytes).await {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(session_id = %sess.id, err = %e, "file staging rejected");
            return;
        }
    };
    tracing::debug!(session_id = %sess.id, path = %path.display(), "file staged");

    // One logical event, two frames: a transcript row holding the metadata
    // and an agent.output broadcast carrying the same blob.
    let meta_json = serde_json::to_string(&fa.metadata).unwrap_or_else(|_| "{}".to_owned());
    let seq = match state
        .store
        .append_message(&sess.id, &fa.metadata.file_id, "agent", "file", &meta_json)
        .await
    {
        Ok(seq) => seq,
        Err(e) => {
            tracing::error!(session_id = %sess.id, err = %e, "file transcript append failed");
            return;
        }
    };
    let _ = state.store.touch_session(&sess.id).await;

    let out = Envelope::new(
        "agent.output",
        Some(sess.id.clone()),
        serde_json::json!({"seq": seq, "channel": "file", "content": meta_json}),
    );
    state.broadcast(&sess.id, &out).await;
}

/// Write the file under the storage root, refusing any path that escapes it.
pub(crate) async fn stage_file(
    root: &Path,
    session_id: &str,
    meta: &FileMeta,
    bytes: &[u8],
) -> anyhow::Result<PathBuf> {
    let session_id = sanitize_component(session_id)?;
    let file_id = sanitize_component(&meta.file_id)?;
    let name = sanitize_component(&meta.name)?;

    tokio::fs::create_dir_all(root).await?;
    let canonical_root = tokio::fs::canonicalize(root).await?;

    let dir = canonical_root.join(session_id).join(file_id);
    tokio::fs::create_dir_all(&dir).await?;
    let canonical_dir = tokio::fs::canonicalize(&dir).await?;
    if !canonical_dir.starts_with(&canonical_root) {
        anyhow::bail!("staging path escapes storage root: {}", canonical_dir.display());
    }

    let path = canonical_dir.join(name);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

/// Accept a single path component: no traversal, no separators, no NULs.
pub(crate) fn sanitize_component(s: &str) -> anyhow::Result<&str> {
    if s.is_empty() || s == "." || s == ".." {
        anyhow::bail!("invalid path component: {s:?}");
    }
    if s.contains('/') || s.contains('\\') || s.contains('\0') {
        anyhow::bail!("path separator in component: {s:?}");
    }
    Ok(s)
}

#[cfg(test)]
#[path = "files_tests.rs"]
mod tests;
