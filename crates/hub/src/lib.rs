// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Corral: a session hub brokering conversations between UI clients and
//! agent runtimes over WebSockets, with a durable per-session transcript.

pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod ratelimit;
pub mod router;
pub mod state;
pub mod store;
pub mod tasks;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::Auth;
use crate::config::HubConfig;
use crate::state::HubState;
use crate::store::Store;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run the hub until shutdown.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let store = Store::open(&config.db_path).await?;
    if let Some(ref token) = config.admin_token {
        store.upsert_user("admin", "admin", "admin", "", token).await?;
    }
    if let Some(ref dir) = config.file_storage_path {
        tokio::fs::create_dir_all(dir).await?;
    }

    let auth = Auth::new(
        store.clone(),
        config.static_runtime_tokens(),
        config.rotating_token_secret.clone(),
        config.rotating_token_lifetime(),
    );
    let state = Arc::new(HubState::new(config, store, auth, shutdown.clone()));

    tasks::reaper::spawn_idle_reaper(Arc::clone(&state));
    ratelimit::spawn_bucket_gc(Arc::clone(&state));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    tracing::info!("corral listening on {addr}");
    let router = transport::build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
