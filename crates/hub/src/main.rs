// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use anyhow::Context;
use clap::Parser;

use corral::config::HubConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubConfig::parse();
    corral::init_logging();
    corral::run(config).await.context("hub exited")
}
