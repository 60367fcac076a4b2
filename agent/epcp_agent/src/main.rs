// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Endpoint control-plane agent.
//!
//! Serves the host's network-function control mailbox for the function tree
//! described by a JSON config file. `--loopback` runs a simulated host peer
//! in-process, which exercises the whole path without hardware.

use anyhow::Context;
use epcp_agent::config;
use epcp_agent::run;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "epcp_agent", about = "PCIe endpoint NIC control-plane agent")]
struct Options {
    /// Path to the JSON function-tree configuration.
    #[clap(long, short)]
    config: PathBuf,

    /// Poll loop granularity in milliseconds.
    #[clap(long, default_value_t = 100)]
    poll_interval_ms: u64,

    /// Run against an in-process simulated host instead of hardware.
    #[clap(long)]
    loopback: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse();
    let cfg = config::AgentConfig::load(&options.config)?;
    if cfg.pems.is_empty() {
        anyhow::bail!("config defines no pems");
    }

    run::run(
        &cfg,
        &run::RunOptions {
            poll_interval: Duration::from_millis(options.poll_interval_ms),
            loopback: options.loopback,
        },
    )
    .context("agent loop failed")
}
