// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI entry point: loads a `BootConfig` from a file and/or flags, starts a
//! `BranchCoordinator`, and runs until `ctrl_c`.

use anyhow::Context;
use clap::Parser;

use branch_mesh::{BootConfig, BranchCoordinator, InventoryStore, PeerConfig};

#[derive(Parser)]
#[command(name = "branch-node", about = "Runs one node of the branch inventory mesh")]
struct Args {
    /// Path to a TOML config file. When given, `--branch-id`/`--peer-port`
    /// are ignored in favour of the file's values.
    #[arg(long)]
    config: Option<String>,

    /// This node's branch id. Required unless `--config` is given.
    #[arg(long)]
    branch_id: Option<String>,

    /// TCP port this node listens for peer links on.
    #[arg(long)]
    peer_port: Option<u16>,

    /// A peer to connect to at boot, as `id@host:port`. Repeatable.
    #[arg(long = "connect", value_name = "id@host:port")]
    connect: Vec<String>,
}

impl Args {
    fn into_boot_config(self) -> anyhow::Result<BootConfig> {
        if let Some(path) = self.config {
            return BootConfig::from_toml_file(&path).context("loading config file");
        }
        let branch_id = self
            .branch_id
            .context("--branch-id is required when --config is not given")?;
        let peer_port = self
            .peer_port
            .context("--peer-port is required when --config is not given")?;
        let mut config = BootConfig::new(branch_id, peer_port);
        config.peers = self
            .connect
            .iter()
            .map(|spec| PeerConfig::parse(spec))
            .collect::<Result<Vec<_>, _>>()
            .context("parsing --connect peer address")?;
        config.validate().context("validating boot config")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    branch_mesh::logging::init();
    let args = Args::parse();
    let config = args.into_boot_config()?;

    tracing::info!(branch_id = config.branch_id, peer_port = config.peer_port, "starting branch node");

    let coordinator = BranchCoordinator::new(config, InventoryStore::new());
    coordinator.start().await.context("starting coordinator")?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, stopping");
    coordinator.stop().await;
    Ok(())
}
