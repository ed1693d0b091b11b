// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot `tracing-subscriber` initialisation. Library code never calls
//! `println!`/`eprintln!`; this is the only place a subscriber is
//! installed, and it is called once from the CLI entry point.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber filtered by `RUST_LOG`, defaulting
/// to `info` when the variable is unset or invalid.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
