// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `branch_mesh` implements the coordination core shared by every node in a
//! peer-to-peer branch-inventory mesh: a Lamport clock, a length-prefixed
//! peer transport, a Ricart-Agrawala mutual exclusion engine, log-shipping
//! replication, and the branch coordinator that wires them together around
//! a local inventory store.
//!
//! The gateway/HTTP surface, persistence-to-disk, and multi-branch
//! placement policy are out of scope for this crate.

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod message;
pub mod mutex;
pub mod replication;
pub mod transport;

pub use clock::LamportClock;
pub use config::{BootConfig, PeerConfig};
pub use coordinator::{BranchCoordinator, StockChange, StockQuery};
pub use error::NodeError;
pub use inventory::{InventoryStats, InventoryStore, Product, StockStatus};
pub use message::{Envelope, Payload};
pub use mutex::{AcquireOutcome, CsGuard, MutexEngine};
pub use replication::{LogEntry, ReplicationEngine};
pub use transport::PeerTransport;
