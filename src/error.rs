// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// Errors raised by the inventory store.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("product id must not be empty")]
    EmptyProductId,
    #[error("product {0} already exists")]
    AlreadyExists(String),
    #[error("product {0} not found")]
    NotFound(String),
    #[error("insufficient stock for {id}: have {have}, requested {requested}")]
    InsufficientStock {
        id: String,
        have: u64,
        requested: u64,
    },
    #[error("quantity must be non-negative")]
    NegativeQuantity,
}

/// Errors raised by the peer transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(String),
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("io error on peer link: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode envelope: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("peer link to {0} closed")]
    LinkClosed(String),
}

/// Errors raised by the Ricart-Agrawala mutex engine.
#[derive(Debug, Error)]
pub enum MutexError {
    #[error("acquire timed out waiting for {0} pending replies")]
    TimedOut(usize),
    #[error("a request for this resource is already in flight")]
    AlreadyRequesting,
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Errors raised by the replication engine.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("unknown peer {0} in sync request")]
    UnknownPeer(String),
    #[error("{0}")]
    Other(String),
}

/// Errors raised while loading or validating boot configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("branch_id must not be empty")]
    EmptyBranchId,
    #[error("peer_port must be >= 1")]
    InvalidPeerPort,
    #[error("malformed peer address {0}: expected id@host:port")]
    MalformedPeerAddr(String),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level error aggregating every subsystem's error, for call sites that
/// bridge subsystems (binding the listener, loading config, starting the node).
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Mutex(#[from] MutexError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Other(String),
}

impl From<NodeError> for String {
    fn from(e: NodeError) -> Self {
        e.to_string()
    }
}
