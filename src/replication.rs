// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Log-shipping replication: an append-only local log of applied
//! operations, broadcast eagerly on `log()` and reconciled lazily with a
//! periodic `SYNC_REQUEST` round. The `SYNC_REQUEST` handler follows a
//! stateless request-to-response builder shape, and the log buffer uses the
//! same `Arc<RwLock<..>>` lock discipline as the rest of this crate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::LamportClock;
use crate::inventory::InventoryStore;
use crate::message::{Envelope, Payload};

pub type SendCapability = Arc<dyn Fn(&str, Envelope) -> bool + Send + Sync>;

/// One applied operation, identified uniquely by `(origin, ts)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub origin: String,
    pub ts: u64,
    pub op: String,
    pub resource_id: String,
    pub payload: HashMap<String, Value>,
}

struct ReplicationInner {
    node_id: String,
    peer_set: Vec<String>,
    clock: Arc<LamportClock>,
    send: SendCapability,
    inventory: InventoryStore,
    log: RwLock<Vec<LogEntry>>,
    applied: RwLock<HashSet<(String, u64)>>,
    last_applied_ts: RwLock<HashMap<String, u64>>,
    stopped: AtomicBool,
}

/// Replication engine for one branch's operation log.
#[derive(Clone)]
pub struct ReplicationEngine {
    inner: Arc<ReplicationInner>,
}

impl ReplicationEngine {
    pub fn new(
        node_id: impl Into<String>,
        peer_set: impl IntoIterator<Item = String>,
        clock: Arc<LamportClock>,
        inventory: InventoryStore,
        send: SendCapability,
    ) -> Self {
        let node_id = node_id.into();
        let peer_set: Vec<String> = peer_set.into_iter().filter(|p| p != &node_id).collect();
        Self {
            inner: Arc::new(ReplicationInner {
                node_id,
                peer_set,
                clock,
                send,
                inventory,
                log: RwLock::new(Vec::new()),
                applied: RwLock::new(HashSet::new()),
                last_applied_ts: RwLock::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Allocates a fresh timestamp, appends `{self, ts, op, resource_id,
    /// payload}` to the local log, and broadcasts it as a `LOG_ENTRY`.
    /// Applying the operation locally is the caller's responsibility
    /// *before* calling `log` — this replicates effects, not intents.
    pub fn log(
        &self,
        op: impl Into<String>,
        resource_id: impl Into<String>,
        payload: HashMap<String, Value>,
    ) -> u64 {
        let ts = self.inner.clock.tick();
        let entry = LogEntry {
            origin: self.inner.node_id.clone(),
            ts,
            op: op.into(),
            resource_id: resource_id.into(),
            payload,
        };
        self.inner.log.write().push(entry.clone());
        self.inner
            .applied
            .write()
            .insert((entry.origin.clone(), entry.ts));
        self.broadcast_entry(&entry);
        ts
    }

    fn broadcast_entry(&self, entry: &LogEntry) {
        for peer in &self.inner.peer_set {
            let envelope = Envelope::new(
                self.inner.node_id.clone(),
                entry.ts,
                Payload::LogEntry {
                    entry: entry.clone(),
                },
            )
            .to(peer.clone())
            .for_resource(entry.resource_id.clone());
            (self.inner.send)(peer, envelope);
        }
    }

    /// Spawns the periodic sync task: every `interval`, sends each known
    /// peer a `SYNC_REQUEST` carrying the highest timestamp already
    /// acknowledged from them.
    pub fn spawn_periodic_sync(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if engine.inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                engine.sync_round();
            }
        })
    }

    fn sync_round(&self) {
        let last_applied = self.inner.last_applied_ts.read().clone();
        for peer in &self.inner.peer_set {
            let from_ts = last_applied.get(peer).copied().unwrap_or(0);
            let ts = self.inner.clock.tick();
            let envelope = Envelope::new(self.inner.node_id.clone(), ts, Payload::SyncRequest { from_ts })
                .to(peer.clone());
            (self.inner.send)(peer, envelope);
        }
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    fn handle_sync_request(&self, peer: &str, from_ts: u64) {
        let entries: Vec<LogEntry> = {
            let log = self.inner.log.read();
            let mut matching: Vec<LogEntry> = log.iter().filter(|e| e.ts > from_ts).cloned().collect();
            matching.sort_by_key(|e| e.ts);
            matching
        };
        if entries.is_empty() {
            debug!(peer, from_ts, "sync request: nothing new to ship");
            return;
        }
        for entry in entries {
            let envelope = Envelope::new(
                self.inner.node_id.clone(),
                entry.ts,
                Payload::LogEntry {
                    entry: entry.clone(),
                },
            )
            .to(peer.to_string())
            .for_resource(entry.resource_id.clone());
            (self.inner.send)(peer, envelope);
        }
    }

    fn handle_log_entry(&self, peer: &str, entry: LogEntry) {
        let key = (entry.origin.clone(), entry.ts);
        let already_applied = self.inner.applied.read().contains(&key);
        if !already_applied {
            self.apply_entry(&entry);
            self.inner.applied.write().insert(key);
            self.inner.log.write().push(entry.clone());
        }
        let ack = Envelope::new(self.inner.node_id.clone(), self.inner.clock.tick(), Payload::LogAck { ts: entry.ts })
            .to(peer.to_string())
            .for_resource(entry.resource_id.clone());
        (self.inner.send)(peer, ack);
    }

    fn handle_log_ack(&self, peer: &str, ts: u64) {
        let mut table = self.inner.last_applied_ts.write();
        let current = table.entry(peer.to_string()).or_insert(0);
        if ts > *current {
            *current = ts;
        }
    }

    fn apply_entry(&self, entry: &LogEntry) {
        let quantity = entry
            .payload
            .get("quantity")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let result = match entry.op.as_str() {
            "add_stock" => self.inner.inventory.add_stock(&entry.resource_id, quantity),
            "reduce" => self.inner.inventory.reduce(&entry.resource_id, quantity),
            "receive" => self.inner.inventory.receive(&entry.resource_id, quantity),
            "transfer_out" => {
                let to_branch = entry
                    .payload
                    .get("to_branch")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                self.inner.inventory.transfer_out(&entry.resource_id, quantity, to_branch)
            }
            other => {
                warn!(op = other, "unknown replicated operation, ignoring");
                return;
            }
        };
        if let Err(e) = result {
            debug!(
                op = entry.op,
                resource = entry.resource_id,
                error = %e,
                "replicated operation was a no-op on this replica"
            );
        }
    }

    /// Applies `envelope.timestamp` to the local clock and dispatches
    /// `SYNC_REQUEST`/`LOG_ENTRY`/`LOG_ACK` payloads. Any other kind is
    /// ignored. The single entry point the branch coordinator calls when
    /// routing inbound replication traffic.
    pub fn deliver(&self, envelope: Envelope) {
        self.inner.clock.update(envelope.timestamp);
        let sender = envelope.sender_id.clone();
        match envelope.payload {
            Payload::SyncRequest { from_ts } => self.handle_sync_request(&sender, from_ts),
            Payload::LogEntry { entry } => self.handle_log_entry(&sender, entry),
            Payload::LogAck { ts } => self.handle_log_ack(&sender, ts),
            _ => {}
        }
    }

    pub fn last_applied_ts(&self, peer: &str) -> u64 {
        self.inner.last_applied_ts.read().get(peer).copied().unwrap_or(0)
    }

    pub fn log_len(&self) -> usize {
        self.inner.log.read().len()
    }
}
