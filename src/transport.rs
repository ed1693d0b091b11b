// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Owns one listening endpoint, dials and accepts peer links, frames and
//! delivers envelopes, and exposes broadcast. Each peer link is driven by
//! its own read/write pump task; the transport itself only ever touches
//! logical peer ids, never raw sockets directly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::clock::LamportClock;
use crate::codec::EnvelopeCodec;
use crate::error::TransportError;
use crate::message::{Envelope, Payload};

/// Invoked once per delivered inbound envelope, after per-peer FIFO order is
/// established but before any subsystem routing happens.
pub type InboundHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct PeerLink {
    outbound: mpsc::UnboundedSender<Envelope>,
    live: Arc<AtomicBool>,
}

struct Shared {
    node_id: String,
    clock: Arc<LamportClock>,
    peers: RwLock<HashMap<String, PeerLink>>,
    handler: RwLock<Option<InboundHandler>>,
    shutdown: Notify,
    stopped: AtomicBool,
    local_addr: RwLock<Option<std::net::SocketAddr>>,
}

/// A message-oriented peer transport. Cheaply `Clone`-able; every clone
/// shares the same listener, peer table, and handler.
#[derive(Clone)]
pub struct PeerTransport {
    shared: Arc<Shared>,
    listener_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl PeerTransport {
    pub fn new(node_id: impl Into<String>, clock: Arc<LamportClock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                node_id: node_id.into(),
                clock,
                peers: RwLock::new(HashMap::new()),
                handler: RwLock::new(None),
                shutdown: Notify::new(),
                stopped: AtomicBool::new(false),
                local_addr: RwLock::new(None),
            }),
            listener_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Registers the callback invoked once per delivered inbound envelope.
    /// Replaces any previously registered handler.
    pub fn set_handler<F>(&self, f: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Some(Arc::new(f));
    }

    /// Begins accepting inbound peer links on `bind_port`. Idempotent: a
    /// second call while already listening is a no-op.
    pub async fn start(&self, bind_port: u16) -> Result<(), TransportError> {
        if self.listener_task.read().is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(("0.0.0.0", bind_port))
            .await
            .map_err(|source| TransportError::Bind {
                port: bind_port,
                source,
            })?;
        let bound_addr = listener.local_addr().map_err(TransportError::Io)?;
        *self.shared.local_addr.write() = Some(bound_addr);
        info!(port = bound_addr.port(), "peer transport listening");

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.shutdown.notified() => break,
                    _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {
                        if shared.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        continue;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!(%addr, "accepted inbound peer link");
                                spawn_link(shared.clone(), format!("anon:{addr}"), stream);
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                }
            }
            info!("peer transport listener stopped");
        });
        *self.listener_task.write() = Some(task);
        Ok(())
    }

    /// Stops accepting new links and tears down every live peer link.
    /// Idempotent.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.notify_waiters();
        if let Some(task) = self.listener_task.write().take() {
            task.abort();
        }
        self.shared.peers.write().clear();
    }

    /// Establishes an outbound link to `peer_id` if none exists yet, and on
    /// success emits a `PEER_HELLO` carrying the local node id. Returns
    /// whether a usable link exists afterward.
    pub async fn connect(&self, peer_id: &str, host: &str, port: u16) -> bool {
        if self
            .shared
            .peers
            .read()
            .get(peer_id)
            .is_some_and(|link| link.live.load(Ordering::SeqCst))
        {
            return true;
        }

        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                spawn_link(self.shared.clone(), peer_id.to_string(), stream);
                let hello = Envelope::new(
                    self.shared.node_id.clone(),
                    self.shared.clock.tick(),
                    Payload::PeerHello {
                        node_id: self.shared.node_id.clone(),
                    },
                )
                .to(peer_id);
                self.send(peer_id, hello);
                true
            }
            Err(e) => {
                warn!(peer = peer_id, %host, port, error = %e, "connect failed");
                false
            }
        }
    }

    /// Enqueues `envelope` for delivery to `peer_id`. Returns immediately;
    /// a peer with no live link drops the envelope and the call reports
    /// `false` so the caller (e.g. the mutex engine) can treat it as an
    /// implicit reply rather than block forever.
    pub fn send(&self, peer_id: &str, envelope: Envelope) -> bool {
        let peers = self.shared.peers.read();
        match peers.get(peer_id) {
            Some(link) if link.live.load(Ordering::SeqCst) => match link.outbound.send(envelope) {
                Ok(()) => true,
                Err(_) => {
                    link.live.store(false, Ordering::SeqCst);
                    false
                }
            },
            _ => false,
        }
    }

    /// Sends one independent copy of `envelope` to every currently live
    /// peer. No cross-peer ordering is implied.
    pub fn broadcast(&self, envelope: Envelope) {
        for peer_id in self.live_peers() {
            self.send(&peer_id, envelope.clone());
        }
    }

    pub fn live_peers(&self) -> HashSet<String> {
        self.shared
            .peers
            .read()
            .iter()
            .filter(|(_, link)| link.live.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Marks `peer_id` not-live without tearing down its link, e.g. on a
    /// `PEER_GOODBYE`. The peer stays in the table so the next successful
    /// `connect` or inbound `PEER_HELLO` can reinstate it.
    pub fn mark_not_live(&self, peer_id: &str) {
        mark_dead(&self.shared, peer_id);
    }

    /// The address actually bound by [`PeerTransport::start`], useful when
    /// binding to port 0 and letting the OS assign one. `None` before
    /// `start` has completed.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.shared.local_addr.read()
    }

    pub fn is_live(&self, peer_id: &str) -> bool {
        self.shared
            .peers
            .read()
            .get(peer_id)
            .is_some_and(|link| link.live.load(Ordering::SeqCst))
    }
}

fn mark_dead(shared: &Shared, key: &str) {
    if let Some(link) = shared.peers.read().get(key) {
        link.live.store(false, Ordering::SeqCst);
    }
}

fn rebind(shared: &Shared, old_key: &str, new_key: String) {
    if old_key == new_key {
        return;
    }
    let mut peers = shared.peers.write();
    if let Some(link) = peers.remove(old_key) {
        info!(from = old_key, to = %new_key, "rebinding anonymous peer link to canonical id");
        peers.insert(new_key, link);
    }
}

/// Spawns the read and write pump tasks for one peer link and registers it
/// in the shared peer table under `key` (a socket address for still-anonymous
/// inbound links, or the canonical peer id for outbound links and links that
/// have already exchanged `PEER_HELLO`).
fn spawn_link(shared: Arc<Shared>, key: String, stream: TcpStream) {
    let framed = Framed::new(stream, EnvelopeCodec::new());
    let (mut sink, mut source) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let live = Arc::new(AtomicBool::new(true));

    shared.peers.write().insert(
        key.clone(),
        PeerLink {
            outbound: tx,
            live: live.clone(),
        },
    );

    let write_shared = shared.clone();
    let write_key = key.clone();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = sink.send(envelope).await {
                warn!(peer = %write_key, error = %e, "send failed, marking peer not-live");
                break;
            }
        }
        mark_dead(&write_shared, &write_key);
    });

    let read_shared = shared.clone();
    tokio::spawn(async move {
        let mut current_key = key;
        loop {
            match source.next().await {
                Some(Ok(envelope)) => {
                    if let Payload::PeerHello { ref node_id } = envelope.payload {
                        if node_id != &current_key {
                            rebind(&read_shared, &current_key, node_id.clone());
                            current_key = node_id.clone();
                        }
                    }
                    let handler = read_shared.handler.read().clone();
                    if let Some(handler) = handler {
                        handler(envelope);
                    }
                }
                Some(Err(e)) => {
                    warn!(peer = %current_key, error = %e, "envelope decode error, dropping link");
                    break;
                }
                None => {
                    debug!(peer = %current_key, "peer link closed by remote");
                    break;
                }
            }
        }
        mark_dead(&read_shared, &current_key);
    });
}
