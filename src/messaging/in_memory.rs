use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::messaging::peer_id::PeerId;
use crate::messaging::transport::{Connection, ConnectionEvent, Listener, OpenedConnection, Transport};

/// A frame as it was handed to the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentFrame {
    pub from: PeerId,
    pub to: PeerId,
    pub frame: Bytes,
}

#[derive(Default)]
struct NetworkState {
    listeners: FxHashMap<PeerId, mpsc::UnboundedSender<OpenedConnection>>,
    history: Vec<SentFrame>,
    unresponsive: FxHashSet<PeerId>,
    next_peer_number: u64,
}
impl NetworkState {
    fn new_peer_id(&mut self) -> PeerId {
        self.next_peer_number += 1;
        PeerId::new(format!("peer-{}", self.next_peer_number))
    }
}

/// An in-process network of peers. Every frame sent through it is recorded in a history, and
///  peers can be made unresponsive: frames addressed to them are still recorded, but never
///  delivered.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InMemoryNetwork")
    }
}

impl InMemoryNetwork {
    pub fn new() -> InMemoryNetwork {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            network: self.clone(),
        })
    }

    pub fn history(&self) -> Vec<SentFrame> {
        self.lock().history.clone()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    pub fn set_unresponsive(&self, peer_id: &PeerId) {
        debug!(?peer_id, "peer becomes unresponsive");
        self.lock().unresponsive.insert(peer_id.clone());
    }

    fn record(&self, from: &PeerId, to: &PeerId, frame: &Bytes) -> bool {
        let mut state = self.lock();
        state.history.push(SentFrame {
            from: from.clone(),
            to: to.clone(),
            frame: frame.clone(),
        });
        !state.unresponsive.contains(to)
    }
}

#[derive(Debug)]
pub struct InMemoryTransport {
    network: InMemoryNetwork,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn listen(&self) -> anyhow::Result<Listener> {
        let (sender, incoming) = mpsc::unbounded_channel();

        let mut state = self.network.lock();
        let peer_id = state.new_peer_id();
        debug!(?peer_id, "listening");
        state.listeners.insert(peer_id.clone(), sender);

        Ok(Listener {
            peer_id,
            incoming,
        })
    }

    async fn connect(&self, remote: &PeerId) -> anyhow::Result<OpenedConnection> {
        let (listener, local) = {
            let mut state = self.network.lock();
            let listener = match state.listeners.get(remote) {
                Some(l) => l.clone(),
                None => bail!("no peer is listening at {:?}", remote),
            };
            (listener, state.new_peer_id())
        };
        debug!(?local, ?remote, "connecting");

        let (local_events_sender, local_events) = mpsc::unbounded_channel();
        let (remote_events_sender, remote_events) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let local_end = InMemoryConnection {
            network: self.network.clone(),
            local: local.clone(),
            remote: remote.clone(),
            to_remote: remote_events_sender,
            closed: closed.clone(),
        };
        let remote_end = InMemoryConnection {
            network: self.network.clone(),
            local: remote.clone(),
            remote: local.clone(),
            to_remote: local_events_sender,
            closed,
        };

        if listener.send(OpenedConnection {
            local_peer_id: remote.clone(),
            connection: Arc::new(remote_end),
            events: remote_events,
        }).is_err() {
            bail!("peer at {:?} stopped listening", remote);
        }

        Ok(OpenedConnection {
            local_peer_id: local,
            connection: Arc::new(local_end),
            events: local_events,
        })
    }
}

struct InMemoryConnection {
    network: InMemoryNetwork,
    local: PeerId,
    remote: PeerId,
    to_remote: mpsc::UnboundedSender<ConnectionEvent>,
    /// shared by both ends
    closed: Arc<AtomicBool>,
}

impl Debug for InMemoryConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InMemoryConnection{{{:?} -> {:?}}}", self.local, self.remote)
    }
}

impl Connection for InMemoryConnection {
    fn remote_peer_id(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("connection {:?} -> {:?} is closed", self.local, self.remote);
        }

        if !self.network.record(&self.local, &self.remote, &frame) {
            trace!(to = ?self.remote, "dropping frame to unresponsive peer");
            return Ok(());
        }

        if self.to_remote.send(ConnectionEvent::Received(frame)).is_err() {
            bail!("peer {:?} dropped the connection", self.remote);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(local = ?self.local, remote = ?self.remote, "closing connection");
            let _ = self.to_remote.send(ConnectionEvent::Closed);
        }
    }
}
