use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::messaging::peer_id::PeerId;

/// What a connection reports to its owner. A connection's event stream ends after `Closed` or
///  `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// One complete frame, as passed to [Connection::send] on the other side
    Received(Bytes),
    /// The other side closed the connection
    Closed,
    Error(String),
}

/// One end of a bidirectional, ordered connection between two peers.
///
/// Sending is non-blocking: frames are queued and delivered in order, or the connection fails
///  visibly through a [ConnectionEvent::Error] / [ConnectionEvent::Closed] on the receiving end.
pub trait Connection: Debug + Send + Sync {
    fn remote_peer_id(&self) -> &PeerId;

    fn send(&self, frame: Bytes) -> anyhow::Result<()>;

    /// Closes the connection. The other side sees [ConnectionEvent::Closed]; closing an already
    ///  closed connection has no effect.
    fn close(&self);
}

/// A connection together with the stream of events it reports
pub struct OpenedConnection {
    pub local_peer_id: PeerId,
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// The result of making a peer addressable: the address other peers can connect to, and the
///  stream of connections they open.
pub struct Listener {
    pub peer_id: PeerId,
    pub incoming: mpsc::UnboundedReceiver<OpenedConnection>,
}

/// The connection-establishment mechanism, i.e. everything below the packet level. Packets are
///  opaque frames at this level.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn listen(&self) -> anyhow::Result<Listener>;

    async fn connect(&self, remote: &PeerId) -> anyhow::Result<OpenedConnection>;
}
