use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, instrument, warn};

use crate::messaging::peer_id::PeerId;
use crate::messaging::transport::{Connection, ConnectionEvent, Listener, OpenedConnection, Transport};
use crate::messaging::wire;

/// Transport over plain TCP. A peer's id is its socket address, so Clients pass the Host's
///  `host:port` to `open()`.
#[derive(Debug)]
pub struct TcpTransport {
    bind_addr: SocketAddr,
}

impl TcpTransport {
    /// `bind_addr` is only used for listening; binding to port 0 picks a free port, which is
    ///  then reported as the Host's peer id.
    pub fn new(bind_addr: SocketAddr) -> TcpTransport {
        TcpTransport { bind_addr }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self) -> anyhow::Result<Listener> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let peer_id = PeerId::new(listener.local_addr()?.to_string());
        debug!(?peer_id, "listening");

        let (sender, incoming) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(listener, peer_id.clone(), sender));

        Ok(Listener {
            peer_id,
            incoming,
        })
    }

    async fn connect(&self, remote: &PeerId) -> anyhow::Result<OpenedConnection> {
        let addr: SocketAddr = remote.as_str().parse()?;
        let stream = TcpStream::connect(addr).await?;
        let local = PeerId::new(stream.local_addr()?.to_string());
        debug!(?local, ?remote, "connected");
        Ok(open_stream(stream, local, remote.clone()))
    }
}

/// Runs until the [Listener]'s receiving side is dropped, which closes the socket
#[instrument(name = "tcp_accept", skip_all, fields(peer_id = %peer_id))]
async fn accept_loop(listener: TcpListener, peer_id: PeerId, incoming: mpsc::UnboundedSender<OpenedConnection>) {
    loop {
        let accepted = select! {
            accepted = listener.accept() => accepted,
            _ = incoming.closed() => {
                debug!("listener was dropped - shutting down");
                return;
            }
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                if incoming.send(open_stream(stream, peer_id.clone(), PeerId::new(addr.to_string()))).is_err() {
                    debug!("listener was dropped - shutting down");
                    return;
                }
            }
            Err(e) => {
                warn!("error accepting connection - shutting down: {}", e);
                return;
            }
        }
    }
}

fn open_stream(stream: TcpStream, local: PeerId, remote: PeerId) -> OpenedConnection {
    let (read_half, write_half) = stream.into_split();
    let (frame_sender, frames) = mpsc::unbounded_channel();
    let (event_sender, events) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(write_half, frames, remote.clone()));
    let reader = tokio::spawn(read_loop(read_half, event_sender, remote.clone()));

    OpenedConnection {
        local_peer_id: local,
        connection: Arc::new(TcpConnection {
            remote,
            frames: Mutex::new(Some(frame_sender)),
            reader: reader.abort_handle(),
        }),
        events,
    }
}

#[instrument(name = "tcp_writer", skip_all, fields(remote = %remote))]
async fn write_loop(mut write_half: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Bytes>, remote: PeerId) {
    while let Some(frame) = frames.recv().await {
        let buf = match wire::length_prefixed(&frame) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("dropping frame: {}", e);
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&buf).await {
            warn!("error writing to connection: {}", e);
            return;
        }
    }
    debug!("connection closed locally");
    let _ = write_half.shutdown().await;
}

#[instrument(name = "tcp_reader", skip_all, fields(remote = %remote))]
async fn read_loop(mut read_half: OwnedReadHalf, events: mpsc::UnboundedSender<ConnectionEvent>, remote: PeerId) {
    let event = match read_frames(&mut read_half, &events).await {
        Ok(()) => return,
        Err(e) => match e.downcast_ref::<std::io::Error>() {
            Some(io) if io.kind() == ErrorKind::UnexpectedEof => {
                debug!("connection closed by remote");
                ConnectionEvent::Closed
            }
            _ => {
                warn!("connection broke: {}", e);
                ConnectionEvent::Error(e.to_string())
            }
        }
    };
    let _ = events.send(event);
}

/// returns `Ok` only if the receiving side was dropped
async fn read_frames(read_half: &mut OwnedReadHalf, events: &mpsc::UnboundedSender<ConnectionEvent>) -> anyhow::Result<()> {
    let mut len_buf = [0u8; wire::LEN_SIZE];
    loop {
        read_half.read_exact(&mut len_buf).await?;
        let len = wire::frame_len(len_buf)?;

        let mut buf = vec![0u8; len];
        read_half.read_exact(&mut buf).await?;

        if events.send(ConnectionEvent::Received(Bytes::from(buf))).is_err() {
            return Ok(());
        }
    }
}

struct TcpConnection {
    remote: PeerId,
    frames: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: AbortHandle,
}

impl Debug for TcpConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpConnection{{remote:{:?}}}", self.remote)
    }
}

impl Connection for TcpConnection {
    fn remote_peer_id(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, frame: Bytes) -> anyhow::Result<()> {
        let frames = self.frames.lock()
            .unwrap_or_else(PoisonError::into_inner);
        match frames.as_ref() {
            Some(sender) if sender.send(frame).is_ok() => Ok(()),
            _ => bail!("connection to {:?} is closed", self.remote),
        }
    }

    fn close(&self) {
        // dropping the sender terminates the write loop, which shuts down the socket
        self.frames.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    fn localhost() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    async fn test_exchange_frames() {
        let transport = TcpTransport::new(localhost());
        let mut listener = transport.listen().await.unwrap();

        let mut client = transport.connect(&listener.peer_id).await.unwrap();
        let mut server = listener.incoming.recv().await.unwrap();

        client.connection.send(Bytes::from_static(b"hello")).unwrap();
        client.connection.send(Bytes::new()).unwrap();
        server.connection.send(Bytes::from_static(b"welcome")).unwrap();

        assert_eq!(server.events.recv().await, Some(ConnectionEvent::Received(Bytes::from_static(b"hello"))));
        assert_eq!(server.events.recv().await, Some(ConnectionEvent::Received(Bytes::new())));
        assert_eq!(client.events.recv().await, Some(ConnectionEvent::Received(Bytes::from_static(b"welcome"))));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_remote() {
        let transport = TcpTransport::new(localhost());
        let mut listener = transport.listen().await.unwrap();

        let client = transport.connect(&listener.peer_id).await.unwrap();
        let mut server = listener.incoming.recv().await.unwrap();

        client.connection.close();
        assert_eq!(server.events.recv().await, Some(ConnectionEvent::Closed));
        assert!(client.connection.send(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn test_dropping_the_listener_closes_the_socket() {
        let transport = TcpTransport::new(localhost());
        let listener = transport.listen().await.unwrap();
        let peer_id = listener.peer_id.clone();
        drop(listener);

        for _ in 0..100 {
            if transport.connect(&peer_id).await.is_err() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("{:?} still accepts connections", peer_id);
    }

    #[tokio::test]
    async fn test_connect_to_invalid_address() {
        let transport = TcpTransport::new(localhost());
        assert!(transport.connect(&PeerId::from("not an address")).await.is_err());
    }
}
