use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::sleep;

use crate::group::client::{create_client, Client};
use crate::group::host::{create_host, Host};
use crate::group::packets::{ClientPacket, HostPacket};
use crate::group::peer::Peer;
use crate::group::peer_config::PeerConfig;
use crate::group::peer_events::PeerEvent;
use crate::group::users::UserData;
use crate::messaging::in_memory::{InMemoryNetwork, SentFrame};
use crate::messaging::peer_id::PeerId;
use crate::messaging::wire;
use crate::test_util::user::MockUser;
use crate::util::clock::{Timestamp, TokioClock};

pub const TEST_BASE_TIMESTAMP: Timestamp = 1590160273660;

/// A config with a clock that follows tokio's (possibly paused) time
pub fn test_config(application_protocol_version: &str) -> PeerConfig {
    let mut config = PeerConfig::new(application_protocol_version);
    config.clock = Arc::new(TokioClock::new(TEST_BASE_TIMESTAMP));
    config
}

/// Lets all spawned tasks run until there is nothing left to do short of waiting for a timer.
///  This relies on tokio's paused time, i.e. `#[tokio::test(start_paused = true)]`.
pub async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

/// A frame from the network's history, decoded according to its direction
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedPacket<D: UserData> {
    ToHost(ClientPacket<D>),
    ToClient(HostPacket<D>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedFrame<D: UserData> {
    pub from: PeerId,
    pub to: PeerId,
    pub packet: RecordedPacket<D>,
}

pub fn decode_history<D: UserData>(history: &[SentFrame], host_peer_id: &PeerId) -> Vec<RecordedFrame<D>> {
    history.iter()
        .map(|sent| {
            let packet = if &sent.to == host_peer_id {
                match wire::decode(&sent.frame) {
                    Ok(packet) => RecordedPacket::ToHost(packet),
                    Err(e) => panic!("frame to the host is no client packet: {}", e),
                }
            }
            else {
                match wire::decode(&sent.frame) {
                    Ok(packet) => RecordedPacket::ToClient(packet),
                    Err(e) => panic!("frame to {:?} is no host packet: {}", sent.to, e),
                }
            };
            RecordedFrame {
                from: sent.from.clone(),
                to: sent.to.clone(),
                packet,
            }
        })
        .collect()
}

/// Everything that was emitted since the last call, without waiting
pub fn drain_events<D: UserData>(events: &mut broadcast::Receiver<PeerEvent<D>>) -> Vec<PeerEvent<D>> {
    let mut result = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => result.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return result,
        }
    }
}

/// A Host with a number of Clients on an in-memory network. The Host's user is called "Host",
///  Clients' users are called "Client 1", "Client 2" etc. in the order they joined.
pub struct TestGroup {
    pub network: InMemoryNetwork,
    pub host: Host<MockUser>,
    pub host_peer_id: PeerId,
    pub clients: Vec<Client<MockUser>>,
}

impl TestGroup {
    pub async fn start(num_clients: usize) -> TestGroup {
        TestGroup::start_with_config(test_config("1"), num_clients).await
    }

    pub async fn start_with_config(config: PeerConfig, num_clients: usize) -> TestGroup {
        let network = InMemoryNetwork::new();
        let config = Arc::new(config);

        let host = match create_host(config.clone(), MockUser::new("Host"), network.transport()).await {
            Ok(host) => host,
            Err(e) => panic!("host did not open: {}", e),
        };
        let host_peer_id = match host.status().peer_id {
            Some(peer_id) => peer_id,
            None => panic!("open host has no peer id"),
        };

        let mut group = TestGroup {
            network,
            host,
            host_peer_id,
            clients: Vec::new(),
        };
        for _ in 0..num_clients {
            group.add_client(config.clone()).await;
        }
        group
    }

    /// Opens one more Client and waits until everybody learned about it
    pub async fn add_client(&mut self, config: Arc<PeerConfig>) {
        let name = format!("Client {}", self.clients.len() + 1);
        match create_client(config, MockUser::new(&name), self.network.transport(), &self.host_peer_id).await {
            Ok(client) => self.clients.push(client),
            Err(e) => panic!("{} did not open: {}", name, e),
        }
        settle().await;
    }

    /// A Client on this group's network that is not opened yet
    pub fn new_client(&self, config: PeerConfig, name: &str) -> Client<MockUser> {
        Client::new(Arc::new(config), MockUser::new(name), self.network.transport())
    }

    pub fn history(&self) -> Vec<RecordedFrame<MockUser>> {
        decode_history(&self.network.history(), &self.host_peer_id)
    }

    pub fn clear_history(&self) {
        self.network.clear_history();
    }

    /// Number of recorded client packets of the given type, see [ClientPacket::packet_type]
    pub fn count_to_host(&self, packet_type: &str) -> usize {
        self.history().iter()
            .filter(|frame| matches!(&frame.packet, RecordedPacket::ToHost(p) if p.packet_type() == packet_type))
            .count()
    }

    /// Number of recorded host packets of the given type, see [HostPacket::packet_type]
    pub fn count_to_clients(&self, packet_type: &str) -> usize {
        self.history().iter()
            .filter(|frame| matches!(&frame.packet, RecordedPacket::ToClient(p) if p.packet_type() == packet_type))
            .count()
    }
}

/// The names of all users a peer knows, sorted
pub async fn user_names<P: Peer<MockUser>>(peer: &P) -> Vec<String> {
    let mut names: Vec<String> = match peer.users().await {
        Ok(users) => users.into_iter()
            .map(|user| user.data.name)
            .collect(),
        Err(e) => panic!("peer is gone: {}", e),
    };
    names.sort();
    names
}
