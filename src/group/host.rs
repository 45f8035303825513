use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use crate::group::error::{ConnectionError, ErrorReason, PeerError, TimeoutError};
use crate::group::ids::{SerialId, UserId};
use crate::group::message::Message;
use crate::group::packets::{ClientPacket, HostPacket};
use crate::group::peer::{forward_connection_events, run_peer, spawn_timer, ConnectionState, Peer, PeerCore, PeerHandle, PeerRole, PeerStatus};
use crate::group::peer_config::PeerConfig;
use crate::group::peer_events::{OpenResult, PeerEvent};
use crate::group::ping::{round_trip_time, PingReply, PingRound, PongSequences};
use crate::group::users::{PingInfo, User, UserData, UserInfo, UserUpdate};
use crate::group::versions::Versions;
use crate::messaging::transport::{Connection, ConnectionEvent, Listener, OpenedConnection, Transport};
use crate::messaging::wire;
use crate::util::clock::Timestamp;

type ConnectionId = u64;

pub(crate) enum HostCommand {
    Open {
        listener: Listener,
        reply: oneshot::Sender<Result<OpenResult, PeerError>>,
    },
    Incoming(OpenedConnection),
    Connection {
        connection_id: ConnectionId,
        event: ConnectionEvent,
    },
    HandshakeTimeout(ConnectionId),
    RelayTimeout(SerialId),
    Ping(Option<PingReply>),
    PingTimeout(u64),
    StopPing,
    CloseConnection(UserId),
    Kick(UserId),
    Close(oneshot::Sender<Result<(), PeerError>>),
}

/// The central peer of a group: it is a participant like every Client, and additionally
///  accepts Client connections, relays messages between users and tracks their liveness.
pub struct Host<D: UserData> {
    handle: PeerHandle<D>,
    commands: mpsc::UnboundedSender<HostCommand>,
    transport: Arc<dyn Transport>,
}

impl <D: UserData> Host<D> {
    pub fn new(config: Arc<PeerConfig>, user_data: D, transport: Arc<dyn Transport>) -> Host<D> {
        let (core, handle, peer_commands) = PeerCore::new(user_data, config);
        let (commands, role_commands) = mpsc::unbounded_channel();

        let actor = HostActor::new(core, commands.downgrade());
        tokio::spawn(run_peer(actor, peer_commands, role_commands));

        Host {
            handle,
            commands,
            transport,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T, PeerError>>) -> HostCommand) -> Result<T, PeerError> {
        let (reply, receiver) = oneshot::channel();
        self.commands.send(command(reply))
            .map_err(|_| ConnectionError::Closed)?;
        receiver.await
            .map_err(|_| ConnectionError::Closed)?
    }

    /// Starts listening for Clients. The Host's own user is part of the group from here on.
    pub async fn open(&self) -> Result<OpenResult, PeerError> {
        if !self.is_disconnected() {
            return Err(ConnectionError::AlreadyOpen.into());
        }
        let listener = self.transport.listen().await
            .map_err(ConnectionError::from)?;
        self.request(|reply| HostCommand::Open { listener, reply }).await
    }

    /// Disconnects every Client and stops listening. Pending operations fail with
    ///  [ConnectionError::Closed].
    pub async fn close(&self) -> Result<(), PeerError> {
        self.request(HostCommand::Close).await
    }

    /// Sends a PING to every user and resolves when all of them answered. Users that do not
    ///  answer within the configured timeout are disconnected, and the call fails with a
    ///  [TimeoutError]. Calls while a round is in progress join that round.
    pub async fn ping(&self) -> Result<(), PeerError> {
        self.request(|reply| HostCommand::Ping(Some(reply))).await
    }

    /// Stops the periodic pinging that was configured by [PeerConfig::ping_interval]
    pub fn stop_ping(&self) {
        let _ = self.commands.send(HostCommand::StopPing);
    }

    pub fn close_connection_to_client(&self, user_id: &UserId) -> Result<(), PeerError> {
        self.post_for_other_user(user_id, HostCommand::CloseConnection(user_id.clone()))
    }

    /// Disconnects a user for good: the user is told so, and it can not reconnect
    pub fn kick_user(&self, user_id: &UserId) -> Result<(), PeerError> {
        self.post_for_other_user(user_id, HostCommand::Kick(user_id.clone()))
    }

    fn post_for_other_user(&self, user_id: &UserId, command: HostCommand) -> Result<(), PeerError> {
        if user_id == self.user_id() {
            return Err(ConnectionError::SelfReference(user_id.clone()).into());
        }
        self.commands.send(command)
            .map_err(|_| ConnectionError::Closed)?;
        Ok(())
    }
}

impl <D: UserData> Peer<D> for Host<D> {
    fn handle(&self) -> &PeerHandle<D> {
        &self.handle
    }

    fn is_host(&self) -> bool {
        true
    }
}

/// Creates a Host and opens it
pub async fn create_host<D: UserData>(config: Arc<PeerConfig>, user_data: D, transport: Arc<dyn Transport>) -> Result<Host<D>, PeerError> {
    let host = Host::new(config, user_data, transport);
    host.open().await?;
    Ok(host)
}

struct HostConnection {
    connection: Arc<dyn Connection>,
    /// `None` until the Client's HELLO / HELLO_AGAIN was accepted
    user_id: Option<UserId>,
    reader: JoinHandle<()>,
}

/// A relayed message that not all of its targets acknowledged yet. It is given up after the
///  configured timeout, when the origin has stopped waiting for it.
struct Relay {
    origin: UserId,
    pending: FxHashSet<UserId>,
    timeout: JoinHandle<()>,
}

struct HostActor<D: UserData> {
    core: PeerCore<D>,
    commands: mpsc::WeakUnboundedSender<HostCommand>,
    accept_task: Option<JoinHandle<()>>,
    connections: FxHashMap<ConnectionId, HostConnection>,
    user_connections: FxHashMap<UserId, ConnectionId>,
    next_connection_id: ConnectionId,
    kicked: FxHashSet<UserId>,
    relays: FxHashMap<SerialId, Relay>,
    ping_round: Option<PingRound>,
    next_ping_round_id: u64,
    pong_sequences: PongSequences,
    ping_ticker: Option<JoinHandle<()>>,
}

impl <D: UserData> HostActor<D> {
    fn new(core: PeerCore<D>, commands: mpsc::WeakUnboundedSender<HostCommand>) -> HostActor<D> {
        HostActor {
            core,
            commands,
            accept_task: None,
            connections: Default::default(),
            user_connections: Default::default(),
            next_connection_id: 0,
            kicked: Default::default(),
            relays: Default::default(),
            ping_round: None,
            next_ping_round_id: 0,
            pong_sequences: Default::default(),
            ping_ticker: None,
        }
    }

    #[instrument(name="host_open", skip_all, fields(user_id=?self.core.user_id))]
    fn open(&mut self, listener: Listener) -> Result<OpenResult, PeerError> {
        if self.core.state() != ConnectionState::Disconnected {
            return Err(ConnectionError::AlreadyOpen.into());
        }

        let Listener { peer_id, mut incoming } = listener;
        info!(?peer_id, "host is open");

        let commands = self.commands.clone();
        self.accept_task = Some(tokio::spawn(async move {
            while let Some(opened) = incoming.recv().await {
                match commands.upgrade() {
                    Some(commands) => {
                        if commands.send(HostCommand::Incoming(opened)).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }));

        self.core.set_status(PeerStatus {
            state: ConnectionState::Connected,
            peer_id: Some(peer_id.clone()),
            host_peer_id: Some(peer_id.clone()),
        });
        let result = OpenResult {
            peer_id,
            user_id: self.core.user_id.clone(),
        };
        self.core.emit(PeerEvent::Connected(result.clone()));

        if let Some(interval) = self.core.config.ping_interval {
            self.start_ping_ticker(interval);
        }
        Ok(result)
    }

    fn start_ping_ticker(&mut self, interval: Duration) {
        debug!(?interval, "starting periodic ping");
        let commands = self.commands.clone();
        self.ping_ticker = Some(tokio::spawn(async move {
            let mut ticks = time::interval(interval);
            // the first tick completes immediately
            ticks.tick().await;
            loop {
                ticks.tick().await;
                match commands.upgrade() {
                    Some(commands) => {
                        if commands.send(HostCommand::Ping(None)).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }));
    }

    fn stop_ping(&mut self) {
        if let Some(ticker) = self.ping_ticker.take() {
            debug!("stopping periodic ping");
            ticker.abort();
        }
    }

    fn on_incoming(&mut self, opened: OpenedConnection) {
        if self.core.state() != ConnectionState::Connected {
            debug!("rejecting connection while closed");
            opened.connection.close();
            return;
        }

        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;
        let OpenedConnection { connection, events, .. } = opened;
        debug!(connection_id, remote = ?connection.remote_peer_id(), "accepted connection");

        let reader = tokio::spawn(forward_connection_events(
            events,
            self.commands.clone(),
            move |event| HostCommand::Connection { connection_id, event },
        ));
        self.connections.insert(connection_id, HostConnection {
            connection,
            user_id: None,
            reader,
        });
        spawn_timer(self.commands.clone(), self.core.config.timeout, HostCommand::HandshakeTimeout(connection_id));
    }

    fn on_handshake_timeout(&mut self, connection_id: ConnectionId) {
        let is_awaiting_hello = self.connections.get(&connection_id)
            .map(|connection| connection.user_id.is_none())
            .unwrap_or(false);
        if is_awaiting_hello {
            info!(connection_id, "no handshake within {:?} - dropping connection", self.core.config.timeout);
            self.drop_connection(connection_id);
        }
    }

    fn on_connection_event(&mut self, connection_id: ConnectionId, event: ConnectionEvent) {
        let user_id = match self.connections.get(&connection_id) {
            Some(connection) => connection.user_id.clone(),
            None => {
                trace!(connection_id, "event for a connection that was dropped already");
                return;
            }
        };

        match event {
            ConnectionEvent::Received(frame) => {
                let packet = match wire::decode::<ClientPacket<D>>(&frame) {
                    Ok(packet) => packet,
                    Err(e) => {
                        self.core.report(e.into(), ErrorReason::Other);
                        return;
                    }
                };
                match user_id {
                    Some(user_id) => self.handle_client_packet(user_id, packet),
                    None => self.on_handshake(connection_id, packet),
                }
            }
            ConnectionEvent::Closed => self.on_connection_lost(connection_id, user_id),
            ConnectionEvent::Error(e) => {
                self.core.report(ConnectionError::Transport(e).into(), ErrorReason::Other);
                self.on_connection_lost(connection_id, user_id);
            }
        }
    }

    fn on_connection_lost(&mut self, connection_id: ConnectionId, user_id: Option<UserId>) {
        match user_id {
            Some(user_id) => {
                info!(?user_id, "connection to user was lost");
                self.disconnect_user(&user_id, false);
            }
            None => self.drop_connection(connection_id),
        }
    }

    fn on_handshake(&mut self, connection_id: ConnectionId, packet: ClientPacket<D>) {
        match packet {
            ClientPacket::Hello { user, versions } => self.on_hello(connection_id, user, versions),
            ClientPacket::HelloAgain { user_id, versions } => self.on_hello_again(connection_id, user_id, versions),
            other => {
                self.core.report(PeerError::InternalInconsistency(format!("{} before handshake", other.packet_type())), ErrorReason::Internal);
                self.drop_connection(connection_id);
            }
        }
    }

    /// Rejects and drops the connection if the Client's versions differ from the Host's
    fn check_versions(&mut self, connection_id: ConnectionId, versions: &Versions) -> bool {
        let incompatible = self.core.versions.incompatibilities(versions);
        if incompatible.is_empty() {
            return true;
        }

        info!(connection_id, ?incompatible, ?versions, "rejecting client with incompatible versions");
        let packet = HostPacket::Incompatible { versions: self.core.versions.clone() };
        self.send_to_connection(connection_id, &packet);
        self.drop_connection(connection_id);
        false
    }

    fn on_hello(&mut self, connection_id: ConnectionId, user: User<D>, versions: Versions) {
        if !self.check_versions(connection_id, &versions) {
            return;
        }
        if self.kicked.contains(&user.id) {
            info!(user_id = ?user.id, "refusing kicked user");
            self.send_to_connection(connection_id, &HostPacket::ReconnectFailed);
            self.drop_connection(connection_id);
            return;
        }
        if self.core.registry.contains(&user.id) {
            self.core.report(PeerError::InternalInconsistency(format!("HELLO from user {:?} which is connected already", user.id)), ErrorReason::Internal);
            self.drop_connection(connection_id);
            return;
        }

        info!(user_id = ?user.id, "user joined");
        self.bind(connection_id, user.id.clone());
        self.send_to_connection(connection_id, &HostPacket::Welcome { users: self.core.registry.snapshot() });
        self.broadcast(HostPacket::UserConnected { user }, None);
    }

    fn on_hello_again(&mut self, connection_id: ConnectionId, user_id: UserId, versions: Versions) {
        if !self.check_versions(connection_id, &versions) {
            return;
        }

        let is_known = self.core.registry.contains(&user_id) || self.core.registry.is_departed(&user_id);
        if !is_known || self.kicked.contains(&user_id) || self.core.is_own(&user_id) {
            info!(?user_id, "reconnect failed");
            self.send_to_connection(connection_id, &HostPacket::ReconnectFailed);
            self.drop_connection(connection_id);
            return;
        }

        match self.user_connections.get(&user_id).copied() {
            Some(previous) => {
                info!(?user_id, "user took its session over to a new connection");
                self.drop_connection(previous);
                self.bind(connection_id, user_id.clone());
            }
            None => {
                info!(?user_id, "user reconnected");
                self.bind(connection_id, user_id.clone());
                self.broadcast(HostPacket::UserReconnected { user_id: user_id.clone() }, Some(&user_id));
            }
        }

        let packet = HostPacket::WelcomeBack {
            users: self.core.registry.snapshot(),
            user_id,
        };
        self.send_to_connection(connection_id, &packet);
    }

    fn bind(&mut self, connection_id: ConnectionId, user_id: UserId) {
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.user_id = Some(user_id.clone());
        }
        self.pong_sequences.reset(&user_id);
        self.user_connections.insert(user_id, connection_id);
    }

    /// Closes a connection without any protocol-level consequences
    fn drop_connection(&mut self, connection_id: ConnectionId) {
        if let Some(connection) = self.connections.remove(&connection_id) {
            trace!(connection_id, "dropping connection");
            connection.reader.abort();
            connection.connection.close();
            if let Some(user_id) = connection.user_id {
                if self.user_connections.get(&user_id) == Some(&connection_id) {
                    self.user_connections.remove(&user_id);
                }
            }
        }
    }

    fn send_to_connection(&self, connection_id: ConnectionId, packet: &HostPacket<D>) {
        let connection = match self.connections.get(&connection_id) {
            Some(connection) => connection,
            None => {
                debug!(connection_id, packet_type = packet.packet_type(), "connection is gone - dropping packet");
                return;
            }
        };
        let sent = wire::encode(packet)
            .map_err(PeerError::from)
            .and_then(|frame| connection.connection.send(frame)
                .map_err(|e| ConnectionError::from(e).into()));
        if let Err(e) = sent {
            self.core.report(e, ErrorReason::Other);
        }
    }

    /// Host packets addressed to the Host's own user are handled in place
    fn send_host_packet(&mut self, user_id: &UserId, packet: HostPacket<D>) {
        if self.core.is_own(user_id) {
            self.handle_host_packet(packet);
            return;
        }
        match self.user_connections.get(user_id) {
            Some(&connection_id) => self.send_to_connection(connection_id, &packet),
            None => debug!(?user_id, packet_type = packet.packet_type(), "no connection to user - dropping packet"),
        }
    }

    /// Sends a packet to every user in the registry, including the Host's own user
    fn broadcast(&mut self, packet: HostPacket<D>, except: Option<&UserId>) {
        let targets: Vec<UserId> = self.core.registry.user_ids()
            .into_iter()
            .filter(|user_id| Some(user_id) != except)
            .collect();
        trace!(packet_type = packet.packet_type(), num_targets = targets.len(), "broadcast");

        for user_id in targets {
            self.send_host_packet(&user_id, packet.clone());
        }
    }

    fn handle_client_packet(&mut self, from: UserId, packet: ClientPacket<D>) {
        trace!(?from, packet_type = packet.packet_type(), "handling client packet");

        match packet {
            ClientPacket::Hello { .. } | ClientPacket::HelloAgain { .. } => {
                self.core.report(PeerError::InternalInconsistency(format!("handshake from user {:?} which is connected already", from)), ErrorReason::Internal);
            }
            ClientPacket::Disconnect => {
                info!(user_id = ?from, "user disconnected");
                self.disconnect_user(&from, false);
            }
            ClientPacket::Pong { initiation_date, sequence_number } => self.on_pong(from, initiation_date, sequence_number),
            ClientPacket::Message { message, targets } => self.relay(from, message, targets),
            ClientPacket::Acknowledge { serial_id } => self.on_acknowledge(from, serial_id),
            ClientPacket::UpdateUser { update } => {
                self.broadcast(HostPacket::UpdateUser { user: UserUpdate { id: from, update } }, None);
            }
        }
    }

    #[instrument(skip_all, fields(from=?from, serial_id=?message.serial_id))]
    fn relay(&mut self, from: UserId, message: Message, targets: Option<Vec<UserId>>) {
        let serial_id = message.serial_id.clone();
        self.send_host_packet(&from, HostPacket::AcknowledgedByHost { serial_id: serial_id.clone() });

        let targets = match targets {
            Some(targets) => {
                let (mut known, unknown): (Vec<UserId>, Vec<UserId>) = targets.into_iter()
                    .partition(|user_id| self.core.registry.contains(user_id));
                if !unknown.is_empty() {
                    debug!(?unknown, "skipping targets that are not connected");
                }
                known.sort();
                known.dedup();
                known
            }
            None => self.core.registry.user_ids(),
        };

        if targets.is_empty() {
            debug!("no targets - acknowledged by all right away");
            self.send_host_packet(&from, HostPacket::AcknowledgedByAll { serial_id });
            return;
        }

        debug!(num_targets = targets.len(), "relaying message");
        let timeout = spawn_timer(self.commands.clone(), self.core.config.timeout, HostCommand::RelayTimeout(serial_id.clone()));
        self.relays.insert(serial_id, Relay {
            origin: from,
            pending: targets.iter().cloned().collect(),
            timeout,
        });
        for user_id in targets {
            self.send_host_packet(&user_id, HostPacket::RelayedMessage { message: message.clone() });
        }
    }

    fn on_acknowledge(&mut self, from: UserId, serial_id: SerialId) {
        let is_complete = match self.relays.get_mut(&serial_id) {
            Some(relay) => {
                relay.pending.remove(&from);
                relay.pending.is_empty()
            }
            None if self.core.is_ignored(&serial_id) => {
                trace!(?from, ?serial_id, "dropping acknowledgment for a relay that was given up");
                return;
            }
            None => {
                self.core.report(PeerError::InternalInconsistency(format!("acknowledgment by {:?} for unknown relay {:?}", from, serial_id)), ErrorReason::Internal);
                return;
            }
        };
        if is_complete {
            self.complete_relay(serial_id);
        }
    }

    fn complete_relay(&mut self, serial_id: SerialId) {
        if let Some(relay) = self.relays.remove(&serial_id) {
            relay.timeout.abort();
            if self.core.registry.contains(&relay.origin) {
                self.send_host_packet(&relay.origin, HostPacket::AcknowledgedByAll { serial_id });
            }
            else {
                debug!(?serial_id, origin = ?relay.origin, "relay completed after its origin left");
            }
        }
    }

    /// The origin's own acknowledgment timeout has expired by now, so nobody waits for this relay
    ///  any more. Late acknowledgments for it are dropped.
    fn on_relay_timeout(&mut self, serial_id: SerialId) {
        if let Some(relay) = self.relays.remove(&serial_id) {
            warn!(?serial_id, origin = ?relay.origin, unacknowledged = ?relay.pending, "giving up relay");
            self.core.ignore_serial_id(serial_id);
        }
    }

    /// Removes a user from the group, telling everybody else. A kicked user is told first.
    fn disconnect_user(&mut self, user_id: &UserId, kicked: bool) {
        let connection_id = match self.user_connections.get(user_id) {
            Some(&connection_id) => connection_id,
            None => {
                self.core.report(PeerError::InternalInconsistency(format!("no connection to user {:?}", user_id)), ErrorReason::Internal);
                return;
            }
        };
        debug!(?user_id, kicked, "disconnecting user");

        if kicked {
            self.kicked.insert(user_id.clone());
            self.send_to_connection(connection_id, &HostPacket::KickUser { user_id: user_id.clone() });
        }
        self.drop_connection(connection_id);
        self.pong_sequences.reset(user_id);

        let completed: Vec<SerialId> = self.relays.iter_mut()
            .filter_map(|(serial_id, relay)| {
                relay.pending.remove(user_id);
                relay.pending.is_empty().then(|| serial_id.clone())
            })
            .collect();

        let packet = if kicked {
            HostPacket::KickUser { user_id: user_id.clone() }
        }
        else {
            HostPacket::UserDisconnected { user_id: user_id.clone() }
        };
        self.broadcast(packet, Some(user_id));

        for serial_id in completed {
            self.complete_relay(serial_id);
        }

        if let Some(round) = &mut self.ping_round {
            round.remove_participant(user_id);
        }
        self.finish_ping_round_if_complete();
    }

    fn close_connection_to_client(&mut self, user_id: UserId, kicked: bool) {
        if self.user_connections.contains_key(&user_id) {
            info!(?user_id, kicked, "closing connection to client");
            self.disconnect_user(&user_id, kicked);
        }
        else {
            self.core.report(PeerError::InternalInconsistency(format!("no connection to user {:?}", user_id)), ErrorReason::Internal);
        }
    }

    fn ping(&mut self, reply: Option<PingReply>) {
        if self.core.state() != ConnectionState::Connected {
            if let Some(reply) = reply {
                let _ = reply.send(Err(ConnectionError::NotOpen.into()));
            }
            return;
        }

        if let Some(round) = &mut self.ping_round {
            trace!(id = round.id, "joining the ping round in progress");
            round.add_waiter(reply);
            return;
        }

        self.next_ping_round_id += 1;
        let id = self.next_ping_round_id;
        let initiation_date = self.core.config.clock.now_millis();
        let participants = self.core.registry.user_ids();
        let timeout = spawn_timer(self.commands.clone(), self.core.config.timeout, HostCommand::PingTimeout(id));

        let mut round = PingRound::new(id, initiation_date, participants.clone(), timeout);
        round.add_waiter(reply);
        self.ping_round = Some(round);

        for user_id in participants {
            self.send_host_packet(&user_id, HostPacket::Ping { initiation_date });
        }
        self.finish_ping_round_if_complete();
    }

    fn on_pong(&mut self, from: UserId, initiation_date: Timestamp, sequence_number: u64) {
        if !self.pong_sequences.accept(&from, sequence_number) {
            debug!(user_id = ?from, sequence_number, "ignoring outdated pong");
            return;
        }

        let now = self.core.config.clock.now_millis();
        let ping_info = PingInfo {
            last_ping_date: now,
            round_trip_time: Some(round_trip_time(initiation_date, now)),
        };
        if let Err(e) = self.core.registry.update_ping_info(&from, ping_info) {
            self.core.report(e, ErrorReason::Internal);
            return;
        }

        if let Some(round) = &mut self.ping_round {
            round.on_pong(&from, initiation_date);
        }
        self.finish_ping_round_if_complete();
    }

    fn finish_ping_round_if_complete(&mut self) {
        if self.ping_round.as_ref().map(|round| round.is_complete()).unwrap_or(false) {
            if let Some(round) = self.ping_round.take() {
                self.finish_ping_round(round, Ok(()));
            }
        }
    }

    fn finish_ping_round(&mut self, round: PingRound, result: Result<(), PeerError>) {
        self.broadcast(HostPacket::PingInfo { ping_infos: self.core.registry.ping_infos() }, None);
        round.finish(result);
    }

    fn on_ping_timeout(&mut self, id: u64) {
        let round = match self.ping_round.take() {
            Some(round) if round.id == id => round,
            other => {
                self.ping_round = other;
                return;
            }
        };

        let unresponsive = round.unresponsive();
        warn!(?unresponsive, "users did not answer the ping in time - disconnecting them");
        for user_id in &unresponsive {
            if !self.core.is_own(user_id) && self.user_connections.contains_key(user_id) {
                self.disconnect_user(user_id, false);
            }
        }

        let timeout = self.core.config.timeout;
        self.finish_ping_round(round, Err(TimeoutError {
            operation: "ping".to_string(),
            timeout,
        }.into()));
    }

    fn close(&mut self) -> Result<(), PeerError> {
        if self.core.state() == ConnectionState::Disconnected {
            return Err(ConnectionError::NotOpen.into());
        }
        info!(user_id = ?self.core.user_id, "closing host");
        self.release_session();
        Ok(())
    }

    fn release_session(&mut self) {
        self.stop_ping();
        if let Some(accept_task) = self.accept_task.take() {
            accept_task.abort();
        }
        for (_, connection) in self.connections.drain() {
            connection.reader.abort();
            connection.connection.close();
        }
        self.user_connections.clear();
        for (_, relay) in self.relays.drain() {
            relay.timeout.abort();
        }
        self.kicked.clear();
        if let Some(round) = self.ping_round.take() {
            round.finish(Err(ConnectionError::Closed.into()));
        }

        self.core.fail_pending(ConnectionError::Closed.into());
        self.core.reset_registry();
        self.core.set_status(PeerStatus::disconnected());
        self.core.emit(PeerEvent::Disconnected);
    }

    fn unexpected(&self, packet_type: &str) {
        self.core.report(PeerError::InternalInconsistency(format!("host received {}", packet_type)), ErrorReason::Internal);
    }
}

impl <D: UserData> PeerRole<D> for HostActor<D> {
    type Command = HostCommand;

    fn core(&self) -> &PeerCore<D> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeerCore<D> {
        &mut self.core
    }

    fn send_client_packet(&mut self, packet: ClientPacket<D>) -> Result<(), PeerError> {
        if self.core.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotOpen.into());
        }
        let own = self.core.user_id.clone();
        self.handle_client_packet(own, packet);
        Ok(())
    }

    fn handle_role_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Open { listener, reply } => {
                let _ = reply.send(self.open(listener));
            }
            HostCommand::Incoming(opened) => self.on_incoming(opened),
            HostCommand::Connection { connection_id, event } => self.on_connection_event(connection_id, event),
            HostCommand::HandshakeTimeout(connection_id) => self.on_handshake_timeout(connection_id),
            HostCommand::RelayTimeout(serial_id) => self.on_relay_timeout(serial_id),
            HostCommand::Ping(reply) => self.ping(reply),
            HostCommand::PingTimeout(id) => self.on_ping_timeout(id),
            HostCommand::StopPing => self.stop_ping(),
            HostCommand::CloseConnection(user_id) => self.close_connection_to_client(user_id, false),
            HostCommand::Kick(user_id) => self.close_connection_to_client(user_id, true),
            HostCommand::Close(reply) => {
                let _ = reply.send(self.close());
            }
        }
    }

    fn shutdown(&mut self) {
        if self.core.state() != ConnectionState::Disconnected {
            self.release_session();
        }
    }

    fn on_welcome(&mut self, _users: Vec<UserInfo<D>>) {
        self.unexpected("WELCOME");
    }

    fn on_welcome_back(&mut self, _users: Vec<UserInfo<D>>, _user_id: UserId) {
        self.unexpected("WELCOME_BACK");
    }

    fn on_reconnect_failed(&mut self) {
        self.unexpected("RECONNECT_FAILED");
    }

    fn on_incompatible(&mut self, _host_versions: Versions) {
        self.unexpected("INCOMPATIBLE");
    }

    fn on_kicked(&mut self) {
        self.unexpected("KICK_USER for its own user");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use crate::group::users::User;
    use crate::test_util::group::{drain_events, settle, test_config, user_names, RecordedPacket, TestGroup};
    use crate::test_util::user::{MockUser, MockUserUpdate};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_open_and_close() {
        let network = crate::messaging::in_memory::InMemoryNetwork::new();
        let host = Host::new(Arc::new(test_config("1")), MockUser::new("Host"), network.transport());
        let mut events = host.subscribe();
        assert!(host.is_disconnected());

        let result = host.open().await.unwrap();
        assert_eq!(&result.user_id, host.user_id());
        assert!(host.is_connected());
        assert!(host.is_host());
        assert_eq!(host.status().peer_id, Some(result.peer_id.clone()));
        assert_eq!(host.host_connection_id(), Some(result.peer_id.clone()));
        assert_eq!(host.open().await, Err(ConnectionError::AlreadyOpen.into()));

        host.close().await.unwrap();
        assert!(host.is_disconnected());
        assert_eq!(host.close().await, Err(ConnectionError::NotOpen.into()));
        assert_eq!(drain_events(&mut events), vec![
            PeerEvent::Connected(result),
            PeerEvent::Disconnected,
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_join() {
        let group = TestGroup::start(3).await;

        assert_eq!(group.count_to_host("hello"), 3);
        assert_eq!(group.count_to_clients("welcome"), 3);
        // 0 + 1 + 2: the Host's own copy is handled in place, and a newcomer learns about
        //  earlier users through WELCOME
        assert_eq!(group.count_to_clients("user connected"), 3);

        let all = vec!["Client 1", "Client 2", "Client 3", "Host"];
        assert_eq!(user_names(&group.host).await, all);
        for client in &group.clients {
            assert!(client.is_connected());
            assert_eq!(client.host_connection_id(), Some(group.host_peer_id.clone()));
            assert_eq!(user_names(client).await, all);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_users_see_newcomer() {
        let mut group = TestGroup::start(1).await;
        let mut host_events = group.host.subscribe();
        let mut client_events = group.clients[0].subscribe();

        group.add_client(Arc::new(test_config("1"))).await;

        let newcomer = User {
            id: group.clients[1].user_id().clone(),
            data: MockUser::new("Client 2"),
        };
        assert_eq!(drain_events(&mut host_events), vec![PeerEvent::UserConnected(newcomer.clone())]);
        assert_eq!(drain_events(&mut client_events), vec![PeerEvent::UserConnected(newcomer)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_from_client_to_all() {
        let group = TestGroup::start(3).await;
        let host_chat = group.host.message::<String>("chat");
        let chats: Vec<_> = group.clients.iter()
            .map(|c| c.message::<String>("chat"))
            .collect();
        let mut subscriptions = vec![host_chat.subscribe()];
        subscriptions.extend(chats.iter().map(|c| c.subscribe()));
        settle().await;
        group.clear_history();

        let handle = chats[0].send(&"hi everybody".to_string()).unwrap();
        assert_eq!(handle.wait_for_host().await, Ok(()));
        assert_eq!(handle.wait_for_all().await, Ok(()));
        settle().await;

        assert_eq!(group.count_to_host("message"), 1);
        assert_eq!(group.count_to_clients("acknowledged by host"), 1);
        assert_eq!(group.count_to_clients("relayed message"), 3);
        assert_eq!(group.count_to_host("acknowledge"), 3);
        assert_eq!(group.count_to_clients("acknowledged by all"), 1);

        for subscription in &mut subscriptions {
            let received = subscription.try_recv().unwrap();
            assert_eq!(received.payload, "hi everybody");
            assert_eq!(&received.origin_user_id, group.clients[0].user_id());
            assert_eq!(&received.serial_id, handle.serial_id());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_packet_order() {
        let group = TestGroup::start(3).await;
        let chats: Vec<_> = group.clients.iter()
            .map(|c| c.message::<String>("chat"))
            .collect();
        let _host_chat = group.host.message::<String>("chat");
        settle().await;
        group.clear_history();

        let handle = chats[0].send(&"one after the other".to_string()).unwrap();
        assert_eq!(handle.wait_for_all().await, Ok(()));
        settle().await;

        let history = group.history();
        let packet_types: Vec<&str> = history.iter()
            .map(|frame| match &frame.packet {
                RecordedPacket::ToHost(packet) => packet.packet_type(),
                RecordedPacket::ToClient(packet) => packet.packet_type(),
            })
            .collect();
        assert_eq!(packet_types, vec![
            "message",
            "acknowledged by host",
            "relayed message", "relayed message", "relayed message",
            "acknowledge", "acknowledge", "acknowledge",
            "acknowledged by all",
        ]);

        let sender = group.clients[0].status().peer_id.unwrap();
        assert_eq!(history[0].from, sender);
        assert_eq!(history[1].to, sender);
        let relayed_to: FxHashSet<_> = history[2..5].iter()
            .map(|frame| frame.to.clone())
            .collect();
        assert_eq!(relayed_to.len(), 3);
        assert_eq!(history[8].to, sender);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_from_host() {
        let group = TestGroup::start(3).await;
        let chat = group.host.message::<String>("chat");
        let mut subscription = chat.subscribe();
        let client_chats: Vec<_> = group.clients.iter()
            .map(|c| c.message::<String>("chat"))
            .collect();
        settle().await;
        group.clear_history();

        let handle = chat.send(&"hello from the host".to_string()).unwrap();
        assert_eq!(handle.wait_for_all().await, Ok(()));
        settle().await;

        assert_eq!(group.count_to_host("message"), 0);
        assert_eq!(group.count_to_clients("relayed message"), 3);
        assert_eq!(group.count_to_host("acknowledge"), 3);
        assert_eq!(group.count_to_clients("acknowledged by all"), 0);

        assert_eq!(subscription.try_recv().unwrap().payload, "hello from the host");
        drop(client_chats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_targets() {
        let group = TestGroup::start(3).await;
        let chats: Vec<_> = group.clients.iter()
            .map(|c| c.message::<String>("chat"))
            .collect();
        let mut subscriptions: Vec<_> = chats.iter()
            .map(|c| c.subscribe())
            .collect();
        let mut host_subscription = group.host.message::<String>("chat").subscribe();
        settle().await;
        group.clear_history();

        let target = group.clients[1].user_id().clone();
        let handle = chats[0].send_to(&"psst".to_string(), vec![target, UserId::from("nobody")]).unwrap();
        assert_eq!(handle.wait_for_all().await, Ok(()));
        settle().await;

        assert_eq!(group.count_to_clients("relayed message"), 1);
        assert_eq!(group.count_to_host("acknowledge"), 1);
        assert!(subscriptions[0].try_recv().is_none());
        assert_eq!(subscriptions[1].try_recv().unwrap().payload, "psst");
        assert!(subscriptions[2].try_recv().is_none());
        assert!(host_subscription.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_nobody_is_acknowledged_right_away() {
        let group = TestGroup::start(1).await;
        let chat = group.clients[0].message::<String>("chat");
        group.clear_history();

        let handle = chat.send_to(&"anyone?".to_string(), vec![UserId::from("nobody")]).unwrap();
        assert_eq!(handle.wait_for_all().await, Ok(()));
        assert_eq!(group.count_to_clients("relayed message"), 0);
        assert_eq!(group.count_to_clients("acknowledged by all"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_serial_id_is_not_acknowledged() {
        let group = TestGroup::start(3).await;
        let chats: Vec<_> = group.clients.iter()
            .map(|c| c.message::<String>("chat"))
            .collect();
        let mut ignoring = chats[1].subscribe();
        let _host_chat = group.host.message::<String>("chat");
        settle().await;

        let handle = chats[0].send(&"hi".to_string()).unwrap();
        group.clients[1].ignore_serial_id(handle.serial_id().clone());

        assert_eq!(handle.wait_for_host().await, Ok(()));
        assert!(matches!(handle.wait_for_all().await, Err(PeerError::Timeout(_))));
        settle().await;

        assert!(ignoring.try_recv().is_none());
        assert_eq!(group.count_to_clients("relayed message"), 3);
        assert_eq!(group.count_to_host("acknowledge"), 2);
        assert_eq!(group.count_to_clients("acknowledged by all"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_is_given_up_after_timeout() {
        let group = TestGroup::start(1).await;
        let chat = group.clients[0].message::<String>("chat");
        let _host_chat = group.host.message::<String>("chat");

        let slow = User {
            id: UserId::from("slow"),
            data: MockUser::new("Slow"),
        };
        let mut raw = group.network.transport().connect(&group.host_peer_id).await.unwrap();
        let hello: ClientPacket<MockUser> = ClientPacket::Hello { user: slow.clone(), versions: Versions::new("1") };
        raw.connection.send(wire::encode(&hello).unwrap()).unwrap();
        settle().await;
        assert_eq!(user_names(&group.host).await, vec!["Client 1", "Host", "Slow"]);

        let mut host_events = group.host.subscribe();
        group.clear_history();

        let handle = chat.send(&"hi".to_string()).unwrap();
        assert_eq!(handle.wait_for_host().await, Ok(()));
        assert!(matches!(handle.wait_for_all().await, Err(PeerError::Timeout(_))));
        sleep(test_config("1").timeout).await;

        // a late acknowledgment, then the last pending target leaves
        let relayed = loop {
            match raw.events.try_recv() {
                Ok(ConnectionEvent::Received(frame)) => {
                    if let HostPacket::RelayedMessage { message } = wire::decode::<HostPacket<MockUser>>(&frame).unwrap() {
                        break message;
                    }
                }
                other => panic!("expected the relayed message, was {:?}", other),
            }
        };
        let acknowledge: ClientPacket<MockUser> = ClientPacket::Acknowledge { serial_id: relayed.serial_id };
        raw.connection.send(wire::encode(&acknowledge).unwrap()).unwrap();
        settle().await;
        raw.connection.close();
        settle().await;

        assert_eq!(group.count_to_clients("acknowledged by all"), 0);
        let host_events = drain_events(&mut host_events);
        assert!(host_events.contains(&PeerEvent::UserDisconnected(slow.id)));
        assert!(!host_events.iter().any(|event| matches!(event, PeerEvent::Error { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_of_unregistered_type_is_reported() {
        let group = TestGroup::start(2).await;
        let chat = group.clients[0].message::<String>("chat");
        let _host_chat = group.host.message::<String>("chat");
        let mut events = group.clients[1].subscribe();
        settle().await;

        let handle = chat.send(&"hi".to_string()).unwrap();
        // the message is acknowledged nonetheless
        assert_eq!(handle.wait_for_all().await, Ok(()));

        let events = drain_events(&mut events);
        assert!(matches!(events[0], PeerEvent::Message(_)));
        assert!(matches!(events[1], PeerEvent::Error { error: PeerError::InternalInconsistency(_), reason: ErrorReason::Internal }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping() {
        let group = TestGroup::start(3).await;
        let mut events = group.clients[0].subscribe();
        group.clear_history();

        group.host.ping().await.unwrap();
        settle().await;

        assert_eq!(group.count_to_clients("ping"), 3);
        assert_eq!(group.count_to_host("pong"), 3);
        assert_eq!(group.count_to_clients("ping info"), 3);

        let ping_infos = group.clients[0].ping_infos().await.unwrap();
        assert_eq!(ping_infos.len(), 4);
        assert!(ping_infos.iter().all(|info| info.round_trip_time.is_some()));
        assert_eq!(ping_infos, group.host.ping_infos().await.unwrap());

        let events = drain_events(&mut events);
        assert_eq!(events, vec![PeerEvent::PingInfo(ping_infos)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_pings_share_a_round() {
        let group = TestGroup::start(2).await;
        group.clear_history();

        let (a, b) = tokio::join!(group.host.ping(), group.host.ping());
        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(()));
        settle().await;

        assert_eq!(group.count_to_clients("ping"), 2);
        assert_eq!(group.count_to_host("pong"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_disconnects_unresponsive_users() {
        let group = TestGroup::start(3).await;
        let unresponsive = &group.clients[2];
        let unresponsive_id = unresponsive.user_id().clone();
        group.network.set_unresponsive(&unresponsive.status().peer_id.unwrap());
        let mut events = group.clients[0].subscribe();

        let result = group.host.ping().await;
        assert!(matches!(result, Err(PeerError::Timeout(_))));
        settle().await;

        assert_eq!(user_names(&group.host).await, vec!["Client 1", "Client 2", "Host"]);
        assert_eq!(user_names(&group.clients[0]).await, vec!["Client 1", "Client 2", "Host"]);
        assert!(unresponsive.is_disconnected());

        let events = drain_events(&mut events);
        assert_eq!(events[0], PeerEvent::UserDisconnected(unresponsive_id));
        assert!(matches!(events[1], PeerEvent::PingInfo(ref infos) if infos.len() == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_of_closed_host() {
        let network = crate::messaging::in_memory::InMemoryNetwork::new();
        let host = Host::new(Arc::new(test_config("1")), MockUser::new("Host"), network.transport());
        assert_eq!(host.ping().await, Err(ConnectionError::NotOpen.into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ping() {
        let mut config = test_config("1");
        config.ping_interval = Some(Duration::from_secs(1));
        let group = TestGroup::start_with_config(config, 1).await;
        group.clear_history();

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(group.count_to_clients("ping"), 2);

        group.host.stop_ping();
        sleep(Duration::from_secs(3)).await;
        assert_eq!(group.count_to_clients("ping"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_user() {
        let group = TestGroup::start(3).await;
        let kicked = group.clients[1].user_id().clone();
        let mut kicked_events = group.clients[1].subscribe();
        let mut other_events = group.clients[0].subscribe();
        let mut host_events = group.host.subscribe();

        group.host.kick_user(&kicked).unwrap();
        settle().await;

        assert!(group.clients[1].is_disconnected());
        assert_eq!(drain_events(&mut kicked_events), vec![
            PeerEvent::UserKicked(kicked.clone()),
            PeerEvent::Disconnected,
        ]);
        let expected = vec![
            PeerEvent::UserKicked(kicked.clone()),
            PeerEvent::UserDisconnected(kicked.clone()),
        ];
        assert_eq!(drain_events(&mut other_events), expected);
        assert_eq!(drain_events(&mut host_events), expected);
        assert_eq!(group.count_to_clients("kick user"), 3);
        assert_eq!(user_names(&group.host).await, vec!["Client 1", "Client 3", "Host"]);

        let result = group.clients[1].reconnect(&group.host_peer_id).await;
        assert_eq!(result, Err(ConnectionError::ReconnectFailed(kicked).into()));
        assert!(group.clients[1].is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_user_can_not_be_disconnected() {
        let group = TestGroup::start(1).await;
        let own = group.host.user_id().clone();

        assert_eq!(group.host.kick_user(&own), Err(ConnectionError::SelfReference(own.clone()).into()));
        assert_eq!(group.host.close_connection_to_client(&own), Err(ConnectionError::SelfReference(own).into()));
        settle().await;
        assert!(group.host.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_unknown_connection_is_reported() {
        let group = TestGroup::start(1).await;
        let mut events = group.host.subscribe();

        group.host.close_connection_to_client(&UserId::from("nobody")).unwrap();
        settle().await;

        assert!(matches!(drain_events(&mut events)[..], [PeerEvent::Error { error: PeerError::InternalInconsistency(_), reason: ErrorReason::Internal }]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_connection_and_reconnect() {
        let group = TestGroup::start(2).await;
        let client = &group.clients[0];
        let user_id = client.user_id().clone();
        let mut events = group.clients[1].subscribe();

        group.host.close_connection_to_client(&user_id).unwrap();
        settle().await;
        assert!(client.is_disconnected());
        assert_eq!(user_names(&group.host).await, vec!["Client 2", "Host"]);
        assert_eq!(user_names(client).await, vec!["Client 1"]);

        let result = client.reconnect(&group.host_peer_id).await.unwrap();
        assert_eq!(result.user_id, user_id);
        settle().await;

        let all = vec!["Client 1", "Client 2", "Host"];
        assert_eq!(user_names(&group.host).await, all);
        assert_eq!(user_names(client).await, all);
        assert_eq!(user_names(&group.clients[1]).await, all);
        assert_eq!(drain_events(&mut events), vec![
            PeerEvent::UserDisconnected(user_id.clone()),
            PeerEvent::UserReconnected(user_id),
        ]);
        assert_eq!(group.count_to_host("hello again"), 1);
        assert_eq!(group.count_to_clients("welcome back"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_takes_over_live_session() {
        let group = TestGroup::start(2).await;
        let user_id = group.clients[0].user_id().clone();
        let mut events = group.clients[1].subscribe();

        let mut raw = group.network.transport().connect(&group.host_peer_id).await.unwrap();
        let hello_again: ClientPacket<MockUser> = ClientPacket::HelloAgain {
            user_id: user_id.clone(),
            versions: Versions::new("1"),
        };
        raw.connection.send(wire::encode(&hello_again).unwrap()).unwrap();
        settle().await;

        match raw.events.try_recv() {
            Ok(ConnectionEvent::Received(frame)) => match wire::decode::<HostPacket<MockUser>>(&frame).unwrap() {
                HostPacket::WelcomeBack { users, user_id: welcomed } => {
                    assert_eq!(welcomed, user_id);
                    assert_eq!(users.len(), 3);
                }
                other => panic!("expected WELCOME_BACK, was {:?}", other),
            },
            other => panic!("expected a frame, was {:?}", other),
        }

        // the previous connection is dropped without telling anybody
        assert!(group.clients[0].is_disconnected());
        assert_eq!(user_names(&group.host).await, vec!["Client 1", "Client 2", "Host"]);
        assert_eq!(group.count_to_clients("user reconnected"), 0);
        assert_eq!(group.count_to_clients("user disconnected"), 0);
        assert!(drain_events(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_before_handshake_drops_connection() {
        let group = TestGroup::start(0).await;
        let mut events = group.host.subscribe();

        let mut raw = group.network.transport().connect(&group.host_peer_id).await.unwrap();
        raw.connection.send(wire::encode(&ClientPacket::<MockUser>::Disconnect).unwrap()).unwrap();
        settle().await;

        assert_eq!(raw.events.try_recv(), Ok(ConnectionEvent::Closed));
        assert!(matches!(drain_events(&mut events)[..], [PeerEvent::Error { reason: ErrorReason::Internal, .. }]));
        assert_eq!(user_names(&group.host).await, vec!["Host"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_without_handshake_is_dropped() {
        let group = TestGroup::start(1).await;
        let mut raw = group.network.transport().connect(&group.host_peer_id).await.unwrap();
        settle().await;
        assert!(raw.events.try_recv().is_err());

        sleep(test_config("1").timeout).await;
        settle().await;

        assert_eq!(raw.events.try_recv(), Ok(ConnectionEvent::Closed));
        assert!(group.clients[0].is_connected());
        assert_eq!(user_names(&group.host).await, vec!["Client 1", "Host"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_client_is_rejected() {
        let group = TestGroup::start(1).await;
        let client = group.new_client(test_config("2"), "Client X");

        match client.open(&group.host_peer_id).await {
            Err(PeerError::Incompatibility(e)) => {
                assert_eq!(e.incompatible_versions, vec![crate::group::versions::IncompatibleVersion::ApplicationProtocolVersion]);
                assert_eq!(e.host_versions, Versions::new("1"));
                assert_eq!(e.local_versions, Versions::new("2"));
            }
            other => panic!("expected incompatibility, was {:?}", other),
        }
        assert!(client.is_disconnected());
        settle().await;

        assert_eq!(group.count_to_clients("incompatible"), 1);
        assert_eq!(user_names(&group.host).await, vec!["Client 1", "Host"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_user() {
        let group = TestGroup::start(2).await;
        let mut events = group.clients[1].subscribe();
        group.clear_history();

        group.clients[0].update_user(MockUserUpdate::name("Mr. Renamed")).await.unwrap();
        settle().await;

        assert_eq!(group.count_to_host("update user"), 1);
        assert_eq!(group.count_to_clients("update user"), 2);
        assert_eq!(user_names(&group.host).await, vec!["Client 2", "Host", "Mr. Renamed"]);
        assert_eq!(user_names(&group.clients[1]).await, vec!["Client 2", "Host", "Mr. Renamed"]);
        assert_eq!(drain_events(&mut events), vec![PeerEvent::UserUpdated(User {
            id: group.clients[0].user_id().clone(),
            data: MockUser::new("Mr. Renamed"),
        })]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_host_user() {
        let group = TestGroup::start(2).await;
        group.clear_history();

        group.host.update_user(MockUserUpdate::name("Mrs. Host")).await.unwrap();
        settle().await;

        assert_eq!(group.count_to_clients("update user"), 2);
        assert_eq!(group.host.own_user().await.unwrap().unwrap().data, MockUser::new("Mrs. Host"));
        assert_eq!(user_names(&group.clients[0]).await, vec!["Client 1", "Client 2", "Mrs. Host"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_leaves() {
        let group = TestGroup::start(2).await;
        let leaving = group.clients[0].user_id().clone();
        let mut events = group.clients[1].subscribe();

        group.clients[0].close().await.unwrap();
        settle().await;

        assert_eq!(group.count_to_host("disconnect"), 1);
        assert_eq!(user_names(&group.host).await, vec!["Client 2", "Host"]);
        assert_eq!(drain_events(&mut events), vec![PeerEvent::UserDisconnected(leaving)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_completes_when_pending_target_leaves() {
        let group = TestGroup::start(2).await;
        let chat = group.clients[0].message::<String>("chat");
        let _host_chat = group.host.message::<String>("chat");
        let _other_chat = group.clients[1].message::<String>("chat");
        group.network.set_unresponsive(&group.clients[1].status().peer_id.unwrap());
        settle().await;

        let handle = chat.send(&"hi".to_string()).unwrap();
        assert_eq!(handle.wait_for_host().await, Ok(()));
        settle().await;

        group.host.close_connection_to_client(group.clients[1].user_id()).unwrap();
        assert_eq!(handle.wait_for_all().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_disconnects_everybody() {
        let group = TestGroup::start(2).await;
        let chat = group.clients[0].message::<String>("chat");
        let _host_chat = group.host.message::<String>("chat");
        group.network.set_unresponsive(&group.clients[1].status().peer_id.unwrap());
        let mut events = group.clients[0].subscribe();
        settle().await;

        let handle = chat.send(&"hi".to_string()).unwrap();
        assert_eq!(handle.wait_for_host().await, Ok(()));

        group.host.close().await.unwrap();
        settle().await;

        assert_eq!(handle.wait_for_all().await, Err(ConnectionError::Closed.into()));
        assert!(group.host.is_disconnected());
        assert_eq!(user_names(&group.host).await, vec!["Host"]);
        for client in &group.clients {
            assert!(client.is_disconnected());
        }
        assert_eq!(drain_events(&mut events).last(), Some(&PeerEvent::Disconnected));
    }
}
