use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::group::error::{ConnectionError, ErrorReason, IncompatibilityError, PeerError, TimeoutError};
use crate::group::ids::UserId;
use crate::group::packets::{ClientPacket, HostPacket};
use crate::group::peer::{forward_connection_events, run_peer, spawn_timer, ConnectionState, Peer, PeerCore, PeerHandle, PeerRole, PeerStatus};
use crate::group::peer_config::PeerConfig;
use crate::group::peer_events::{OpenResult, PeerEvent};
use crate::group::users::{UserData, UserInfo};
use crate::group::versions::Versions;
use crate::messaging::peer_id::PeerId;
use crate::messaging::transport::{Connection, ConnectionEvent, OpenedConnection, Transport};
use crate::messaging::wire;

pub(crate) enum ClientCommand {
    Attach {
        opened: OpenedConnection,
        host_peer_id: PeerId,
        reconnect: bool,
        reply: oneshot::Sender<Result<OpenResult, PeerError>>,
    },
    Connection {
        generation: u64,
        event: ConnectionEvent,
    },
    HandshakeTimeout(u64),
    Close(oneshot::Sender<Result<(), PeerError>>),
}

/// A peer that participates in a group through its connection to the group's Host
pub struct Client<D: UserData> {
    handle: PeerHandle<D>,
    commands: mpsc::UnboundedSender<ClientCommand>,
    transport: Arc<dyn Transport>,
}

impl <D: UserData> Client<D> {
    pub fn new(config: Arc<PeerConfig>, user_data: D, transport: Arc<dyn Transport>) -> Client<D> {
        let (core, handle, peer_commands) = PeerCore::new(user_data, config);
        let (commands, role_commands) = mpsc::unbounded_channel();

        let actor = ClientActor::new(core, commands.downgrade());
        tokio::spawn(run_peer(actor, peer_commands, role_commands));

        Client {
            handle,
            commands,
            transport,
        }
    }

    /// Joins the group hosted at `host_peer_id` as a new user
    pub async fn open(&self, host_peer_id: &PeerId) -> Result<OpenResult, PeerError> {
        self.connect(host_peer_id, false).await
    }

    /// Rejoins the group under this Client's existing user id, e.g. after the connection to the
    ///  Host was lost. The Host refuses if it does not know the user (anymore).
    pub async fn reconnect(&self, host_peer_id: &PeerId) -> Result<OpenResult, PeerError> {
        self.connect(host_peer_id, true).await
    }

    async fn connect(&self, host_peer_id: &PeerId, reconnect: bool) -> Result<OpenResult, PeerError> {
        if !self.is_disconnected() {
            return Err(ConnectionError::AlreadyOpen.into());
        }
        let opened = self.transport.connect(host_peer_id).await
            .map_err(ConnectionError::from)?;

        let (reply, receiver) = oneshot::channel();
        self.commands.send(ClientCommand::Attach {
            opened,
            host_peer_id: host_peer_id.clone(),
            reconnect,
            reply,
        })
            .map_err(|_| ConnectionError::Closed)?;
        receiver.await
            .map_err(|_| ConnectionError::Closed)?
    }

    /// Leaves the group. Pending operations fail with [ConnectionError::Closed].
    pub async fn close(&self) -> Result<(), PeerError> {
        let (reply, receiver) = oneshot::channel();
        self.commands.send(ClientCommand::Close(reply))
            .map_err(|_| ConnectionError::Closed)?;
        receiver.await
            .map_err(|_| ConnectionError::Closed)?
    }
}

impl <D: UserData> Peer<D> for Client<D> {
    fn handle(&self) -> &PeerHandle<D> {
        &self.handle
    }

    fn is_host(&self) -> bool {
        false
    }
}

/// Creates a Client and connects it to a Host
pub async fn create_client<D: UserData>(config: Arc<PeerConfig>, user_data: D, transport: Arc<dyn Transport>, host_peer_id: &PeerId) -> Result<Client<D>, PeerError> {
    let client = Client::new(config, user_data, transport);
    client.open(host_peer_id).await?;
    Ok(client)
}

struct HostLink {
    connection: Arc<dyn Connection>,
    reader: JoinHandle<()>,
    local_peer_id: PeerId,
    host_peer_id: PeerId,
    /// Distinguishes events of this connection from those of earlier ones
    generation: u64,
}

struct PendingOpen {
    reply: oneshot::Sender<Result<OpenResult, PeerError>>,
    timeout: JoinHandle<()>,
}

struct ClientActor<D: UserData> {
    core: PeerCore<D>,
    commands: mpsc::WeakUnboundedSender<ClientCommand>,
    link: Option<HostLink>,
    pending_open: Option<PendingOpen>,
    generation: u64,
}

impl <D: UserData> ClientActor<D> {
    fn new(core: PeerCore<D>, commands: mpsc::WeakUnboundedSender<ClientCommand>) -> ClientActor<D> {
        ClientActor {
            core,
            commands,
            link: None,
            pending_open: None,
            generation: 0,
        }
    }

    #[instrument(name="client_attach", skip_all, fields(user_id=?self.core.user_id, host_peer_id=?host_peer_id, reconnect=reconnect))]
    fn attach(&mut self, opened: OpenedConnection, host_peer_id: PeerId, reconnect: bool, reply: oneshot::Sender<Result<OpenResult, PeerError>>) {
        if self.core.state() != ConnectionState::Disconnected {
            opened.connection.close();
            let _ = reply.send(Err(ConnectionError::AlreadyOpen.into()));
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let OpenedConnection { local_peer_id, connection, events } = opened;
        debug!(?local_peer_id, "connected to host - starting handshake");

        let reader = tokio::spawn(forward_connection_events(
            events,
            self.commands.clone(),
            move |event| ClientCommand::Connection { generation, event },
        ));
        self.link = Some(HostLink {
            connection,
            reader,
            local_peer_id: local_peer_id.clone(),
            host_peer_id: host_peer_id.clone(),
            generation,
        });

        self.core.set_status(PeerStatus {
            state: ConnectionState::Connecting,
            peer_id: Some(local_peer_id),
            host_peer_id: Some(host_peer_id),
        });
        let timeout = spawn_timer(self.commands.clone(), self.core.config.timeout, ClientCommand::HandshakeTimeout(generation));
        self.pending_open = Some(PendingOpen { reply, timeout });

        let versions = self.core.versions.clone();
        let packet = if reconnect {
            ClientPacket::HelloAgain { user_id: self.core.user_id.clone(), versions }
        }
        else {
            match self.core.own_user() {
                Some(user) => ClientPacket::Hello { user, versions },
                None => {
                    self.end_session(PeerError::InternalInconsistency("own user is not registered".to_string()));
                    return;
                }
            }
        };
        if let Err(e) = self.send_to_host(&packet) {
            self.end_session(e);
        }
    }

    fn send_to_host(&self, packet: &ClientPacket<D>) -> Result<(), PeerError> {
        let link = match &self.link {
            Some(link) => link,
            None => return Err(ConnectionError::NotOpen.into()),
        };
        let frame = wire::encode(packet)?;
        link.connection.send(frame)
            .map_err(ConnectionError::from)?;
        Ok(())
    }

    fn on_connection_event(&mut self, generation: u64, event: ConnectionEvent) {
        if self.link.as_ref().map(|link| link.generation) != Some(generation) {
            trace!(generation, "event of an earlier connection");
            return;
        }

        match event {
            ConnectionEvent::Received(frame) => match wire::decode::<HostPacket<D>>(&frame) {
                Ok(packet) => self.handle_host_packet(packet),
                Err(e) => self.core.report(e.into(), ErrorReason::Other),
            },
            ConnectionEvent::Closed => {
                info!(user_id = ?self.core.user_id, "host closed the connection");
                self.end_session(ConnectionError::Closed.into());
            }
            ConnectionEvent::Error(e) => {
                self.core.report(ConnectionError::Transport(e).into(), ErrorReason::Other);
                self.end_session(ConnectionError::Closed.into());
            }
        }
    }

    fn on_handshake_timeout(&mut self, generation: u64) {
        let is_current = self.link.as_ref().map(|link| link.generation) == Some(generation);
        if is_current && self.pending_open.is_some() {
            let timeout = self.core.config.timeout;
            warn!(user_id = ?self.core.user_id, "host did not answer the handshake within {:?}", timeout);
            self.end_session(TimeoutError {
                operation: "open".to_string(),
                timeout,
            }.into());
        }
    }

    /// The handshake succeeded: the registry holds the Host's view of the group
    fn established(&mut self) {
        let (pending_open, link) = match (self.pending_open.take(), &self.link) {
            (Some(pending_open), Some(link)) => (pending_open, link),
            _ => {
                self.core.report(PeerError::InternalInconsistency("handshake completed without a pending open".to_string()), ErrorReason::Internal);
                return;
            }
        };
        pending_open.timeout.abort();

        let result = OpenResult {
            peer_id: link.local_peer_id.clone(),
            user_id: self.core.user_id.clone(),
        };
        self.core.set_status(PeerStatus {
            state: ConnectionState::Connected,
            peer_id: Some(link.local_peer_id.clone()),
            host_peer_id: Some(link.host_peer_id.clone()),
        });
        info!(user_id = ?self.core.user_id, num_users = self.core.registry.count(), "joined the group");

        let _ = pending_open.reply.send(Ok(result.clone()));
        self.core.emit(PeerEvent::Connected(result));
    }

    /// Tears down the connection to the Host. A pending open fails with `error`, and so does
    ///  everything that waits for the Host.
    fn end_session(&mut self, error: PeerError) {
        let was_connected = self.core.state() == ConnectionState::Connected;

        if let Some(link) = self.link.take() {
            link.reader.abort();
            link.connection.close();
        }
        if let Some(pending_open) = self.pending_open.take() {
            pending_open.timeout.abort();
            let _ = pending_open.reply.send(Err(error.clone()));
        }

        self.core.fail_pending(error);
        self.core.reset_registry();
        self.core.set_status(PeerStatus::disconnected());
        if was_connected {
            self.core.emit(PeerEvent::Disconnected);
        }
    }

    fn close(&mut self) -> Result<(), PeerError> {
        if self.core.state() == ConnectionState::Disconnected {
            return Err(ConnectionError::NotOpen.into());
        }
        info!(user_id = ?self.core.user_id, "leaving the group");
        if let Err(e) = self.send_to_host(&ClientPacket::Disconnect) {
            debug!("could not say goodbye to the host: {}", e);
        }
        self.end_session(ConnectionError::Closed.into());
        Ok(())
    }

    fn unexpected(&self, packet_type: &str) {
        self.core.report(PeerError::InternalInconsistency(format!("unexpected {} outside of a handshake", packet_type)), ErrorReason::Internal);
    }
}

impl <D: UserData> PeerRole<D> for ClientActor<D> {
    type Command = ClientCommand;

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
        self.send_to_host(&packet)
    }

    fn handle_role_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Attach { opened, host_peer_id, reconnect, reply } => self.attach(opened, host_peer_id, reconnect, reply),
            ClientCommand::Connection { generation, event } => self.on_connection_event(generation, event),
            ClientCommand::HandshakeTimeout(generation) => self.on_handshake_timeout(generation),
            ClientCommand::Close(reply) => {
                let _ = reply.send(self.close());
            }
        }
    }

    fn shutdown(&mut self) {
        if self.core.state() != ConnectionState::Disconnected {
            let _ = self.close();
        }
    }

    fn on_welcome(&mut self, users: Vec<UserInfo<D>>) {
        if self.pending_open.is_none() {
            self.unexpected("WELCOME");
            return;
        }
        self.core.registry.initialize(users);
        self.established();
    }

    fn on_welcome_back(&mut self, users: Vec<UserInfo<D>>, user_id: UserId) {
        if self.pending_open.is_none() {
            self.unexpected("WELCOME_BACK");
            return;
        }
        if !self.core.is_own(&user_id) {
            self.end_session(PeerError::InternalInconsistency(format!("host welcomed back {:?} instead of this peer's user", user_id)));
            return;
        }
        self.core.registry.clear();
        self.core.registry.initialize(users);
        self.established();
    }

    fn on_reconnect_failed(&mut self) {
        if self.pending_open.is_none() {
            self.unexpected("RECONNECT_FAILED");
            return;
        }
        info!(user_id = ?self.core.user_id, "host refused the reconnect");
        self.end_session(ConnectionError::ReconnectFailed(self.core.user_id.clone()).into());
    }

    fn on_incompatible(&mut self, host_versions: Versions) {
        let error: PeerError = IncompatibilityError {
            incompatible_versions: self.core.versions.incompatibilities(&host_versions),
            local_versions: self.core.versions.clone(),
            host_versions,
        }.into();

        if self.pending_open.is_none() {
            // the session is over all the same
            self.core.report(error.clone(), ErrorReason::Incompatible);
        }
        self.end_session(error);
    }

    fn on_kicked(&mut self) {
        info!(user_id = ?self.core.user_id, "kicked by the host");
        self.core.emit(PeerEvent::UserKicked(self.core.user_id.clone()));
        self.end_session(ConnectionError::Closed.into());
    }
}
