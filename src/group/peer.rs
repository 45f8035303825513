use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

use crate::group::acknowledgment::{AckCompletion, AcknowledgmentTracker};
use crate::group::error::{ConnectionError, ErrorReason, PeerError};
use crate::group::ids::{SerialId, UserId};
use crate::group::message::{Message, MessageFactory};
use crate::group::packets::{ClientPacket, HostPacket};
use crate::group::peer_config::PeerConfig;
use crate::group::peer_events::{PeerEvent, PeerEventNotifier};
use crate::group::users::{PingInfoEntry, User, UserData, UserInfo, UserRegistry};
use crate::group::versions::Versions;
use crate::messaging::peer_id::PeerId;
use crate::messaging::transport::ConnectionEvent;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerStatus {
    pub state: ConnectionState,
    /// This peer's own transport address while it is open
    pub peer_id: Option<PeerId>,
    /// The Host's transport address; for a Host, this is its own address
    pub host_peer_id: Option<PeerId>,
}

impl PeerStatus {
    pub fn disconnected() -> PeerStatus {
        PeerStatus {
            state: ConnectionState::Disconnected,
            peer_id: None,
            host_peer_id: None,
        }
    }
}

/// Requests that both roles handle the same way. They are processed strictly in the order they
///  were posted, and before any pending role-specific command.
pub(crate) enum PeerCommand<D: UserData> {
    Send {
        message: Message,
        targets: Option<Vec<UserId>>,
        completion: AckCompletion,
    },
    AckTimeout(SerialId),
    RegisterMessageType(String),
    Subscribe {
        message_type: String,
        subscriber: mpsc::UnboundedSender<Message>,
    },
    IgnoreSerialId(SerialId),
    UpdateUser {
        update: D::Update,
        reply: oneshot::Sender<Result<(), PeerError>>,
    },
    Users(oneshot::Sender<Vec<User<D>>>),
    UserInfos(oneshot::Sender<Vec<UserInfo<D>>>),
    PingInfos(oneshot::Sender<Vec<PingInfoEntry>>),
    OwnUser(oneshot::Sender<Option<User<D>>>),
}

/// The part of a peer's API that is the same for Host and Client. All state lives in the peer's
///  actor task, this is just a set of channels to talk to it.
pub struct PeerHandle<D: UserData> {
    pub(crate) user_id: UserId,
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) commands: mpsc::UnboundedSender<PeerCommand<D>>,
    pub(crate) events: Arc<PeerEventNotifier<D>>,
    pub(crate) status: watch::Receiver<PeerStatus>,
}

impl <D: UserData> Clone for PeerHandle<D> {
    fn clone(&self) -> Self {
        PeerHandle {
            user_id: self.user_id.clone(),
            config: self.config.clone(),
            commands: self.commands.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
        }
    }
}

impl <D: UserData> PeerHandle<D> {
    async fn query<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> PeerCommand<D>) -> Result<T, PeerError> {
        let (reply, receiver) = oneshot::channel();
        self.commands.send(command(reply))
            .map_err(|_| ConnectionError::Closed)?;
        receiver.await
            .map_err(|_| ConnectionError::Closed.into())
    }

    pub(crate) async fn update_user(&self, update: D::Update) -> Result<(), PeerError> {
        self.query(|reply| PeerCommand::UpdateUser { update, reply }).await?
    }

    /// Waits until the peer reaches the given state, e.g. a Client being disconnected by its Host
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), PeerError> {
        let mut status = self.status.clone();
        status.wait_for(|s| s.state == state).await
            .map(|_| ())
            .map_err(|_| ConnectionError::Closed.into())
    }
}

/// API shared by [crate::group::host::Host] and [crate::group::client::Client]
#[async_trait]
pub trait Peer<D: UserData>: Send + Sync {
    fn handle(&self) -> &PeerHandle<D>;

    fn is_host(&self) -> bool;

    fn is_client(&self) -> bool {
        !self.is_host()
    }

    fn user_id(&self) -> &UserId {
        &self.handle().user_id
    }

    fn config(&self) -> &PeerConfig {
        &self.handle().config
    }

    fn status(&self) -> PeerStatus {
        self.handle().status.borrow().clone()
    }

    fn is_connected(&self) -> bool {
        self.status().state == ConnectionState::Connected
    }

    fn is_connecting(&self) -> bool {
        self.status().state == ConnectionState::Connecting
    }

    fn is_disconnected(&self) -> bool {
        self.status().state == ConnectionState::Disconnected
    }

    /// The Host's peer id while connected (or connecting)
    fn host_connection_id(&self) -> Option<PeerId> {
        self.status().host_peer_id
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent<D>> {
        self.handle().events.subscribe()
    }

    fn message<P: Serialize + DeserializeOwned>(&self, message_type: &str) -> MessageFactory<D, P> where Self: Sized {
        MessageFactory::new(self.handle().clone(), message_type)
    }

    /// From now on, relays and acknowledgments for this serial id are dropped
    fn ignore_serial_id(&self, serial_id: SerialId) {
        let _ = self.handle().commands.send(PeerCommand::IgnoreSerialId(serial_id));
    }

    async fn users(&self) -> Result<Vec<User<D>>, PeerError> {
        self.handle().query(PeerCommand::Users).await
    }

    async fn user_infos(&self) -> Result<Vec<UserInfo<D>>, PeerError> {
        self.handle().query(PeerCommand::UserInfos).await
    }

    async fn ping_infos(&self) -> Result<Vec<PingInfoEntry>, PeerError> {
        self.handle().query(PeerCommand::PingInfos).await
    }

    async fn own_user(&self) -> Result<Option<User<D>>, PeerError> {
        self.handle().query(PeerCommand::OwnUser).await
    }

    /// Resolves once the Host's broadcast of the update was applied locally
    async fn update_user(&self, update: D::Update) -> Result<(), PeerError> {
        self.handle().update_user(update).await
    }
}

/// State and behavior that the Host and Client actors share
pub(crate) struct PeerCore<D: UserData> {
    pub user_id: UserId,
    pub config: Arc<PeerConfig>,
    pub versions: Versions,
    pub registry: UserRegistry<D>,
    pub acks: AcknowledgmentTracker,
    events: Arc<PeerEventNotifier<D>>,
    status: watch::Sender<PeerStatus>,
    message_types: FxHashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    ignored_serial_ids: FxHashSet<SerialId>,
    update_waiters: VecDeque<oneshot::Sender<Result<(), PeerError>>>,
    pong_sequence_number: u64,
    commands: mpsc::WeakUnboundedSender<PeerCommand<D>>,
}

impl <D: UserData> PeerCore<D> {
    pub fn new(user_data: D, config: Arc<PeerConfig>) -> (PeerCore<D>, PeerHandle<D>, mpsc::UnboundedReceiver<PeerCommand<D>>) {
        let user_id = UserId::generate();
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let (status, status_receiver) = watch::channel(PeerStatus::disconnected());
        let events = Arc::new(PeerEventNotifier::new(config.event_channel_capacity));

        let mut registry = UserRegistry::new(config.clock.clone(), config.departed_user_capacity);
        registry.add_user(User {
            id: user_id.clone(),
            data: user_data,
        });

        let core = PeerCore {
            user_id: user_id.clone(),
            versions: Versions::new(&config.application_protocol_version),
            config: config.clone(),
            registry,
            acks: AcknowledgmentTracker::new(),
            events: events.clone(),
            status,
            message_types: Default::default(),
            ignored_serial_ids: Default::default(),
            update_waiters: Default::default(),
            pong_sequence_number: 0,
            commands: commands.downgrade(),
        };
        let handle = PeerHandle {
            user_id,
            config,
            commands,
            events,
            status: status_receiver,
        };
        (core, handle, command_receiver)
    }

    pub fn is_own(&self, user_id: &UserId) -> bool {
        user_id == &self.user_id
    }

    pub fn own_user(&self) -> Option<User<D>> {
        self.registry.get_user(&self.user_id).cloned()
    }

    /// Drops every other user, e.g. when the peer closes
    pub fn reset_registry(&mut self) {
        let own_user = self.own_user();
        self.registry.clear();
        if let Some(own_user) = own_user {
            self.registry.add_user(own_user);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn set_status(&self, status: PeerStatus) {
        debug!(user_id = ?self.user_id, ?status, "status change");
        self.status.send_replace(status);
    }

    pub fn emit(&self, event: PeerEvent<D>) {
        self.events.send_event(event);
    }

    pub fn report(&self, error: PeerError, reason: ErrorReason) {
        match reason {
            ErrorReason::Internal => error!(user_id = ?self.user_id, "internal inconsistency: {}", error),
            _ => warn!(user_id = ?self.user_id, ?reason, "{}", error),
        }
        self.emit(PeerEvent::Error { error, reason });
    }

    pub fn is_ignored(&self, serial_id: &SerialId) -> bool {
        self.ignored_serial_ids.contains(serial_id)
    }

    pub fn ignore_serial_id(&mut self, serial_id: SerialId) {
        debug!(?serial_id, "ignoring serial id");
        self.ignored_serial_ids.insert(serial_id);
    }

    pub fn next_pong_sequence_number(&mut self) -> u64 {
        self.pong_sequence_number += 1;
        self.pong_sequence_number
    }

    fn register_message_type(&mut self, message_type: String) {
        self.message_types.entry(message_type)
            .or_default();
    }

    fn subscribe(&mut self, message_type: String, subscriber: mpsc::UnboundedSender<Message>) {
        self.message_types.entry(message_type)
            .or_default()
            .push(subscriber);
    }

    fn dispatch(&mut self, message: Message) -> Result<(), PeerError> {
        match self.message_types.get_mut(&message.message_type) {
            Some(subscribers) => {
                subscribers.retain(|s| s.send(message.clone()).is_ok());
                Ok(())
            }
            None => Err(PeerError::InternalInconsistency(format!("received message of unregistered type {:?}", message.message_type))),
        }
    }

    fn spawn_ack_timeout(&self, serial_id: SerialId) -> JoinHandle<()> {
        spawn_timer(self.commands.clone(), self.config.timeout, PeerCommand::AckTimeout(serial_id))
    }

    fn own_update_applied(&mut self) {
        match self.update_waiters.pop_front() {
            Some(reply) => { let _ = reply.send(Ok(())); }
            None => trace!("update of own user without a waiter"),
        }
    }

    /// Fails everything that waits for the Host, used when the session ends
    pub fn fail_pending(&mut self, error: PeerError) {
        self.acks.reject_all(error.clone());
        for reply in self.update_waiters.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }
    }
}

/// Posts a command to an actor's mailbox after a delay, unless the actor is gone by then
pub(crate) fn spawn_timer<C: Send + 'static>(commands: mpsc::WeakUnboundedSender<C>, after: Duration, command: C) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(after).await;
        if let Some(commands) = commands.upgrade() {
            let _ = commands.send(command);
        }
    })
}

/// Forwards a connection's events into an actor's mailbox. The forwarding ends after the first
///  event that terminates the connection; a stream that just ends is reported as closed.
pub(crate) async fn forward_connection_events<C: Send + 'static>(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    commands: mpsc::WeakUnboundedSender<C>,
    to_command: impl Fn(ConnectionEvent) -> C + Send + 'static,
) {
    let mut terminated = false;
    while !terminated {
        let event = events.recv().await
            .unwrap_or(ConnectionEvent::Closed);
        terminated = !matches!(event, ConnectionEvent::Received(_));

        match commands.upgrade() {
            Some(commands) => {
                if commands.send(to_command(event)).is_err() {
                    return;
                }
            }
            None => return,
        }
    }
}

/// The protocol engine shared by Host and Client. Both roles receive Host packets and emit
///  Client packets; they differ in where the Client packets go (over the wire to the Host, or
///  straight into the Host's own packet handling) and in how the handshake packets are treated.
pub(crate) trait PeerRole<D: UserData>: Send + 'static {
    type Command: Send + 'static;

    fn core(&self) -> &PeerCore<D>;
    fn core_mut(&mut self) -> &mut PeerCore<D>;

    fn send_client_packet(&mut self, packet: ClientPacket<D>) -> Result<(), PeerError>;

    fn handle_role_command(&mut self, command: Self::Command);

    /// Called when the actor terminates because all handles to it were dropped
    fn shutdown(&mut self);

    fn on_welcome(&mut self, users: Vec<UserInfo<D>>);
    fn on_welcome_back(&mut self, users: Vec<UserInfo<D>>, user_id: UserId);
    fn on_reconnect_failed(&mut self);
    fn on_incompatible(&mut self, host_versions: Versions);
    /// The Host kicked this peer's own user
    fn on_kicked(&mut self);

    fn handle_peer_command(&mut self, command: PeerCommand<D>) {
        match command {
            PeerCommand::Send { message, targets, completion } => self.send_message(message, targets, completion),
            PeerCommand::AckTimeout(serial_id) => {
                let timeout = self.core().config.timeout;
                if self.core_mut().acks.timed_out(&serial_id, timeout) {
                    // a late acknowledgment must not find anything to complete
                    self.core_mut().ignore_serial_id(serial_id);
                }
            }
            PeerCommand::RegisterMessageType(message_type) => self.core_mut().register_message_type(message_type),
            PeerCommand::Subscribe { message_type, subscriber } => self.core_mut().subscribe(message_type, subscriber),
            PeerCommand::IgnoreSerialId(serial_id) => self.core_mut().ignore_serial_id(serial_id),
            PeerCommand::UpdateUser { update, reply } => self.update_own_user(update, reply),
            PeerCommand::Users(reply) => {
                let _ = reply.send(self.core().registry.users());
            }
            PeerCommand::UserInfos(reply) => {
                let _ = reply.send(self.core().registry.snapshot());
            }
            PeerCommand::PingInfos(reply) => {
                let _ = reply.send(self.core().registry.ping_infos());
            }
            PeerCommand::OwnUser(reply) => {
                let _ = reply.send(self.core().own_user());
            }
        }
    }

    fn send_message(&mut self, message: Message, targets: Option<Vec<UserId>>, completion: AckCompletion) {
        if self.core().state() != ConnectionState::Connected {
            let error: PeerError = ConnectionError::NotOpen.into();
            completion.reject(error.clone());
            self.core().report(error, ErrorReason::Other);
            return;
        }

        let serial_id = message.serial_id.clone();
        let timeout = self.core().spawn_ack_timeout(serial_id.clone());
        self.core_mut().acks.track(message.clone(), completion, timeout);

        if let Err(e) = self.send_client_packet(ClientPacket::Message { message, targets }) {
            self.core_mut().acks.reject(&serial_id, e.clone());
            self.core().report(e, ErrorReason::Other);
        }
    }

    fn update_own_user(&mut self, update: D::Update, reply: oneshot::Sender<Result<(), PeerError>>) {
        self.core_mut().update_waiters.push_back(reply);
        if let Err(e) = self.send_client_packet(ClientPacket::UpdateUser { update }) {
            if let Some(reply) = self.core_mut().update_waiters.pop_back() {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn handle_host_packet(&mut self, packet: HostPacket<D>) {
        trace!(user_id = ?self.core().user_id, packet_type = packet.packet_type(), "handling host packet");

        match packet {
            HostPacket::Welcome { users } => self.on_welcome(users),
            HostPacket::WelcomeBack { users, user_id } => self.on_welcome_back(users, user_id),
            HostPacket::ReconnectFailed => self.on_reconnect_failed(),
            HostPacket::Incompatible { versions } => self.on_incompatible(versions),
            HostPacket::UserConnected { user } => {
                debug!(user_id = ?user.id, "user connected");
                self.core_mut().registry.add_user(user.clone());
                self.core().emit(PeerEvent::UserConnected(user));
            }
            HostPacket::UserDisconnected { user_id } => self.user_left(user_id, false),
            HostPacket::UserReconnected { user_id } => {
                if self.core_mut().registry.restore_user(&user_id) {
                    debug!(?user_id, "user reconnected");
                    self.core().emit(PeerEvent::UserReconnected(user_id));
                }
                else {
                    self.core().report(PeerError::InternalInconsistency(format!("reconnect of unknown user {:?}", user_id)), ErrorReason::Internal);
                }
            }
            HostPacket::KickUser { user_id } => {
                if self.core().is_own(&user_id) {
                    self.on_kicked();
                }
                else {
                    self.user_left(user_id, true);
                }
            }
            HostPacket::Ping { initiation_date } => {
                let sequence_number = self.core_mut().next_pong_sequence_number();
                if let Err(e) = self.send_client_packet(ClientPacket::Pong { initiation_date, sequence_number }) {
                    self.core().report(e, ErrorReason::Other);
                }
            }
            HostPacket::RelayedMessage { message } => self.on_relayed_message(message),
            HostPacket::AcknowledgedByHost { serial_id } => {
                if self.core().is_ignored(&serial_id) {
                    trace!(?serial_id, "dropping acknowledgment by host for ignored serial id");
                }
                else if let Err(e) = self.core_mut().acks.acknowledged_by_host(&serial_id) {
                    self.core().report(e, ErrorReason::Internal);
                }
            }
            HostPacket::AcknowledgedByAll { serial_id } => {
                if self.core().is_ignored(&serial_id) {
                    trace!(?serial_id, "dropping acknowledgment by all for ignored serial id");
                }
                else if let Err(e) = self.core_mut().acks.acknowledged_by_all(&serial_id) {
                    self.core().report(e, ErrorReason::Internal);
                }
            }
            HostPacket::PingInfo { ping_infos } => {
                for entry in &ping_infos {
                    if let Err(e) = self.core_mut().registry.update_ping_info(&entry.user_id, entry.ping_info()) {
                        self.core().report(e, ErrorReason::Internal);
                    }
                }
                self.core().emit(PeerEvent::PingInfo(ping_infos));
            }
            HostPacket::UpdateUser { user } => {
                let updated = self.core_mut().registry.update_user(&user.id, &user.update)
                    .cloned();
                match updated {
                    Ok(updated) => {
                        let is_own = self.core().is_own(&updated.id);
                        self.core().emit(PeerEvent::UserUpdated(updated));
                        if is_own {
                            self.core_mut().own_update_applied();
                        }
                    }
                    Err(e) => self.core().report(e, ErrorReason::Internal),
                }
            }
        }
    }

    /// A kicked user never comes back, so its record is not archived
    fn user_left(&mut self, user_id: UserId, kicked: bool) {
        let registry = &mut self.core_mut().registry;
        let removed = if kicked {
            registry.forget_user(&user_id)
        }
        else {
            registry.remove_user(&user_id)
        };
        match removed {
            Some(_) => {
                debug!(?user_id, kicked, "user left");
                if kicked {
                    self.core().emit(PeerEvent::UserKicked(user_id.clone()));
                }
                self.core().emit(PeerEvent::UserDisconnected(user_id));
            }
            None => self.core().report(PeerError::InternalInconsistency(format!("disconnect of unknown user {:?}", user_id)), ErrorReason::Internal),
        }
    }

    fn on_relayed_message(&mut self, message: Message) {
        if self.core().is_ignored(&message.serial_id) {
            debug!(serial_id = ?message.serial_id, "dropping relayed message with ignored serial id");
            return;
        }

        if let Err(e) = self.send_client_packet(ClientPacket::Acknowledge { serial_id: message.serial_id.clone() }) {
            self.core().report(e, ErrorReason::Other);
        }

        self.core().emit(PeerEvent::Message(message.clone()));
        if let Err(e) = self.core_mut().dispatch(message) {
            self.core().report(e, ErrorReason::Internal);
        }
    }
}

/// The actor loop of a peer: all of the peer's state is owned by `role` and only touched from here
pub(crate) async fn run_peer<D: UserData, R: PeerRole<D>>(
    mut role: R,
    mut peer_commands: mpsc::UnboundedReceiver<PeerCommand<D>>,
    mut role_commands: mpsc::UnboundedReceiver<R::Command>,
) {
    loop {
        select! {
            biased;
            command = peer_commands.recv() => match command {
                Some(command) => role.handle_peer_command(command),
                None => break,
            },
            command = role_commands.recv() => match command {
                Some(command) => role.handle_role_command(command),
                None => break,
            },
        }
    }

    debug!(user_id = ?role.core().user_id, "all handles were dropped - shutting down");
    role.shutdown();
}
