use serde::{Deserialize, Serialize};

use crate::group::ids::{SerialId, UserId};
use crate::group::message::Message;
use crate::group::users::{PingInfoEntry, User, UserData, UserInfo, UserUpdate};
use crate::group::versions::Versions;
use crate::util::clock::Timestamp;

/// Packets sent by the Host to a Client. The Host also 'sends' them to itself (without going
///  through the transport) so that its own registry is driven by exactly the same packets as
///  every Client's.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: UserData")]
pub enum HostPacket<D: UserData> {
    Welcome { users: Vec<UserInfo<D>> },
    WelcomeBack { users: Vec<UserInfo<D>>, user_id: UserId },
    ReconnectFailed,
    UserConnected { user: User<D> },
    UserDisconnected { user_id: UserId },
    UserReconnected { user_id: UserId },
    Ping { initiation_date: Timestamp },
    RelayedMessage { message: Message },
    AcknowledgedByHost { serial_id: SerialId },
    AcknowledgedByAll { serial_id: SerialId },
    PingInfo { ping_infos: Vec<PingInfoEntry> },
    UpdateUser { user: UserUpdate<D> },
    Incompatible { versions: Versions },
    KickUser { user_id: UserId },
}

impl <D: UserData> HostPacket<D> {
    pub fn packet_type(&self) -> &'static str {
        match self {
            HostPacket::Welcome { .. } => "welcome",
            HostPacket::WelcomeBack { .. } => "welcome back",
            HostPacket::ReconnectFailed => "reconnect failed",
            HostPacket::UserConnected { .. } => "user connected",
            HostPacket::UserDisconnected { .. } => "user disconnected",
            HostPacket::UserReconnected { .. } => "user reconnected",
            HostPacket::Ping { .. } => "ping",
            HostPacket::RelayedMessage { .. } => "relayed message",
            HostPacket::AcknowledgedByHost { .. } => "acknowledged by host",
            HostPacket::AcknowledgedByAll { .. } => "acknowledged by all",
            HostPacket::PingInfo { .. } => "ping info",
            HostPacket::UpdateUser { .. } => "update user",
            HostPacket::Incompatible { .. } => "incompatible",
            HostPacket::KickUser { .. } => "kick user",
        }
    }
}

/// Packets sent by a Client to the Host. The Host's own outgoing packets of this kind are
///  handled locally, in the same code path as packets arriving from Clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: UserData")]
pub enum ClientPacket<D: UserData> {
    Hello { user: User<D>, versions: Versions },
    HelloAgain { user_id: UserId, versions: Versions },
    Disconnect,
    Pong { initiation_date: Timestamp, sequence_number: u64 },
    Message { message: Message, targets: Option<Vec<UserId>> },
    Acknowledge { serial_id: SerialId },
    /// The id is implicit: it is the sender's own user
    UpdateUser { update: D::Update },
}

impl <D: UserData> ClientPacket<D> {
    pub fn packet_type(&self) -> &'static str {
        match self {
            ClientPacket::Hello { .. } => "hello",
            ClientPacket::HelloAgain { .. } => "hello again",
            ClientPacket::Disconnect => "disconnect",
            ClientPacket::Pong { .. } => "pong",
            ClientPacket::Message { .. } => "message",
            ClientPacket::Acknowledge { .. } => "acknowledge",
            ClientPacket::UpdateUser { .. } => "update user",
        }
    }
}
