use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::group::acknowledgment::{AckCompletion, AckOutcome};
use crate::group::error::{ConnectionError, PeerError};
use crate::group::ids::{SerialId, UserId};
use crate::group::peer::{PeerCommand, PeerHandle};
use crate::group::users::UserData;
use crate::messaging::wire;
use crate::util::clock::Timestamp;

/// The envelope of an application message as it goes over the wire. The payload is opaque at
///  this level, it is encoded and decoded by the typed [MessageFactory].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: String,
    pub serial_id: SerialId,
    pub origin_user_id: UserId,
    pub payload: Vec<u8>,
    pub created_date: Timestamp,
}

/// Typed access to one message type of a peer: sending payloads and subscribing to them.
///
/// Creating a factory registers the message type with the peer; relayed messages of a type that
///  was never registered are reported as an internal inconsistency.
pub struct MessageFactory<D: UserData, P> {
    message_type: String,
    peer: PeerHandle<D>,
    _payload: PhantomData<fn(P) -> P>,
}

impl <D: UserData, P: Serialize + DeserializeOwned> MessageFactory<D, P> {
    pub(crate) fn new(peer: PeerHandle<D>, message_type: &str) -> MessageFactory<D, P> {
        let _ = peer.commands.send(PeerCommand::RegisterMessageType(message_type.to_string()));
        MessageFactory {
            message_type: message_type.to_string(),
            peer,
            _payload: PhantomData,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn subscribe(&self) -> MessageSubscription<P> {
        let (subscriber, receiver) = mpsc::unbounded_channel();
        let _ = self.peer.commands.send(PeerCommand::Subscribe {
            message_type: self.message_type.clone(),
            subscriber,
        });
        MessageSubscription {
            receiver,
            _payload: PhantomData,
        }
    }

    /// Sends a message to all users, including this peer's own user
    pub fn send(&self, payload: &P) -> Result<SentMessageHandle, PeerError> {
        self.do_send(payload, None)
    }

    pub fn send_to(&self, payload: &P, targets: Vec<UserId>) -> Result<SentMessageHandle, PeerError> {
        self.do_send(payload, Some(targets))
    }

    fn do_send(&self, payload: &P, targets: Option<Vec<UserId>>) -> Result<SentMessageHandle, PeerError> {
        let message = Message {
            message_type: self.message_type.clone(),
            serial_id: SerialId::generate(),
            origin_user_id: self.peer.user_id.clone(),
            payload: wire::encode(payload)?.to_vec(),
            created_date: self.peer.config.clock.now_millis(),
        };

        let (completion, host, all) = AckCompletion::new();
        self.peer.commands.send(PeerCommand::Send {
            message: message.clone(),
            targets,
            completion,
        })
            .map_err(|_| ConnectionError::Closed)?;

        Ok(SentMessageHandle {
            message,
            host,
            all,
        })
    }
}

/// Returned for every sent message. Both completions can be awaited any number of times, and
///  independently of each other.
#[derive(Debug, Clone)]
pub struct SentMessageHandle {
    pub message: Message,
    host: watch::Receiver<AckOutcome>,
    all: watch::Receiver<AckOutcome>,
}

impl SentMessageHandle {
    pub fn serial_id(&self) -> &SerialId {
        &self.message.serial_id
    }

    pub async fn wait_for_host(&self) -> Result<(), PeerError> {
        wait_for_outcome(self.host.clone()).await
    }

    pub async fn wait_for_all(&self) -> Result<(), PeerError> {
        wait_for_outcome(self.all.clone()).await
    }
}

async fn wait_for_outcome(mut receiver: watch::Receiver<AckOutcome>) -> Result<(), PeerError> {
    match receiver.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => match &*outcome {
            Some(result) => result.clone(),
            None => Err(ConnectionError::Closed.into()),
        },
        // the peer shut down without settling
        Err(_) => Err(ConnectionError::Closed.into()),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedMessage<P> {
    pub payload: P,
    pub origin_user_id: UserId,
    pub created_date: Timestamp,
    pub serial_id: SerialId,
}

pub struct MessageSubscription<P> {
    receiver: mpsc::UnboundedReceiver<Message>,
    _payload: PhantomData<fn() -> P>,
}

impl <P: DeserializeOwned> MessageSubscription<P> {
    /// Returns `None` once the peer is gone. Messages with a payload that can not be decoded
    ///  are logged and skipped.
    pub async fn recv(&mut self) -> Option<ReceivedMessage<P>> {
        loop {
            let message = self.receiver.recv().await?;
            if let Some(received) = Self::decode(message) {
                return Some(received);
            }
        }
    }

    /// Returns a message if one was received already, without waiting
    pub fn try_recv(&mut self) -> Option<ReceivedMessage<P>> {
        while let Ok(message) = self.receiver.try_recv() {
            if let Some(received) = Self::decode(message) {
                return Some(received);
            }
        }
        None
    }

    fn decode(message: Message) -> Option<ReceivedMessage<P>> {
        match wire::decode(&message.payload) {
            Ok(payload) => Some(ReceivedMessage {
                payload,
                origin_user_id: message.origin_user_id,
                created_date: message.created_date,
                serial_id: message.serial_id,
            }),
            Err(e) => {
                warn!(serial_id = ?message.serial_id, message_type = %message.message_type, "skipping message with undecodable payload: {}", e);
                None
            }
        }
    }
}
