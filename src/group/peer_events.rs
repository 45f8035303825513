use tokio::sync::broadcast;
use tracing::trace;

use crate::group::error::{ErrorReason, PeerError};
use crate::group::ids::UserId;
use crate::group::message::Message;
use crate::group::users::{PingInfoEntry, User, UserData};
use crate::messaging::peer_id::PeerId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenResult {
    pub peer_id: PeerId,
    pub user_id: UserId,
}

/// Lifecycle events of a peer. Every peer sees the same sequence of user events, regardless of
///  whether it caused them, because they are all driven by Host broadcasts.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent<D: UserData> {
    Connected(OpenResult),
    UserConnected(User<D>),
    UserDisconnected(UserId),
    UserReconnected(UserId),
    UserKicked(UserId),
    UserUpdated(User<D>),
    PingInfo(Vec<PingInfoEntry>),
    /// low-level: every relayed message, regardless of its type
    Message(Message),
    /// Failures that are not tied to a specific caller's operation
    Error {
        error: PeerError,
        reason: ErrorReason,
    },
    Disconnected,
}

pub struct PeerEventNotifier<D: UserData> {
    sender: broadcast::Sender<PeerEvent<D>>,
}
impl <D: UserData> PeerEventNotifier<D> {
    pub fn new(capacity: usize) -> PeerEventNotifier<D> {
        let (sender, _) = broadcast::channel(capacity);

        PeerEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent<D>> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: PeerEvent<D>) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::user::MockUser;

    use super::*;

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let notifier = PeerEventNotifier::<MockUser>::new(8);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.send_event(PeerEvent::UserDisconnected(UserId::from("x")));

        assert_eq!(a.recv().await.unwrap(), PeerEvent::UserDisconnected(UserId::from("x")));
        assert_eq!(b.recv().await.unwrap(), PeerEvent::UserDisconnected(UserId::from("x")));
    }

    #[test]
    fn test_send_without_subscribers() {
        let notifier = PeerEventNotifier::<MockUser>::new(8);
        notifier.send_event(PeerEvent::Disconnected);
    }
}
