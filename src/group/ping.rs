use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::group::error::PeerError;
use crate::group::ids::UserId;
use crate::util::clock::Timestamp;

pub(crate) type PingReply = oneshot::Sender<Result<(), PeerError>>;

/// One round of PING / PONG driven by the Host: which users still owe a PONG, and who waits for
///  the round to finish.
pub(crate) struct PingRound {
    pub id: u64,
    pub initiation_date: Timestamp,
    pending: FxHashSet<UserId>,
    waiters: Vec<PingReply>,
    timeout: JoinHandle<()>,
}

impl PingRound {
    pub fn new(id: u64, initiation_date: Timestamp, participants: impl IntoIterator<Item = UserId>, timeout: JoinHandle<()>) -> PingRound {
        let pending: FxHashSet<UserId> = participants.into_iter().collect();
        debug!(id, initiation_date, participants = pending.len(), "starting ping round");
        PingRound {
            id,
            initiation_date,
            pending,
            waiters: Vec::new(),
            timeout,
        }
    }

    pub fn add_waiter(&mut self, waiter: Option<PingReply>) {
        if let Some(waiter) = waiter {
            self.waiters.push(waiter);
        }
    }

    /// Registers a user's PONG, returning `false` if the PONG does not belong to this round or
    ///  the user already answered
    pub fn on_pong(&mut self, user_id: &UserId, initiation_date: Timestamp) -> bool {
        if initiation_date != self.initiation_date {
            trace!(?user_id, initiation_date, "pong for a different round");
            return false;
        }
        self.pending.remove(user_id)
    }

    /// A user that leaves during a round is not waited for
    pub fn remove_participant(&mut self, user_id: &UserId) {
        self.pending.remove(user_id);
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn unresponsive(&self) -> Vec<UserId> {
        let mut result: Vec<UserId> = self.pending.iter().cloned().collect();
        result.sort();
        result
    }

    pub fn finish(self, result: Result<(), PeerError>) {
        debug!(id = self.id, ok = result.is_ok(), "ping round finished");
        self.timeout.abort();
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Last PONG sequence number per user, for detecting duplicate or reordered PONGs
#[derive(Default)]
pub(crate) struct PongSequences {
    last_seen: FxHashMap<UserId, u64>,
}

impl PongSequences {
    /// Returns `false` if this sequence number is not newer than the last one seen for the user
    pub fn accept(&mut self, user_id: &UserId, sequence_number: u64) -> bool {
        match self.last_seen.get(user_id) {
            Some(&last) if sequence_number <= last => false,
            _ => {
                self.last_seen.insert(user_id.clone(), sequence_number);
                true
            }
        }
    }

    /// Starts over for a user, e.g. when a new peer instance takes over the user id
    pub fn reset(&mut self, user_id: &UserId) {
        self.last_seen.remove(user_id);
    }
}

pub(crate) fn round_trip_time(initiation_date: Timestamp, now: Timestamp) -> Duration {
    Duration::from_millis(now.saturating_sub(initiation_date).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::group::error::TimeoutError;

    use super::*;

    fn round(participants: &[&str]) -> PingRound {
        PingRound::new(1, 1000, participants.iter().map(|id| UserId::from(*id)), tokio::spawn(async {}))
    }

    #[tokio::test]
    async fn test_round_completes_when_all_answered() {
        let mut round = round(&["a", "b"]);
        let (waiter, result) = oneshot::channel();
        round.add_waiter(Some(waiter));

        assert!(round.on_pong(&UserId::from("a"), 1000));
        assert!(!round.on_pong(&UserId::from("a"), 1000));
        assert!(!round.is_complete());
        assert!(round.on_pong(&UserId::from("b"), 1000));
        assert!(round.is_complete());

        round.finish(Ok(()));
        assert_eq!(result.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_pong_of_other_round_is_ignored() {
        let mut round = round(&["a"]);
        assert!(!round.on_pong(&UserId::from("a"), 999));
        assert!(!round.is_complete());
    }

    #[tokio::test]
    async fn test_remove_participant() {
        let mut round = round(&["c", "a", "b"]);
        round.remove_participant(&UserId::from("b"));
        assert_eq!(round.unresponsive(), vec![UserId::from("a"), UserId::from("c")]);
    }

    #[tokio::test]
    async fn test_every_waiter_gets_the_result() {
        let mut round = round(&["a"]);
        let (w1, r1) = oneshot::channel();
        let (w2, r2) = oneshot::channel();
        round.add_waiter(Some(w1));
        round.add_waiter(None);
        round.add_waiter(Some(w2));

        let error: PeerError = TimeoutError { operation: "ping".to_string(), timeout: Duration::from_secs(5) }.into();
        round.finish(Err(error.clone()));
        assert_eq!(r1.await.unwrap(), Err(error.clone()));
        assert_eq!(r2.await.unwrap(), Err(error));
    }

    #[test]
    fn test_pong_sequences() {
        let mut sequences = PongSequences::default();
        let a = UserId::from("a");
        assert!(sequences.accept(&a, 1));
        assert!(sequences.accept(&a, 2));
        assert!(!sequences.accept(&a, 2));
        assert!(!sequences.accept(&a, 1));
        assert!(sequences.accept(&UserId::from("b"), 1));

        sequences.reset(&a);
        assert!(sequences.accept(&a, 1));
    }

    #[rstest]
    #[case::zero(1000, 1000, 0)]
    #[case::regular(1000, 1017, 17)]
    #[case::clock_went_backwards(1000, 990, 0)]
    fn test_round_trip_time(#[case] initiation_date: Timestamp, #[case] now: Timestamp, #[case] expected_millis: u64) {
        assert_eq!(round_trip_time(initiation_date, now), Duration::from_millis(expected_millis));
    }
}
