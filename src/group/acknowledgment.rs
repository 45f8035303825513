use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::group::error::{PeerError, TimeoutError};
use crate::group::ids::SerialId;
use crate::group::message::Message;

/// `None` while pending, the outcome once settled. A completion is settled at most once.
pub type AckOutcome = Option<Result<(), PeerError>>;

/// The sending side of a message's two completions, 'acknowledged by host' and 'acknowledged by
///  all'. Waiters hold the corresponding [watch::Receiver]s, so any number of them can wait, and
///  late waiters see the settled outcome.
#[derive(Debug)]
pub struct AckCompletion {
    host: watch::Sender<AckOutcome>,
    all: watch::Sender<AckOutcome>,
}

impl AckCompletion {
    pub fn new() -> (AckCompletion, watch::Receiver<AckOutcome>, watch::Receiver<AckOutcome>) {
        let (host, host_receiver) = watch::channel(None);
        let (all, all_receiver) = watch::channel(None);
        (AckCompletion { host, all }, host_receiver, all_receiver)
    }

    fn settle(sender: &watch::Sender<AckOutcome>, outcome: Result<(), PeerError>) {
        sender.send_if_modified(move |current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            }
            else {
                false
            }
        });
    }

    pub fn resolve_host(&self) {
        Self::settle(&self.host, Ok(()));
    }

    /// Acknowledgment by all implies acknowledgment by the host
    pub fn resolve_all(&self) {
        Self::settle(&self.host, Ok(()));
        Self::settle(&self.all, Ok(()));
    }

    pub fn reject(&self, error: PeerError) {
        Self::settle(&self.host, Err(error.clone()));
        Self::settle(&self.all, Err(error));
    }
}

struct PendingSend {
    message: Message,
    completion: AckCompletion,
    timeout: JoinHandle<()>,
}

/// Outbound messages that are not yet acknowledged by all their targets, keyed by serial id. A
///  record is removed when it is acknowledged by all, times out or is rejected; each of these
///  stops its timeout.
#[derive(Default)]
pub struct AcknowledgmentTracker {
    pending: FxHashMap<SerialId, PendingSend>,
}

impl AcknowledgmentTracker {
    pub fn new() -> AcknowledgmentTracker {
        Default::default()
    }

    pub fn track(&mut self, message: Message, completion: AckCompletion, timeout: JoinHandle<()>) {
        debug!(serial_id = ?message.serial_id, message_type = %message.message_type, "tracking message");
        if let Some(prev) = self.pending.insert(message.serial_id.clone(), PendingSend { message, completion, timeout }) {
            warn!(serial_id = ?prev.message.serial_id, "serial id was tracked twice - rejecting the first message");
            prev.timeout.abort();
            prev.completion.reject(PeerError::InternalInconsistency(format!("serial id {:?} was used twice", prev.message.serial_id)));
        }
    }

    pub fn is_pending(&self, serial_id: &SerialId) -> bool {
        self.pending.contains_key(serial_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn acknowledged_by_host(&mut self, serial_id: &SerialId) -> Result<(), PeerError> {
        match self.pending.get(serial_id) {
            Some(pending) => {
                debug!(?serial_id, "acknowledged by host");
                pending.completion.resolve_host();
                Ok(())
            }
            None => Err(unknown_serial_id(serial_id)),
        }
    }

    pub fn acknowledged_by_all(&mut self, serial_id: &SerialId) -> Result<(), PeerError> {
        match self.pending.remove(serial_id) {
            Some(pending) => {
                debug!(?serial_id, "acknowledged by all");
                pending.timeout.abort();
                pending.completion.resolve_all();
                Ok(())
            }
            None => Err(unknown_serial_id(serial_id)),
        }
    }

    /// Rejects both completions with a [TimeoutError]. Returns `false` if the message was no
    ///  longer pending, i.e. it completed while the timeout was on its way.
    pub fn timed_out(&mut self, serial_id: &SerialId, timeout: Duration) -> bool {
        match self.pending.remove(serial_id) {
            Some(pending) => {
                warn!(?serial_id, message_type = %pending.message.message_type, "message was not acknowledged within {:?}", timeout);
                pending.completion.reject(TimeoutError {
                    operation: format!("acknowledgment of message {:?}", serial_id),
                    timeout,
                }.into());
                true
            }
            None => false,
        }
    }

    pub fn reject(&mut self, serial_id: &SerialId, error: PeerError) {
        if let Some(pending) = self.pending.remove(serial_id) {
            pending.timeout.abort();
            pending.completion.reject(error);
        }
    }

    pub fn reject_all(&mut self, error: PeerError) {
        for (_, pending) in self.pending.drain() {
            pending.timeout.abort();
            pending.completion.reject(error.clone());
        }
    }
}

fn unknown_serial_id(serial_id: &SerialId) -> PeerError {
    PeerError::InternalInconsistency(format!("acknowledgment for unknown serial id {:?}", serial_id))
}
