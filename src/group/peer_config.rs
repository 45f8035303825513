use std::sync::Arc;
use std::time::Duration;

use crate::util::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// The application's protocol version: a Host only admits Clients with exactly the same
    ///  version
    pub application_protocol_version: String,

    /// Used for message acknowledgments, the open handshake and ping rounds
    pub timeout: Duration,
    /// If set, a Host starts a ping round at this interval for as long as it is open
    pub ping_interval: Option<Duration>,

    pub event_channel_capacity: usize,
    /// How many departed users a peer remembers for USER_RECONNECTED / HELLO_AGAIN; the ones
    ///  that left first are forgotten first
    pub departed_user_capacity: usize,

    pub clock: Arc<dyn Clock>,
}

impl PeerConfig {
    pub fn new(application_protocol_version: &str) -> PeerConfig {
        PeerConfig {
            application_protocol_version: application_protocol_version.to_string(),
            timeout: Duration::from_secs(5),
            ping_interval: None,
            event_channel_capacity: 128,
            departed_user_capacity: 1024,
            clock: Arc::new(SystemClock::default()),
        }
    }
}
