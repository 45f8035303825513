pub mod acknowledgment;
pub mod client;
pub mod error;
pub mod host;
pub mod ids;
pub mod message;
pub mod packets;
pub mod peer;
pub mod peer_config;
pub mod peer_events;
pub mod ping;
pub mod users;
pub mod versions;
