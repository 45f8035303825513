pub mod in_memory;
pub mod peer_id;
pub mod tcp;
pub mod transport;
pub mod wire;
