use serde::{Deserialize, Serialize};

/// Version of this library as reported during the handshake
pub const P2P_NETWORK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    /// The application's own protocol version, taken from the peer's config
    pub application: String,
    pub p2p_network: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IncompatibleVersion {
    ApplicationProtocolVersion,
    P2pNetworkVersion,
}

impl Versions {
    pub fn new(application_protocol_version: &str) -> Versions {
        Versions {
            application: application_protocol_version.to_string(),
            p2p_network: P2P_NETWORK_VERSION.to_string(),
        }
    }

    /// Compares field by field, returning every field that differs. An empty result means the
    ///  two peers can talk to each other.
    pub fn incompatibilities(&self, other: &Versions) -> Vec<IncompatibleVersion> {
        let mut result = Vec::new();
        if self.application != other.application {
            result.push(IncompatibleVersion::ApplicationProtocolVersion);
        }
        if self.p2p_network != other.p2p_network {
            result.push(IncompatibleVersion::P2pNetworkVersion);
        }
        result
    }
}
