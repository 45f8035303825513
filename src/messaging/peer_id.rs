use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Transport-level address of a peer, i.e. what a Client passes to `open()` to reach a Host.
///
/// Its format is owned by the [crate::messaging::transport::Transport] implementation: a
///  socket address for TCP, a random token for the in-memory transport.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> PeerId {
        PeerId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::new(value)
    }
}
