use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a user, minted by the user's own peer without coordination. It is immutable for
///  the lifetime of a peer instance and is the key of every [crate::group::users::UserRegistry].
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Correlation key of one message send: acknowledgments, relays and the ignore-list all refer to
///  a message by its serial id.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialId(String);

macro_rules! uuid_id {
    ($t:ident) => {
        impl $t {
            pub fn generate() -> $t {
                $t(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Debug for $t {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Display for $t {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                $t(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                $t(value)
            }
        }
    }
}

uuid_id!(UserId);
uuid_id!(SerialId);
