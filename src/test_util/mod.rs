//! Utilities for testing code that is based on Hosts and Clients. They are used for testing this
//!  crate itself, and they are exported for application testing as well.

pub mod group;
pub mod user;
