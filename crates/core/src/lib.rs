pub mod bindaddr;
pub mod command;
pub mod observer;
pub mod ports;
pub mod pump;
pub mod refcount;
pub mod session;
pub mod ttl;
pub mod weak;
pub mod wheel;

use std::net::SocketAddr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Address family of a bound or learned endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }
}

pub use observer::Observer;
pub use session::{Role, Session, SessionManager, SessionManagerOptions, StreamSide, TtlMode};
