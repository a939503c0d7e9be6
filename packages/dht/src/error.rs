//! Error vocabulary (§7). Internal operations return [`DhtError`]; the
//! host-facing surface collapses everything to [`EngineStatus`], a small
//! integer status the host can act on without matching internal variants.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("unsupported address family for {addr}")]
    UnsupportedFamily { addr: SocketAddr },

    #[error("send to {addr} failed: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("peer {addr} sent a malformed message: {reason}")]
    ProtocolViolation { addr: SocketAddr, reason: &'static str },

    #[error("resource cap reached: {what}")]
    CapReached { what: &'static str },

    #[error("double init attempted")]
    AlreadyInitialized,

    #[error("bootstrap for this family has no registered seed addresses")]
    NoBootstrapSeeds,

    #[error("internal invariant violated: {what}")]
    Invariant { what: &'static str },
}

/// Host-facing status (§7): "The main callback is the only asynchronous
/// notification path... each operation returns a small integer status."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    Duplicate,
    Rejected,
}

impl From<&DhtError> for EngineStatus {
    fn from(_: &DhtError) -> EngineStatus {
        EngineStatus::Rejected
    }
}

pub type Result<T> = std::result::Result<T, DhtError>;
