//! A host-driven Kademlia DHT engine compatible with BitTorrent Mainline
//! DHT (BEP-5) and its IPv6 extension (BEP-32).
//!
//! The engine is sans-io: it owns no socket and no thread. A host
//! implements [`Host`] (clock, RNG, hash, blacklist, send) and drives the
//! engine by feeding inbound datagrams and calling [`Engine::periodic`] on
//! the schedule it returns.

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod log;
pub mod search;
pub mod storage;
pub mod token;
pub mod transport;

pub use bootstrap::BootstrapState;
pub use config::Config;
pub use context::Host;
pub use engine::{Engine, EngineEvent, FamilyStats, NodeCounts};
pub use error::{DhtError, EngineStatus};
pub use log::{LogLevel, LogSink};

pub use krpc_proto::Id;
