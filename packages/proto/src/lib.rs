//! KRPC wire types and codec shared by the routing table and engine crates.

pub mod addr;
pub mod codec;
pub mod error;
pub mod id;
pub mod transaction;

pub use addr::NodeInfo;
pub use codec::{MessageKind, ParsedMessage};
pub use error::CodecError;
pub use id::Id;
