// memc-common - Protocol layer for the memcache text protocol client
//
// Wire constants, command encoding, line framing and response decoders.
// Nothing in this crate touches a socket.

pub mod adapter;
pub mod decode;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use adapter::Adapter;
pub use decode::{Decoded, Decoder};
pub use error::*;
pub use frame::{read_line, Line};
pub use protocol::{StatsCategory, StoreCommand, StoreVerb};
pub use types::*;
