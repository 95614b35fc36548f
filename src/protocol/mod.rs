//! Protocol module - Defines the wire protocol between work manager nodes
//!
//! Every call is one request frame followed by one response frame on a
//! dedicated connection. Both directions share the same framing:
//! - 4 bytes command/response ordinal (big-endian)
//! - 4 bytes parameter count (big-endian)
//! - per parameter: 4 bytes length (big-endian) followed by a bincode blob

mod codec;
mod message;
mod types;

pub use codec::*;
pub use message::*;
pub use types::*;

#[cfg(test)]
pub(crate) use message::tests::sample as sample_request;

/// Protocol version, reported in the startup banner
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for node-to-node communication
pub const DEFAULT_PORT: u16 = 24900;

/// Upper bound on parameters carried by a single frame
pub const MAX_PARAMETERS: usize = 16;
