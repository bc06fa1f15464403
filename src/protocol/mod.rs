//! Protocol module - Defines the wire protocol for SessionLink communication
//!
//! Three layers sit between a socket and application code:
//! - Framing: how frames are delimited on the byte stream (`codec`)
//! - Control frames: the 64-byte session-assign and shutdown sentinels (`control`)
//! - Serializers: how application messages become payload bytes (`serializer`)

mod codec;
mod control;
mod serializer;

pub use codec::*;
pub use control::*;
pub use serializer::*;

/// Default port for SessionLink communication
pub const DEFAULT_PORT: u16 = 24810;

/// Default size of the per-connection receive buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Number of blocking connect attempts a client makes before giving up
pub const MAX_CONNECT_ATTEMPTS: u32 = 20;

/// How long a single frame write may take before the peer is dropped
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;

/// Listen backlog used by the server
pub const LISTEN_BACKLOG: u32 = 12;
