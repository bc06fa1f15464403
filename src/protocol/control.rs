//! Control frames and session identifiers
//!
//! Out-of-band signalling uses two fixed 64-byte sentinel frames instead of a
//! frame-type tag. Any received frame that is not exactly one of these shapes
//! is application payload.

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// Length of every control frame
pub const CONTROL_FRAME_LEN: usize = 64;

/// Length of the fixed prefix of a session-assign frame
pub const SESSION_PREFIX_LEN: usize = 48;

/// Sentinel telling the peer that the connection is being shut down.
///
/// Known limitation: a 64-byte application payload equal to this constant is
/// indistinguishable from a shutdown request. The value was picked to make an
/// accidental collision unlikely, not impossible.
pub const SHUTDOWN_SIGNATURE: [u8; CONTROL_FRAME_LEN] = [
    0x72, 0x63, 0x53, 0x2E, 0x6D, 0x6E, 0x75, 0x74, 0x9C, 0x63, 0x5A, 0x78, 0x68, 0x2E, 0xBE, 0x67,
    0xE4, 0x75, 0x69, 0x69, 0x6B, 0x65, 0x77, 0x74, 0x6F, 0x6B, 0xEE, 0x2E, 0x61, 0x4E, 0x77, 0x05,
    0x61, 0xC2, 0x6B, 0x4E, 0x65, 0x73, 0xD1, 0x6F, 0x53, 0xF7, 0x7A, 0x86, 0x53, 0x68, 0x75, 0x74,
    0x64, 0x6F, 0x77, 0x6E, 0x53, 0x65, 0x72, 0x65, 0x72, 0x43, 0x6C, 0x65, 0x68, 0x2E, 0xBE, 0x67,
];

/// Prefix of the frame that carries a freshly assigned session identifier.
///
/// The remaining 16 bytes of the frame are the identifier. Same collision
/// caveat as [`SHUTDOWN_SIGNATURE`]: any 64-byte payload starting with these
/// 48 bytes is read as a session assignment.
pub const SESSION_SIGNATURE_PREFIX: [u8; SESSION_PREFIX_LEN] = [
    0x72, 0x63, 0x53, 0x2E, 0x6D, 0x6E, 0x75, 0x74, 0x9C, 0x63, 0x5A, 0x78, 0x68, 0x2E, 0xBE, 0x67,
    0xE4, 0x75, 0x69, 0x69, 0x6B, 0x65, 0x77, 0x74, 0x6F, 0x6B, 0xEE, 0x2E, 0x61, 0x4E, 0x77, 0x05,
    0x61, 0xC2, 0x6B, 0x4E, 0x65, 0x73, 0xD1, 0x6F, 0x53, 0xF7, 0x7A, 0x86, 0x47, 0x75, 0x69, 0x64,
];

/// Server-assigned identifier of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random identifier
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero identifier; never assigned to a connection
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Encode in the mixed-endian GUID layout used on the wire
    pub fn to_wire_bytes(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    /// Decode from the mixed-endian GUID layout used on the wire
    pub fn from_wire_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes_le(bytes))
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A received frame after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The peer is shutting the connection down
    Shutdown,
    /// The server assigned this connection a session identifier
    SessionAssign(SessionId),
    /// Application data, handed to the deserializer untouched
    Payload(Bytes),
}

impl Frame {
    /// Classify one received frame
    pub fn classify(bytes: Bytes) -> Self {
        if bytes.len() != CONTROL_FRAME_LEN {
            return Frame::Payload(bytes);
        }

        if bytes[..] == SHUTDOWN_SIGNATURE[..] {
            return Frame::Shutdown;
        }

        if bytes[..SESSION_PREFIX_LEN] == SESSION_SIGNATURE_PREFIX[..] {
            let mut id = [0u8; 16];
            id.copy_from_slice(&bytes[SESSION_PREFIX_LEN..]);
            return Frame::SessionAssign(SessionId::from_wire_bytes(id));
        }

        Frame::Payload(bytes)
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Frame::Payload(_))
    }
}

/// Build the session-assign control frame for `id`
pub fn session_assign_frame(id: SessionId) -> [u8; CONTROL_FRAME_LEN] {
    let mut frame = [0u8; CONTROL_FRAME_LEN];
    frame[..SESSION_PREFIX_LEN].copy_from_slice(&SESSION_SIGNATURE_PREFIX);
    frame[SESSION_PREFIX_LEN..].copy_from_slice(&id.to_wire_bytes());
    frame
}
