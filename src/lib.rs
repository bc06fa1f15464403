//! SessionLink - Session-based TCP messaging
//!
//! A server accepts TCP clients, assigns each one a [`SessionId`] and keeps
//! them in a registry; clients and server then exchange messages in both
//! directions. Two fixed 64-byte control frames travel in-band: one hands a
//! client its session identifier, the other announces a shutdown.
//!
//! Messages are turned into payload bytes by a [`Serializer`]. Received
//! payloads either go to an installed data processor or are raised as
//! events on the channel returned by `take_event_receiver`.

pub mod config;
pub mod network;
pub mod protocol;

pub use network::{
    AcceptCondition, ByteClient, ByteServer, Client, ClientDataProcessor, ClientError, ClientEvent,
    DisconnectReason, MacAddress, NetworkConfig, Server, ServerDataProcessor, ServerError, ServerEvent,
    ServerHandle,
};
pub use protocol::{Bincode, FramingMode, Json, RawBytes, Serializer, SessionId};
