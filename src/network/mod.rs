//! Network module - Handles TCP communication between hosts
//!
//! Provides:
//! - Server for accepting incoming connections and assigning sessions
//! - Client for connecting to servers
//! - Connection pumps and the session registry
//! - MAC address values

mod client;
mod connection;
mod mac;
mod processor;
mod registry;
mod server;


pub use client::*;
pub use connection::*;
pub use mac::*;
pub use processor::*;
pub use registry::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::protocol::{
    FramingMode, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT, DEFAULT_WRITE_TIMEOUT_MS,
    LISTEN_BACKLOG, MAX_CONNECT_ATTEMPTS,
};

/// Configuration for network operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface the server binds to (default: all IPv4 interfaces)
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
    /// Size of the per-connection receive buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Connect attempts a client makes before giving up
    #[serde(default = "default_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Timeout of a single connect attempt in milliseconds (0 = none)
    #[serde(default)]
    pub connect_timeout_ms: u64,
    /// Timeout of a single frame write in milliseconds (0 = none).
    /// A peer that stops reading is dropped once a write exceeds it.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Listen backlog of the server socket
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// How frames are delimited on the wire
    #[serde(default)]
    pub framing: FramingMode,
    /// Maximum size of one frame
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_connect_attempts() -> u32 {
    MAX_CONNECT_ATTEMPTS
}

fn default_write_timeout() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

fn default_backlog() -> u32 {
    LISTEN_BACKLOG
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            buffer_size: default_buffer_size(),
            max_connect_attempts: default_connect_attempts(),
            connect_timeout_ms: 0,
            write_timeout_ms: default_write_timeout(),
            backlog: default_backlog(),
            framing: FramingMode::default(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16, buffer_size: usize) -> Self {
        Self {
            port,
            buffer_size,
            ..Default::default()
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_write_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.write_timeout_ms = timeout_ms;
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
