//! Pluggable handlers for received data and new connections
//!
//! When a processor is installed it receives every payload and the
//! corresponding `DataReceived` event is not raised.

use async_trait::async_trait;
use std::sync::Arc;

use super::ServerHandle;
use crate::protocol::SessionId;

/// Handles payloads a client receives from its server
#[async_trait]
pub trait ClientDataProcessor<T: Send + 'static>: Send + Sync {
    async fn process_received(&self, data: T);
}

/// Handles payloads a server receives from its clients.
///
/// A processor that needs to answer should hold a clone of the
/// [`ServerHandle`] it was built with.
#[async_trait]
pub trait ServerDataProcessor<T: Send + 'static>: Send + Sync {
    async fn process_received(&self, data: T, from: SessionId);
}

/// Decides whether a freshly accepted connection is admitted.
///
/// Called with the server and the identifier the connection would receive.
pub type AcceptCondition<S> = Arc<dyn Fn(&ServerHandle<S>, SessionId) -> bool + Send + Sync>;
