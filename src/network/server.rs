//! SessionLink Server
//!
//! The server accepts connections, assigns each one a session identifier
//! and routes messages between the host application and its clients.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::{self, ConnectionError, FrameSink, PumpControl};
use super::{AcceptCondition, NetworkConfig, ServerDataProcessor, SessionRegistry};
use crate::protocol::{
    session_assign_frame, CodecError, Frame, RawBytes, Serializer, SessionId, SHUTDOWN_SIGNATURE,
};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown session: {0}")]
    KeyNotFound(SessionId),

    #[error("Session {0} is not connected")]
    NotConnected(SessionId),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Server has been disposed")]
    ObjectDisposed,
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Why a client left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection while stopping
    Closed,
    /// The client went away, or was disconnected individually
    Lost,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("closed"),
            DisconnectReason::Lost => f.write_str("lost"),
        }
    }
}

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent<T> {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// Server stopped
    Stopped,
    /// A new client has been admitted and registered
    ClientConnected { session: SessionId },
    /// A client has left the registry
    ClientDisconnected {
        session: SessionId,
        reason: DisconnectReason,
    },
    /// Received a message from a client (only without a data processor)
    DataReceived { session: SessionId, data: T },
    /// A transport or decoding problem that did not surface to a caller
    Fault {
        session: Option<SessionId>,
        message: String,
    },
}

type ServerProcessor<S> = Arc<dyn ServerDataProcessor<<S as Serializer>::Message>>;

/// State shared between the server, its accept loop and its pumps
struct ServerShared<S: Serializer> {
    config: NetworkConfig,
    serializer: S,
    buffer_size: Arc<AtomicUsize>,
    registry: SessionRegistry,
    processor: RwLock<Option<ServerProcessor<S>>>,
    accept_condition: RwLock<Option<AcceptCondition<S>>>,
    event_tx: mpsc::UnboundedSender<ServerEvent<S::Message>>,
    local_addr: RwLock<Option<SocketAddr>>,
    running: AtomicBool,
    disposed: AtomicBool,
}

/// Cloneable access to a server's sessions.
///
/// This is what data processors and accept conditions use to talk back to
/// the server they are attached to.
pub struct ServerHandle<S: Serializer = RawBytes> {
    shared: Arc<ServerShared<S>>,
}

impl<S: Serializer> Clone for ServerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Serializer> ServerHandle<S> {
    fn ensure_live(&self) -> ServerResult<()> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(ServerError::ObjectDisposed);
        }
        Ok(())
    }

    fn emit(&self, event: ServerEvent<S::Message>) {
        let _ = self.shared.event_tx.send(event);
    }

    fn fault(&self, session: Option<SessionId>, message: String) {
        tracing::warn!("{}", message);
        self.emit(ServerEvent::Fault { session, message });
    }

    fn serialize(&self, data: &S::Message) -> ServerResult<Vec<u8>> {
        let bytes = self.shared.serializer.serialize(data)?;
        if bytes.is_empty() {
            return Err(ServerError::InvalidArgument(
                "message serialized to an empty payload".to_string(),
            ));
        }
        Ok(bytes)
    }

    /// Port the server listens on
    pub fn port(&self) -> u16 {
        self.shared.config.port
    }

    /// Whether the accept loop is active
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Identifiers of all registered clients
    pub async fn clients(&self) -> ServerResult<Vec<SessionId>> {
        self.ensure_live()?;
        Ok(self.shared.registry.ids().await)
    }

    /// Send a message to one client
    pub async fn send(&self, data: &S::Message, session: SessionId) -> ServerResult<()> {
        self.ensure_live()?;

        let conn = self
            .shared
            .registry
            .get(&session)
            .await
            .ok_or(ServerError::KeyNotFound(session))?;

        let bytes = self.serialize(data)?;

        if !conn.is_open() {
            return Err(ServerError::NotConnected(session));
        }

        match conn.send(&bytes).await {
            Ok(()) => Ok(()),
            Err(ConnectionError::Closed) => Err(ServerError::NotConnected(session)),
            Err(ConnectionError::Codec(e)) => Err(ServerError::Codec(e)),
            Err(ConnectionError::Io(e)) => {
                self.fault(Some(session), format!("Send to {} failed: {}", session, e));
                self.drop_session(session, DisconnectReason::Lost).await;
                Ok(())
            }
        }
    }

    /// Send a message to every registered client that is still connected.
    /// Returns how many clients it was sent to.
    ///
    /// Each target is written from its own task, so a slow client only
    /// delays its own delivery.
    pub async fn broadcast(&self, data: &S::Message) -> ServerResult<usize> {
        self.ensure_live()?;

        let bytes = Bytes::from(self.serialize(data)?);
        let mut sends = JoinSet::new();

        for (session, conn) in self.shared.registry.snapshot().await {
            if !conn.is_open() {
                continue;
            }
            let bytes = bytes.clone();
            sends.spawn(async move { (session, conn.send(&bytes).await) });
        }

        let mut delivered = 0;
        let mut codec_error = None;
        while let Some(joined) = sends.join_next().await {
            let (session, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Broadcast task failed: {}", e);
                    continue;
                }
            };
            match result {
                Ok(()) => delivered += 1,
                Err(ConnectionError::Closed) => {}
                Err(ConnectionError::Codec(e)) => codec_error = Some(e),
                Err(ConnectionError::Io(e)) => {
                    self.fault(Some(session), format!("Broadcast to {} failed: {}", session, e));
                    self.drop_session(session, DisconnectReason::Lost).await;
                }
            }
        }

        if let Some(e) = codec_error {
            return Err(ServerError::Codec(e));
        }

        tracing::debug!("Broadcast {} bytes to {} clients", bytes.len(), delivered);
        Ok(delivered)
    }

    /// Disconnect one client. Returns false if the identifier is unknown.
    pub async fn disconnect(&self, session: SessionId) -> ServerResult<bool> {
        self.ensure_live()?;

        let Some(conn) = self.shared.registry.remove(&session).await else {
            return Ok(false);
        };

        conn.close_with_notice(&SHUTDOWN_SIGNATURE).await;

        tracing::info!("Disconnected client {}", session);
        self.emit(ServerEvent::ClientDisconnected {
            session,
            reason: DisconnectReason::Lost,
        });
        Ok(true)
    }

    /// Remove a session whose peer went away. Only the caller that actually
    /// removes the entry raises the event.
    async fn drop_session(&self, session: SessionId, reason: DisconnectReason) -> bool {
        let Some(conn) = self.shared.registry.remove(&session).await else {
            return false;
        };

        conn.close().await;
        tracing::info!("Client {} disconnected ({})", session, reason);
        self.emit(ServerEvent::ClientDisconnected { session, reason });
        true
    }

    /// Admit one accepted connection
    async fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let session = self.shared.registry.unused_id().await;

        let condition = self.shared.accept_condition.read().await.clone();
        if let Some(condition) = condition {
            if !(*condition)(self, session) {
                tracing::warn!("Rejected connection from {}", addr);
                drop(stream);
                return;
            }
        }

        let _ = stream.set_nodelay(true);
        let (conn, pump) = connection::split(
            stream,
            addr,
            &self.shared.config,
            self.shared.buffer_size.clone(),
        );

        if !self.shared.registry.insert(session, conn.clone()).await {
            tracing::warn!("Session {} already registered, dropping {}", session, addr);
            conn.close().await;
            return;
        }

        tracing::info!("Client {} connected from {}", session, addr);
        self.emit(ServerEvent::ClientConnected { session });

        let sink = ServerSink {
            server: self.clone(),
            session,
        };
        tokio::spawn(connection::drive(pump, sink));

        if let Err(e) = conn.send(&session_assign_frame(session)).await {
            self.fault(
                Some(session),
                format!("Could not assign session {}: {}", session, e),
            );
        }
    }

    async fn deliver(&self, session: SessionId, bytes: &[u8]) {
        let data = match self.shared.serializer.deserialize(bytes) {
            Ok(data) => data,
            Err(e) => {
                self.fault(
                    Some(session),
                    format!(
                        "Dropped undecodable payload from {} ({} bytes): {}",
                        session,
                        bytes.len(),
                        e
                    ),
                );
                return;
            }
        };

        let processor = self.shared.processor.read().await.clone();
        match processor {
            Some(processor) => processor.process_received(data, session).await,
            None => self.emit(ServerEvent::DataReceived { session, data }),
        }
    }
}

/// Frame sink of one client connection's receive pump
struct ServerSink<S: Serializer> {
    server: ServerHandle<S>,
    session: SessionId,
}

#[async_trait]
impl<S: Serializer> FrameSink for ServerSink<S> {
    async fn on_frame(&self, frame: Frame) -> PumpControl {
        match frame {
            Frame::Shutdown => {
                tracing::debug!("Client {} sent shutdown", self.session);
                self.server
                    .drop_session(self.session, DisconnectReason::Lost)
                    .await;
                PumpControl::Stop
            }
            Frame::SessionAssign(_) => {
                tracing::warn!("Ignoring session assignment sent by client {}", self.session);
                PumpControl::Continue
            }
            Frame::Payload(bytes) => {
                if !self.server.shared.registry.contains(&self.session).await {
                    return PumpControl::Stop;
                }
                tracing::debug!("Received {} bytes from {}", bytes.len(), self.session);
                self.server.deliver(self.session, &bytes).await;
                PumpControl::Continue
            }
        }
    }

    async fn on_peer_closed(&self) {
        self.server
            .drop_session(self.session, DisconnectReason::Lost)
            .await;
    }

    async fn on_fault(&self, error: ConnectionError) {
        self.server.fault(
            Some(self.session),
            format!("Connection to {} failed: {}", self.session, error),
        );
        self.server
            .drop_session(self.session, DisconnectReason::Lost)
            .await;
    }

    fn keep_running(&self) -> bool {
        self.server.is_running()
    }
}

/// SessionLink Server
///
/// Generic over the [`Serializer`] that turns messages into payload bytes;
/// the default is plain byte buffers.
pub struct Server<S: Serializer = RawBytes> {
    handle: ServerHandle<S>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::UnboundedReceiver<ServerEvent<S::Message>>>,
    /// Shutdown signal for the accept loop
    shutdown_tx: Option<mpsc::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

/// A server exchanging plain byte buffers
pub type ByteServer = Server<RawBytes>;

impl<S: Serializer> Server<S> {
    /// Create a new server
    pub fn new(config: NetworkConfig, serializer: S) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = ServerShared {
            buffer_size: Arc::new(AtomicUsize::new(config.buffer_size)),
            config,
            serializer,
            registry: SessionRegistry::new(),
            processor: RwLock::new(None),
            accept_condition: RwLock::new(None),
            event_tx,
            local_addr: RwLock::new(None),
            running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        };

        Self {
            handle: ServerHandle {
                shared: Arc::new(shared),
            },
            event_rx: Some(event_rx),
            shutdown_tx: None,
            accept_task: None,
        }
    }

    /// Create a new server that only admits connections `condition` accepts
    pub fn with_accept_condition(
        config: NetworkConfig,
        serializer: S,
        condition: AcceptCondition<S>,
    ) -> Self {
        let server = Self::new(config, serializer);
        if let Ok(mut slot) = server.handle.shared.accept_condition.try_write() {
            *slot = Some(condition);
        }
        server
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent<S::Message>>> {
        self.event_rx.take()
    }

    /// A cloneable handle for sending and disconnecting from elsewhere
    pub fn handle(&self) -> ServerHandle<S> {
        self.handle.clone()
    }

    pub fn port(&self) -> u16 {
        self.handle.port()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.handle.shared.config
    }

    /// The address actually bound while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.handle.shared.local_addr.read().await
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.shared.disposed.load(Ordering::SeqCst)
    }

    pub fn buffer_size(&self) -> ServerResult<usize> {
        self.handle.ensure_live()?;
        Ok(self.handle.shared.buffer_size.load(Ordering::SeqCst))
    }

    /// Resize the receive buffers. Each pump applies it before its next receive.
    pub fn set_buffer_size(&self, size: usize) -> ServerResult<()> {
        self.handle.ensure_live()?;
        self.handle.shared.buffer_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    pub async fn data_processor(&self) -> ServerResult<Option<Arc<dyn ServerDataProcessor<S::Message>>>> {
        self.handle.ensure_live()?;
        Ok(self.handle.shared.processor.read().await.clone())
    }

    pub async fn set_data_processor(
        &self,
        processor: Option<Arc<dyn ServerDataProcessor<S::Message>>>,
    ) -> ServerResult<()> {
        self.handle.ensure_live()?;
        *self.handle.shared.processor.write().await = processor;
        Ok(())
    }

    pub async fn accept_condition(&self) -> ServerResult<Option<AcceptCondition<S>>> {
        self.handle.ensure_live()?;
        Ok(self.handle.shared.accept_condition.read().await.clone())
    }

    pub async fn set_accept_condition(&self, condition: AcceptCondition<S>) -> ServerResult<()> {
        self.handle.ensure_live()?;
        *self.handle.shared.accept_condition.write().await = Some(condition);
        Ok(())
    }

    /// Identifiers of all registered clients
    pub async fn clients(&self) -> ServerResult<Vec<SessionId>> {
        self.handle.clients().await
    }

    /// Start the server. Starting a running server does nothing.
    pub async fn start(&mut self) -> ServerResult<()> {
        self.handle.ensure_live()?;
        if self.is_running() {
            return Ok(());
        }

        let shared = &self.handle.shared;
        let ip = shared
            .config
            .bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let bind_addr = SocketAddr::new(ip, shared.config.port);

        let listener = bind(bind_addr, shared.config.backlog).map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        shared.registry.clear().await;
        *shared.local_addr.write().await = Some(local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        shared.running.store(true, Ordering::SeqCst);

        self.handle.emit(ServerEvent::Started {
            bind_addr: local_addr,
        });

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.handle.clone(),
            shutdown_rx,
        )));

        Ok(())
    }

    /// Stop the server: every client gets a shutdown frame and is closed,
    /// then the listener goes away. Stopping a stopped server does nothing.
    pub async fn stop(&mut self) -> ServerResult<()> {
        self.handle.ensure_live()?;
        self.shutdown().await;
        Ok(())
    }

    /// Send a message to one client
    pub async fn send(&self, data: &S::Message, session: SessionId) -> ServerResult<()> {
        self.handle.send(data, session).await
    }

    /// Send a message to every connected client
    pub async fn broadcast(&self, data: &S::Message) -> ServerResult<usize> {
        self.handle.broadcast(data).await
    }

    /// Disconnect one client. Returns false if the identifier is unknown.
    pub async fn disconnect(&self, session: SessionId) -> ServerResult<bool> {
        self.handle.disconnect(session).await
    }

    /// Stop if running, then dispose. Idempotent.
    pub async fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }
        self.shutdown().await;
        self.handle.shared.disposed.store(true, Ordering::SeqCst);
    }

    async fn shutdown(&mut self) {
        let shared = self.handle.shared.clone();
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Server shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop ended abnormally: {}", e);
            }
        }

        let mut closing = JoinSet::new();
        for (session, conn) in shared.registry.drain().await {
            closing.spawn(async move {
                conn.close_with_notice(&SHUTDOWN_SIGNATURE).await;
                session
            });
        }
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok(session) => self.handle.emit(ServerEvent::ClientDisconnected {
                    session,
                    reason: DisconnectReason::Closed,
                }),
                Err(e) => tracing::error!("Closing a client failed: {}", e),
            }
        }

        *shared.local_addr.write().await = None;
        self.handle.emit(ServerEvent::Stopped);
        tracing::info!("Server stopped");
    }
}

impl<S: Serializer> Drop for Server<S> {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        shared.disposed.store(true, Ordering::SeqCst);
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (_, conn) in shared.registry.try_drain() {
            conn.abort();
        }
    }
}

/// Bind a listening socket with an explicit backlog
fn bind(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn accept_loop<S: Serializer>(
    listener: TcpListener,
    server: ServerHandle<S>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    while server.is_running() {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::debug!("New connection from {}", addr);
                        server.admit(stream, addr).await;
                    }
                    Err(e) => {
                        server.fault(None, format!("Accept error: {}", e));
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
    tracing::debug!("Accept loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(NetworkConfig::new(8080, 8192), RawBytes);

        assert_eq!(server.port(), 8080);
        assert_eq!(server.buffer_size().unwrap(), 8192);
        assert!(server.data_processor().await.unwrap().is_none());
        assert!(server.accept_condition().await.unwrap().is_none());
        assert!(!server.is_running());
        assert!(server.clients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let mut server = Server::new(NetworkConfig::new(0, 1024), RawBytes);
        let mut events = server.take_event_receiver().unwrap();

        server.start().await.unwrap();
        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(server.local_addr().await.is_some());

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(server.local_addr().await.is_none());

        assert!(matches!(events.recv().await, Some(ServerEvent::Started { .. })));
        assert!(matches!(events.recv().await, Some(ServerEvent::Stopped)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let mut first = Server::new(NetworkConfig::new(0, 1024), RawBytes);
        first.start().await.unwrap();
        let port = first.local_addr().await.unwrap().port();

        // SO_REUSEADDR does not allow a second listener on a port in use.
        let mut second = Server::new(NetworkConfig::new(port, 1024), RawBytes);
        let result = second.start().await;
        assert!(matches!(result, Err(ServerError::BindFailed(_))));
        assert!(!second.is_running());

        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let server = Server::new(NetworkConfig::new(0, 1024), RawBytes);
        let ghost = SessionId::new_v4();

        assert!(!server.disconnect(ghost).await.unwrap());
        assert!(matches!(
            server.send(&vec![1, 2], ghost).await,
            Err(ServerError::KeyNotFound(id)) if id == ghost
        ));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let mut server = Server::new(NetworkConfig::new(0, 1024), RawBytes);
        server.start().await.unwrap();

        server.dispose().await;
        server.dispose().await;
        assert!(server.is_disposed());
        assert!(!server.is_running());

        assert!(matches!(server.clients().await, Err(ServerError::ObjectDisposed)));
        assert!(matches!(server.start().await, Err(ServerError::ObjectDisposed)));
        assert!(matches!(
            server.broadcast(&vec![1]).await,
            Err(ServerError::ObjectDisposed)
        ));
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::Closed.to_string(), "closed");
        assert_eq!(DisconnectReason::Lost.to_string(), "lost");
    }
}
