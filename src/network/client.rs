//! SessionLink Client
//!
//! Connects to a SessionLink server, waits for its session identifier and
//! exchanges messages with it.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use super::connection::{self, ConnectionError, ConnectionHandle, FrameSink, PumpControl};
use super::{ClientDataProcessor, NetworkConfig};
use crate::protocol::{CodecError, Frame, RawBytes, Serializer, SessionId, SHUTDOWN_SIGNATURE};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Could not connect after {attempts} attempts")]
    MaximumAttemptsExceeded { attempts: u32 },

    #[error("Client has been disposed")]
    ObjectDisposed,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent<T> {
    /// The server assigned this client its session identifier
    ConnectionEstablished { session: SessionId },
    /// The connection to the server is gone
    ConnectionClosed,
    /// Received a message from the server (only without a data processor)
    DataReceived { data: T },
    /// A transport or decoding problem that did not surface to a caller
    Fault { message: String },
}

type ClientProcessor<S> = Arc<dyn ClientDataProcessor<<S as Serializer>::Message>>;

/// State shared between the client and its receive pump
struct ClientShared<S: Serializer> {
    config: NetworkConfig,
    serializer: S,
    buffer_size: Arc<AtomicUsize>,
    session_id: RwLock<Option<SessionId>>,
    connection: RwLock<Option<ConnectionHandle>>,
    processor: RwLock<Option<ClientProcessor<S>>>,
    event_tx: mpsc::UnboundedSender<ClientEvent<S::Message>>,
    disposed: AtomicBool,
}

impl<S: Serializer> ClientShared<S> {
    fn ensure_live(&self) -> ClientResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::ObjectDisposed);
        }
        Ok(())
    }

    fn emit(&self, event: ClientEvent<S::Message>) {
        let _ = self.event_tx.send(event);
    }

    fn fault(&self, message: String) {
        tracing::warn!("{}", message);
        self.emit(ClientEvent::Fault { message });
    }

    /// Close the connection (if any) and leave the client disposed.
    /// Only the call that actually takes the connection raises the event.
    async fn teardown(&self, raise_event: bool, notify_peer: bool) {
        let connection = self.connection.write().await.take();

        if let Some(conn) = connection {
            if notify_peer {
                conn.close_with_notice(&SHUTDOWN_SIGNATURE).await;
            } else {
                conn.close().await;
            }
            tracing::info!("Disconnected from {}", conn.remote_addr());

            if raise_event {
                self.emit(ClientEvent::ConnectionClosed);
            }
        }

        self.disposed.store(true, Ordering::SeqCst);
    }

    async fn deliver(&self, bytes: &[u8]) {
        let data = match self.serializer.deserialize(bytes) {
            Ok(data) => data,
            Err(e) => {
                self.fault(format!("Dropped undecodable payload ({} bytes): {}", bytes.len(), e));
                return;
            }
        };

        let processor = self.processor.read().await.clone();
        match processor {
            Some(processor) => processor.process_received(data).await,
            None => self.emit(ClientEvent::DataReceived { data }),
        }
    }
}

/// Frame sink of the client's receive pump
struct ClientSink<S: Serializer> {
    shared: Arc<ClientShared<S>>,
}

#[async_trait]
impl<S: Serializer> FrameSink for ClientSink<S> {
    async fn on_frame(&self, frame: Frame) -> PumpControl {
        match frame {
            Frame::SessionAssign(session) => {
                tracing::info!("Assigned session {}", session);
                *self.shared.session_id.write().await = Some(session);
                self.shared
                    .emit(ClientEvent::ConnectionEstablished { session });
                PumpControl::Continue
            }
            Frame::Shutdown => {
                tracing::info!("Server requested shutdown");
                self.shared.teardown(true, false).await;
                PumpControl::Stop
            }
            Frame::Payload(bytes) => {
                tracing::debug!("Received {} bytes from server", bytes.len());
                self.shared.deliver(&bytes).await;
                PumpControl::Continue
            }
        }
    }

    async fn on_peer_closed(&self) {
        self.shared.teardown(true, false).await;
    }

    async fn on_fault(&self, error: ConnectionError) {
        self.shared.fault(format!("Connection to server failed: {}", error));
        self.shared.teardown(true, false).await;
    }

    fn keep_running(&self) -> bool {
        !self.shared.disposed.load(Ordering::SeqCst)
    }
}

/// SessionLink Client
///
/// Generic over the [`Serializer`] that turns messages into payload bytes;
/// the default is plain byte buffers.
pub struct Client<S: Serializer = RawBytes> {
    shared: Arc<ClientShared<S>>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent<S::Message>>>,
}

/// A client exchanging plain byte buffers
pub type ByteClient = Client<RawBytes>;

impl<S: Serializer> Client<S> {
    /// Create a new client
    pub fn new(config: NetworkConfig, serializer: S) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(ClientShared {
                buffer_size: Arc::new(AtomicUsize::new(config.buffer_size)),
                config,
                serializer,
                session_id: RwLock::new(None),
                connection: RwLock::new(None),
                processor: RwLock::new(None),
                event_tx,
                disposed: AtomicBool::new(false),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Create a new client that hands every payload to `processor`
    pub fn with_processor(
        config: NetworkConfig,
        serializer: S,
        processor: Arc<dyn ClientDataProcessor<S::Message>>,
    ) -> Self {
        let client = Self::new(config, serializer);
        if let Ok(mut slot) = client.shared.processor.try_write() {
            *slot = Some(processor);
        }
        client
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent<S::Message>>> {
        self.event_rx.take()
    }

    /// Port the client connects to
    pub fn port(&self) -> u16 {
        self.shared.config.port
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn buffer_size(&self) -> ClientResult<usize> {
        self.shared.ensure_live()?;
        Ok(self.shared.buffer_size.load(Ordering::SeqCst))
    }

    /// Resize the receive buffer. Takes effect before the next receive.
    pub fn set_buffer_size(&self, size: usize) -> ClientResult<()> {
        self.shared.ensure_live()?;
        self.shared.buffer_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    pub async fn data_processor(&self) -> ClientResult<Option<Arc<dyn ClientDataProcessor<S::Message>>>> {
        self.shared.ensure_live()?;
        Ok(self.shared.processor.read().await.clone())
    }

    pub async fn set_data_processor(
        &self,
        processor: Option<Arc<dyn ClientDataProcessor<S::Message>>>,
    ) -> ClientResult<()> {
        self.shared.ensure_live()?;
        *self.shared.processor.write().await = processor;
        Ok(())
    }

    /// The identifier the server assigned, once the connection is established
    pub async fn session_id(&self) -> ClientResult<Option<SessionId>> {
        self.shared.ensure_live()?;
        Ok(*self.shared.session_id.read().await)
    }

    /// Connected means: the socket is open and the server assigned a session
    pub async fn is_connected(&self) -> ClientResult<bool> {
        self.shared.ensure_live()?;
        let has_session = self.shared.session_id.read().await.is_some();
        let open = self
            .shared
            .connection
            .read()
            .await
            .as_ref()
            .map(|conn| conn.is_open())
            .unwrap_or(false);
        Ok(has_session && open)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Connect to a server on the configured port.
    ///
    /// Makes up to `max_connect_attempts` attempts back to back. Returns once
    /// the TCP connection is up; [`ClientEvent::ConnectionEstablished`]
    /// follows when the session identifier arrives.
    pub async fn connect(&self, address: IpAddr) -> ClientResult<()> {
        self.shared.ensure_live()?;

        if address.is_unspecified() {
            return Err(ClientError::InvalidArgument(format!(
                "cannot connect to unspecified address {}",
                address
            )));
        }

        if self.has_open_connection().await {
            return Ok(());
        }

        let server_addr = SocketAddr::new(address, self.port());
        let attempts = self.shared.config.max_connect_attempts;
        tracing::info!("Connecting to {}", server_addr);

        let mut stream = None;
        for attempt in 1..=attempts {
            match self.attempt_connect(server_addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    tracing::debug!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                }
            }
        }

        let stream = stream.ok_or(ClientError::MaximumAttemptsExceeded { attempts })?;
        let _ = stream.set_nodelay(true);

        let (handle, pump) = connection::split(
            stream,
            server_addr,
            &self.shared.config,
            self.shared.buffer_size.clone(),
        );

        {
            let mut slot = self.shared.connection.write().await;
            if self.shared.disposed.load(Ordering::SeqCst) {
                handle.close().await;
                return Err(ClientError::ObjectDisposed);
            }
            if slot.as_ref().map(|conn| conn.is_open()).unwrap_or(false) {
                // Someone else connected while we were dialing.
                handle.close().await;
                return Ok(());
            }
            *slot = Some(handle);
        }
        *self.shared.session_id.write().await = None;

        tracing::info!("Connected to {}, awaiting session", server_addr);

        let sink = ClientSink {
            shared: self.shared.clone(),
        };
        tokio::spawn(connection::drive(pump, sink));

        Ok(())
    }

    /// Connect to a server by hostname
    pub async fn connect_host(&self, hostname: &str) -> ClientResult<()> {
        self.shared.ensure_live()?;

        if hostname.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "hostname must not be empty".to_string(),
            ));
        }

        let addr = super::resolve_host(hostname, self.port()).await?;
        self.connect(addr.ip()).await
    }

    /// Disconnect from the server, raising [`ClientEvent::ConnectionClosed`]
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.disconnect_with(true).await
    }

    /// Disconnect from the server. The client is disposed afterwards;
    /// calling this again is a no-op.
    pub async fn disconnect_with(&self, raise_event: bool) -> ClientResult<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.shared.teardown(raise_event, true).await;
        Ok(())
    }

    /// Send a message to the server
    pub async fn send(&self, data: &S::Message) -> ClientResult<()> {
        self.shared.ensure_live()?;

        if !self.is_connected().await? {
            return Err(ClientError::NotConnected);
        }

        let bytes = self.shared.serializer.serialize(data)?;
        if bytes.is_empty() {
            return Err(ClientError::InvalidArgument(
                "message serialized to an empty payload".to_string(),
            ));
        }

        let conn = self
            .shared
            .connection
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;

        match conn.send(&bytes).await {
            Ok(()) => Ok(()),
            Err(ConnectionError::Closed) => Err(ClientError::NotConnected),
            Err(ConnectionError::Codec(e)) => Err(ClientError::Codec(e)),
            Err(ConnectionError::Io(e)) => {
                // The failed write aborted the connection, which stops the pump.
                self.shared.fault(format!("Send to server failed: {}", e));
                self.shared.teardown(true, false).await;
                Ok(())
            }
        }
    }

    /// Release the connection without raising events. Idempotent.
    pub async fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        self.shared.teardown(false, false).await;
    }

    async fn has_open_connection(&self) -> bool {
        self.shared
            .connection
            .read()
            .await
            .as_ref()
            .map(|conn| conn.is_open())
            .unwrap_or(false)
    }

    async fn attempt_connect(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let timeout_ms = self.shared.config.connect_timeout_ms;
        if timeout_ms == 0 {
            return TcpStream::connect(addr).await;
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect attempt timed out",
            )),
        }
    }
}

impl<S: Serializer> Drop for Client<S> {
    fn drop(&mut self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.shared.connection.try_write() {
            if let Some(conn) = slot.take() {
                conn.abort();
            }
        }
    }
}
