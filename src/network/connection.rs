//! Connection handling for SessionLink
//!
//! A TCP stream is split into two parts:
//! - [`ConnectionHandle`], the cloneable send side, with one in-flight write at a time
//! - [`ReceivePump`], the receive side, which reads, frames and classifies
//!
//! [`drive`] runs a pump to completion against a [`FrameSink`]; clients and
//! servers only differ in the sink they plug in.

use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use super::NetworkConfig;
use crate::protocol::{CodecError, Frame, FrameDecoder, FrameEncoder};

/// Upper bound for writing a control frame right before closing
pub const NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Split an established stream into its send handle and receive pump
pub fn split(
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: &NetworkConfig,
    buffer_size: Arc<AtomicUsize>,
) -> (ConnectionHandle, ReceivePump) {
    let (reader, writer) = stream.into_split();
    let (close_tx, close_rx) = watch::channel(false);

    let write_timeout = match config.write_timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };

    let handle = ConnectionHandle {
        remote_addr,
        writer: Arc::new(Mutex::new(writer)),
        encoder: FrameEncoder::new(config.framing, config.max_message_size),
        write_timeout,
        open: Arc::new(AtomicBool::new(true)),
        close_tx: Arc::new(close_tx),
    };

    let pump = ReceivePump {
        remote_addr,
        reader,
        decoder: FrameDecoder::new(config.framing, config.max_message_size),
        chunk: Vec::new(),
        pending: BytesMut::new(),
        buffer_size,
        closed: close_rx,
    };

    (handle, pump)
}

/// Write and flush one encoded frame, giving up after `limit`
async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    limit: Option<Duration>,
) -> io::Result<()> {
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };

    match limit {
        None => write.await,
        Some(limit) => match tokio::time::timeout(limit, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {:?}", limit),
            )),
        },
    }
}

/// A handle for sending frames to a connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    remote_addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    encoder: FrameEncoder,
    write_timeout: Option<Duration>,
    open: Arc<AtomicBool>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Check if the connection is still open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send one frame. Concurrent callers queue on the writer lock, so at
    /// most one write is in flight per connection.
    ///
    /// Closing the connection cancels a queued or in-flight send. A write
    /// that fails or exceeds the write timeout leaves a partial frame on the
    /// wire, so the connection is aborted.
    pub async fn send(&self, payload: &[u8]) -> ConnectionResult<()> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }

        let mut buf = BytesMut::new();
        self.encoder.encode(payload, &mut buf)?;

        let mut closed = self.close_tx.subscribe();

        let mut writer = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => return Err(ConnectionError::Closed),
            writer = self.writer.lock() => writer,
        };
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }

        let result = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => return Err(ConnectionError::Closed),
            result = write_frame(&mut writer, &buf, self.write_timeout) => result,
        };
        drop(writer);

        if let Err(e) = result {
            self.abort();
            return Err(e.into());
        }
        Ok(())
    }

    /// Mark the connection closed and stop its pump, without touching the
    /// socket. Returns true if this call performed the transition.
    pub fn abort(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if was_open {
            let _ = self.close_tx.send(true);
        }
        was_open
    }

    /// Close the connection: stop the pump and shut the write side down.
    /// Returns true if this call performed the transition.
    pub async fn close(&self) -> bool {
        if !self.abort() {
            return false;
        }

        // Any send holding the writer has been cancelled by the abort.
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Shutdown of {} failed: {}", self.remote_addr, e);
        }
        true
    }

    /// Write `notice` if the writer is free, then close.
    ///
    /// The notice is skipped when another send is in flight and never takes
    /// longer than [`NOTICE_TIMEOUT`], so a peer that stopped reading cannot
    /// hold up the caller.
    pub async fn close_with_notice(&self, notice: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }

        match self.writer.try_lock() {
            Ok(mut writer) => {
                let mut buf = BytesMut::new();
                let written = match self.encoder.encode(notice, &mut buf) {
                    Ok(()) => write_frame(&mut writer, &buf, Some(NOTICE_TIMEOUT))
                        .await
                        .map_err(ConnectionError::from),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = written {
                    tracing::debug!("Could not notify {}: {}", self.remote_addr, e);
                }
            }
            Err(_) => {
                tracing::debug!("Send to {} in flight, closing without notice", self.remote_addr);
            }
        }

        self.close().await
    }
}

/// What a single receive produced
#[derive(Debug)]
pub enum Inbound {
    /// One complete, classified frame
    Frame(Frame),
    /// The peer closed its side of the stream
    PeerClosed,
    /// This side closed the connection through its handle
    LocalClosed,
}

/// The receive side of a connection
#[derive(Debug)]
pub struct ReceivePump {
    remote_addr: SocketAddr,
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    /// Reusable receive buffer, resized only between reads
    chunk: Vec<u8>,
    /// Bytes read but not yet assembled into a frame
    pending: BytesMut,
    buffer_size: Arc<AtomicUsize>,
    closed: watch::Receiver<bool>,
}

impl ReceivePump {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Receive the next frame
    pub async fn recv(&mut self) -> ConnectionResult<Inbound> {
        loop {
            if let Some(bytes) = self.decoder.decode(&mut self.pending)? {
                return Ok(Inbound::Frame(Frame::classify(bytes)));
            }

            if *self.closed.borrow() {
                return Ok(Inbound::LocalClosed);
            }

            // A zero-sized buffer could never make progress.
            let size = self.buffer_size.load(Ordering::SeqCst).max(1);
            if self.chunk.len() != size {
                self.chunk.resize(size, 0);
            }

            let n = tokio::select! {
                biased;
                _ = self.closed.wait_for(|closed| *closed) => {
                    return Ok(Inbound::LocalClosed);
                }
                result = self.reader.read(&mut self.chunk) => result?,
            };

            if n == 0 {
                if !self.pending.is_empty() {
                    tracing::debug!(
                        "{} closed with {} bytes of an incomplete frame",
                        self.remote_addr,
                        self.pending.len()
                    );
                }
                return Ok(Inbound::PeerClosed);
            }

            self.pending.extend_from_slice(&self.chunk[..n]);
            self.chunk[..n].fill(0);
        }
    }
}

/// Whether the pump should keep receiving after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpControl {
    Continue,
    Stop,
}

/// Receives everything a pump produces
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn on_frame(&self, frame: Frame) -> PumpControl;

    /// The peer went away without a shutdown frame
    async fn on_peer_closed(&self);

    /// A transport or framing error ended the pump
    async fn on_fault(&self, error: ConnectionError);

    /// Checked before every receive
    fn keep_running(&self) -> bool {
        true
    }
}

/// Run a pump until its connection ends or the sink stops it
pub async fn drive<K: FrameSink>(mut pump: ReceivePump, sink: K) {
    let remote = pump.remote_addr();

    while sink.keep_running() {
        match pump.recv().await {
            Ok(Inbound::Frame(frame)) => {
                if sink.on_frame(frame).await == PumpControl::Stop {
                    break;
                }
            }
            Ok(Inbound::PeerClosed) => {
                tracing::debug!("{} closed the connection", remote);
                sink.on_peer_closed().await;
                break;
            }
            Ok(Inbound::LocalClosed) => {
                break;
            }
            Err(e) => {
                tracing::warn!("Receive from {} failed: {}", remote, e);
                sink.on_fault(e).await;
                break;
            }
        }
    }

    tracing::debug!("Receive pump for {} finished", remote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FramingMode, SHUTDOWN_SIGNATURE};
    use tokio::net::TcpListener;

    async fn pair(config: &NetworkConfig) -> ((ConnectionHandle, ReceivePump), (ConnectionHandle, ReceivePump)) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, server_peer) = accepted.unwrap();

        let size = Arc::new(AtomicUsize::new(config.buffer_size));
        (
            split(client, addr, config, size.clone()),
            split(server, server_peer, config, size),
        )
    }

    #[tokio::test]
    async fn test_send_and_receive_frames() {
        let config = NetworkConfig::default();
        let ((a, _a_pump), (_b, mut b_pump)) = pair(&config).await;

        a.send(b"first").await.unwrap();
        a.send(&SHUTDOWN_SIGNATURE).await.unwrap();

        match b_pump.recv().await.unwrap() {
            Inbound::Frame(Frame::Payload(bytes)) => assert_eq!(&bytes[..], b"first"),
            other => panic!("Unexpected {:?}", other),
        }
        assert!(matches!(
            b_pump.recv().await.unwrap(),
            Inbound::Frame(Frame::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_small_buffer_still_assembles_frames() {
        let config = NetworkConfig::default().with_buffer_size(3);
        let ((a, _a_pump), (_b, mut b_pump)) = pair(&config).await;

        let payload: Vec<u8> = (0..200).collect();
        a.send(&payload).await.unwrap();

        match b_pump.recv().await.unwrap() {
            Inbound::Frame(Frame::Payload(bytes)) => assert_eq!(bytes.to_vec(), payload),
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_raw_mode_frame_is_one_read() {
        let config = NetworkConfig::default().with_framing(FramingMode::Raw);
        let ((a, _a_pump), (_b, mut b_pump)) = pair(&config).await;

        a.send(&[1, 2, 3, 4]).await.unwrap();

        match b_pump.recv().await.unwrap() {
            Inbound::Frame(Frame::Payload(bytes)) => assert_eq!(&bytes[..], &[1, 2, 3, 4]),
            other => panic!("Unexpected {:?}", other),
        }
    }

    /// More than loopback socket buffers hold while nobody reads
    const STALL_LEN: usize = 32 * 1024 * 1024;

    fn stalling_config() -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.max_message_size = 2 * STALL_LEN;
        config
    }

    #[tokio::test]
    async fn test_close_cancels_stalled_send() {
        let config = stalling_config().with_write_timeout_ms(0);
        let ((a, _a_pump), (_b, _b_pump)) = pair(&config).await;

        // Nobody reads on the other side, so this write fills the socket buffers.
        let sender = a.clone();
        let stalled = tokio::spawn(async move { sender.send(&vec![7u8; STALL_LEN]).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let closed = tokio::time::timeout(Duration::from_secs(5), a.close_with_notice(&SHUTDOWN_SIGNATURE))
            .await
            .expect("close waited on the stalled send");
        assert!(closed);

        let result = tokio::time::timeout(Duration::from_secs(5), stalled)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_write_timeout_aborts_connection() {
        let config = stalling_config().with_write_timeout_ms(200);
        let ((a, mut a_pump), (_b, _b_pump)) = pair(&config).await;

        let result = tokio::time::timeout(Duration::from_secs(5), a.send(&vec![7u8; STALL_LEN]))
            .await
            .unwrap();
        match result {
            Err(ConnectionError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("Unexpected {:?}", other),
        }
        assert!(!a.is_open());
        assert!(matches!(a_pump.recv().await.unwrap(), Inbound::LocalClosed));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_both_sides() {
        let config = NetworkConfig::default();
        let ((a, mut a_pump), (_b, mut b_pump)) = pair(&config).await;

        assert!(a.close().await);
        assert!(!a.close().await);
        assert!(!a.is_open());

        assert!(matches!(a_pump.recv().await.unwrap(), Inbound::LocalClosed));
        assert!(matches!(b_pump.recv().await.unwrap(), Inbound::PeerClosed));
        assert!(matches!(a.send(b"late").await, Err(ConnectionError::Closed)));
    }
}
