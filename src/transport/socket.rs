//! Length-prefixed TCP transport.
//!
//! Frame layout: 4-byte big-endian body length, canonical JSON body, then a
//! 4-byte acknowledgement from the receiver (`1` accepted, `0` rejected).

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{MessageDeduplicator, Transport, TransportError, TransportHealth, TransportMessage, TransportStats};

pub const ACK_OK: u32 = 1;
pub const ACK_REJECTED: u32 = 0;

/// Largest body accepted from the wire.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<(), TransportError> {
    if body.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    w.write_u32(body.len() as u32).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean EOF before the length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>, TransportError> {
    let len = match r.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Client side of the socket bridge.
///
/// The connection is opened lazily on first send and dropped on any I/O
/// failure. The transport reports itself connected until a send fails, so a
/// fresh router does not skip it before it has been tried.
pub struct SocketTransport {
    name: String,
    address: String,
    io_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    stats: TransportStats,
}

impl SocketTransport {
    pub fn new(name: impl Into<String>, address: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            io_timeout,
            stream: Mutex::new(None),
            stats: TransportStats::new(true),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TransportError::Connectivity {
                transport: self.name.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(transport = %self.name, address = %self.address, "Socket connected");
        Ok(stream)
    }

    async fn round_trip(
        &self,
        slot: &mut Option<TcpStream>,
        body: &[u8],
        msg_id: &str,
    ) -> Result<(), TransportError> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(TransportError::Connectivity {
                transport: self.name.clone(),
                reason: "no connection".to_string(),
            });
        };
        write_frame(stream, body).await?;
        match stream.read_u32().await? {
            ACK_OK => Ok(()),
            ACK_REJECTED => Err(TransportError::Rejected {
                msg_id: msg_id.to_string(),
            }),
            other => Err(TransportError::Connectivity {
                transport: self.name.clone(),
                reason: format!("unexpected ack {:#010x}", other),
            }),
        }
    }

    /// Write one frame and wait for its acknowledgement.
    async fn exchange(&self, message: &TransportMessage) -> Result<Duration, TransportError> {
        let body = message.encode()?;
        let mut guard = self.stream.lock().await;
        let started = Instant::now();

        let result = tokio::time::timeout(
            self.io_timeout,
            self.round_trip(&mut guard, &body, &message.msg_id),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::Timeout {
                transport: self.name.clone(),
                after: self.io_timeout,
            })
        });

        match result {
            Ok(()) => Ok(started.elapsed()),
            Err(e) => {
                // The stream may hold a half-written frame; never reuse it.
                if !matches!(e, TransportError::Rejected { .. }) {
                    *guard = None;
                }
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &TransportMessage) -> Result<(), TransportError> {
        let latency = self.exchange(message).await?;
        self.stats.record_sent(latency);
        Ok(())
    }

    fn health(&self) -> TransportHealth {
        self.stats.snapshot(&self.name)
    }

    async fn reset(&self) -> Result<(), TransportError> {
        let mut guard = self.stream.lock().await;
        *guard = None;
        match tokio::time::timeout(self.io_timeout, self.connect()).await {
            Ok(Ok(stream)) => {
                *guard = Some(stream);
                self.stats.set_connected(true);
                info!(transport = %self.name, "Socket transport reset");
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.record_error(&e);
                Err(e)
            }
            Err(_) => {
                let e = TransportError::Timeout {
                    transport: self.name.clone(),
                    after: self.io_timeout,
                };
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }

    async fn probe_latency(&self) -> Result<Duration, TransportError> {
        let latency = self.exchange(&TransportMessage::heartbeat()).await?;
        self.stats.set_connected(true);
        self.stats.record_latency(latency);
        Ok(latency)
    }
}

/// Accept socket-bridge connections until `shutdown` is cancelled.
///
/// Every frame is checksum-verified. Accepted frames are acknowledged with
/// [`ACK_OK`] and, unless they are heartbeats or duplicates, forwarded on
/// `tx`. Frames that fail verification are answered with [`ACK_REJECTED`]
/// and dropped.
pub async fn serve_socket_inbound(
    listener: TcpListener,
    dedup: Arc<MessageDeduplicator>,
    tx: mpsc::Sender<TransportMessage>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let local = listener.local_addr()?;
    info!(address = %local, "Socket receiver listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(peer = %peer, "Socket receiver accepted connection");
                let dedup = Arc::clone(&dedup);
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, dedup, tx).await {
                        warn!(peer = %peer, error = %e, "Socket receiver connection closed with error");
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!(address = %local, "Socket receiver stopped");
                return Ok(());
            }
        }
    }
}

async fn handle_inbound(
    mut stream: TcpStream,
    dedup: Arc<MessageDeduplicator>,
    tx: mpsc::Sender<TransportMessage>,
) -> Result<(), TransportError> {
    while let Some(body) = read_frame(&mut stream).await? {
        let message = match TransportMessage::decode_verified(&body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping inbound frame that failed verification");
                stream.write_u32(ACK_REJECTED).await?;
                continue;
            }
        };
        stream.write_u32(ACK_OK).await?;

        if message.is_heartbeat() {
            continue;
        }
        if !dedup.check_and_insert(&message.msg_id) {
            debug!(msg_id = %message.msg_id, "Duplicate inbound message ignored");
            continue;
        }
        if tx.send(message).await.is_err() {
            // Consumer gone
            return Ok(());
        }
    }
    Ok(())
}
