//! Observer-side session for a como server.
//!
//! [`ComoClient`] owns one TCP connection. A reader task turns incoming frames
//! into [`ClientEvent`]s and a writer task drains outgoing messages, so sends
//! never wait on the reader and vice versa.

use std::io;
use std::net::SocketAddr;

use como_types::Source;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::codec::CodecError;
use crate::protocol::{Frame, Message};
use crate::transport::{ComoCodec, DEFAULT_MAX_FRAME_SIZE};

/// Default capacity of the event queue handed to the owner
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default capacity of the outgoing message queue
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Errors that can occur with the client session
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Connection tuning for [`ComoClient`]
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub max_frame_size: usize,
    pub event_capacity: usize,
    pub outbound_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Event raised for the owner of a [`ComoClient`]
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A source was announced or its value changed.
    ///
    /// Answers to a list request arrive as this event too, so applying it
    /// must be idempotent.
    SourceUpdated(Source),

    /// A source was removed on the server.
    SourceRemoved(Source),

    /// The peer asked for our list of sources.
    ListRequested,

    /// A well-framed message had invalid content and was dropped.
    MessageDropped(CodecError),

    /// The connection is gone. `reason` is set when it ended on an error.
    Disconnected { reason: Option<String> },
}

impl ClientEvent {
    fn from_frame(frame: Frame) -> Self {
        let kind = frame.kind;
        match Message::from_frame(frame) {
            Ok(Message::Source(source)) => ClientEvent::SourceUpdated(source),
            Ok(Message::DeinitSource(source)) => ClientEvent::SourceRemoved(source),
            Ok(Message::GetListOfSources) => ClientEvent::ListRequested,
            Err(e) => {
                warn!("Dropping undecodable {}: {}", kind, e);
                ClientEvent::MessageDropped(e)
            }
        }
    }
}

/// Client session connected to a como server
pub struct ComoClient {
    outbound: mpsc::Sender<Message>,
    events: mpsc::Receiver<ClientEvent>,
    shutdown: CancellationToken,
    _shutdown_guard: DropGuard,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    peer_addr: SocketAddr,
}

impl ComoClient {
    /// Connect to a como server.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the TCP connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        Self::connect_with(addr, ClientOptions::default()).await
    }

    /// Connect to a como server with custom options.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the TCP connection fails.
    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream, options)
    }

    /// Run a client session over an already connected stream.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the peer address cannot be read.
    pub fn from_stream(stream: TcpStream, options: ClientOptions) -> Result<Self, ClientError> {
        let peer_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let codec = ComoCodec::with_max_frame_size(options.max_frame_size);
        let (read_half, write_half) = stream.into_split();
        let stream = FramedRead::new(read_half, codec);
        let sink = FramedWrite::new(write_half, codec);

        let (outbound_tx, outbound_rx) = mpsc::channel(options.outbound_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(options.event_capacity.max(1));
        let (write_error_tx, write_error_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            write_error_tx,
            shutdown.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            stream,
            events_tx,
            write_error_rx,
            shutdown.clone(),
        ));

        debug!("Connected to {}", peer_addr);

        Ok(Self {
            outbound: outbound_tx,
            events: events_rx,
            _shutdown_guard: shutdown.clone().drop_guard(),
            shutdown,
            reader,
            writer,
            peer_addr,
        })
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Ask the server for a snapshot of every live source.
    ///
    /// The answers arrive later as ordinary [`ClientEvent::SourceUpdated`].
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionClosed` once the session has ended.
    pub async fn request_source_list(&self) -> Result<(), ClientError> {
        self.send(Message::GetListOfSources).await
    }

    /// Announce a source to the peer.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionClosed` once the session has ended.
    pub async fn send_source_message(&self, source: &Source) -> Result<(), ClientError> {
        self.send(Message::Source(source.clone())).await
    }

    /// Tell the peer a source was removed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionClosed` once the session has ended.
    pub async fn send_deinit_source_message(&self, source: &Source) -> Result<(), ClientError> {
        self.send(Message::DeinitSource(source.clone())).await
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::ConnectionClosed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Next event from the server, `None` after [`ClientEvent::Disconnected`].
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Flush queued messages and close the connection.
    pub async fn disconnect(self) {
        let Self {
            outbound,
            events,
            shutdown,
            _shutdown_guard,
            reader,
            writer,
            peer_addr,
        } = self;

        drop(outbound);
        drop(events);
        if let Err(e) = writer.await {
            debug!("Writer task for {} ended abnormally: {}", peer_addr, e);
        }
        shutdown.cancel();
        if let Err(e) = reader.await {
            debug!("Reader task for {} ended abnormally: {}", peer_addr, e);
        }
        debug!("Disconnected from {}", peer_addr);
    }
}

/// Drain outgoing messages into the socket.
///
/// A failed write is handed to the reader through `write_error` before the
/// session is cancelled, so the owner sees it in `Disconnected`.
async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, ComoCodec>,
    mut outbound: mpsc::Receiver<Message>,
    write_error: oneshot::Sender<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else {
                    if let Err(e) = SinkExt::<Message>::close(&mut sink).await {
                        debug!("Failed to close connection: {}", e);
                    }
                    break;
                };

                trace!("Sending {}", message.kind());
                if let Err(e) = sink.send(message).await {
                    warn!("Failed to send to server: {}", e);
                    let _ = write_error.send(e.to_string());
                    shutdown.cancel();
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut stream: FramedRead<OwnedReadHalf, ComoCodec>,
    events: mpsc::Sender<ClientEvent>,
    mut write_error: oneshot::Receiver<String>,
    shutdown: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break write_error.try_recv().ok(),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                trace!("Received {} ({} bytes)", frame.kind, frame.payload.len());
                if events.send(ClientEvent::from_frame(frame)).await.is_err() {
                    debug!("Event receiver dropped, closing session");
                    shutdown.cancel();
                    return;
                }
            }
            Some(Err(e)) if e.is_malformed() => {
                warn!("Malformed stream from server, closing: {}", e);
                break Some(e.to_string());
            }
            Some(Err(e)) => {
                warn!("Read error from server: {}", e);
                break Some(e.to_string());
            }
            None => {
                debug!("Server closed the connection");
                break None;
            }
        }
    };

    // Dropping the read half here and the write half in the writer task
    // releases the socket.
    shutdown.cancel();
    let _ = events.send(ClientEvent::Disconnected { reason }).await;
}
