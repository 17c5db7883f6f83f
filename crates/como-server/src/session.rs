//! Server side of one observer connection.
//!
//! A session attaches to the registry, forwards every registry change to its
//! socket through a send task, and answers list requests. It ends when the
//! observer disconnects, the stream turns out malformed, the registry drops it
//! for falling behind, or the server shuts down.

use std::fmt;

use como_protocol::{ComoCodec, DEFAULT_MAX_FRAME_SIZE, Frame, FrameError, Message};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_OUTBOUND_BUFFER, ServerConfig};
use crate::registry::SourceRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub max_frame_size: usize,
    pub outbound_buffer: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl From<&ServerConfig> for SessionOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            outbound_buffer: config.outbound_buffer,
        }
    }
}

/// Why a session ended
#[derive(Debug)]
pub enum CloseReason {
    /// The observer closed the connection.
    PeerClosed,
    /// The observer sent bytes that cannot be framed.
    Malformed(FrameError),
    /// Reading from the socket failed.
    Transport(FrameError),
    /// The outbound side stopped: the registry dropped the session or a
    /// write failed.
    Detached,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Malformed(e) => write!(f, "malformed stream: {e}"),
            CloseReason::Transport(e) => write!(f, "transport error: {e}"),
            CloseReason::Detached => write!(f, "detached"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Serve one observer until the connection ends.
pub async fn run_session(
    stream: TcpStream,
    registry: SourceRegistry,
    options: SessionOptions,
    shutdown: CancellationToken,
) -> CloseReason {
    let framed = Framed::new(stream, ComoCodec::with_max_frame_size(options.max_frame_size));
    let (mut sink, mut stream) = framed.split::<Frame>();

    let session_id = SessionId::new();
    debug!("New connection: {}", session_id);

    let (tx, mut rx) = mpsc::channel::<Frame>(options.outbound_buffer.max(1));
    let detached = CancellationToken::new();
    registry.attach(session_id.clone(), tx, detached.clone());

    let session_id_clone = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        trace!("[{}] send_task started", session_id_clone);
        while let Some(frame) = rx.recv().await {
            trace!(
                "[{}] send_task: sending {} ({} bytes)",
                session_id_clone,
                frame.kind,
                frame.payload.len()
            );
            if let Err(e) = sink.send(frame).await {
                warn!("Failed to send to {}: {}", session_id_clone, e);
                return;
            }
        }
        if let Err(e) = sink.close().await {
            debug!("[{}] Failed to close connection: {}", session_id_clone, e);
        }
        trace!("[{}] send_task ended", session_id_clone);
    });

    let reason = loop {
        tokio::select! {
            () = shutdown.cancelled() => break CloseReason::Shutdown,
            () = detached.cancelled() => break CloseReason::Detached,
            _ = &mut send_task => break CloseReason::Detached,
            next = stream.next() => match next {
                Some(Ok(frame)) => handle_frame(&session_id, &registry, frame),
                Some(Err(e)) if e.is_malformed() => break CloseReason::Malformed(e),
                Some(Err(e)) => break CloseReason::Transport(e),
                None => break CloseReason::PeerClosed,
            },
        }
    };

    registry.detach(&session_id);
    send_task.abort();

    match &reason {
        CloseReason::Malformed(_) | CloseReason::Transport(_) => {
            warn!("Connection closed: {} ({})", session_id, reason);
        }
        _ => debug!("Connection closed: {} ({})", session_id, reason),
    }
    reason
}

fn handle_frame(session_id: &SessionId, registry: &SourceRegistry, frame: Frame) {
    let kind = frame.kind;
    match Message::from_frame(frame) {
        Ok(Message::GetListOfSources) => {
            let sent = registry.send_snapshot_to(session_id);
            debug!("[{}] Answered list request with {} sources", session_id, sent);
        }
        // The instrumented side owns the registry; observers cannot publish.
        Ok(message) => debug!("[{}] Ignoring {} from observer", session_id, message.kind()),
        Err(e) => warn!("[{}] Dropping undecodable {}: {}", session_id, kind, e),
    }
}
