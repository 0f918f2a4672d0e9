//! Client connection state and inbound frame reading.
//!
//! A [`Connection`] is the shared, cheap-to-clone (via `Arc`) half of a
//! client session: it owns the bounded outbound queue drained by the
//! session's writer task, and the close state. [`FrameReader`] is the
//! inbound half, owned by the session task alone.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, Utf8Bytes};
use futures::{Stream, StreamExt};
use huddle_core::{ChatError, ConnectionId, InboundFrame, OutboundFrame, RoomName};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why an outbound frame was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The peer is not draining its queue fast enough; the frame was dropped.
    #[error("send queue full")]
    QueueFull,
    /// The connection is closed; the frame was dropped.
    #[error("connection closed")]
    Closed,
}

/// A connected client bound to one room.
pub struct Connection {
    id: ConnectionId,
    room: RoomName,
    display_name: String,
    tx: mpsc::Sender<Utf8Bytes>,
    closed: AtomicBool,
    close_token: CancellationToken,
    connected_at: Instant,
    /// Set by any inbound activity, cleared by each heartbeat check.
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection around an existing queue sender.
    pub fn new(
        id: ConnectionId,
        room: RoomName,
        display_name: String,
        tx: mpsc::Sender<Utf8Bytes>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            room,
            display_name,
            tx,
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create a connection with a fresh ID and a queue of `capacity` frames.
    pub fn channel(
        room: RoomName,
        display_name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self::new(ConnectionId::new(), room, display_name.into(), tx);
        (conn, rx)
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Room this connection belongs to.
    pub fn room(&self) -> &RoomName {
        &self.room
    }

    /// Display name supplied by the auth collaborator at upgrade time.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Queue a frame for delivery.
    pub fn send(&self, frame: &OutboundFrame) -> Result<(), SendError> {
        self.send_raw(frame.to_json().into())
    }

    /// Queue an already-serialized frame. Never waits.
    ///
    /// A full queue drops the frame and bumps the drop counter; a closed
    /// connection drops it silently.
    pub fn send_raw(&self, payload: Utf8Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Move to the closed state.
    ///
    /// Returns `true` for the single call that performed the transition;
    /// every later call returns `false`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_token.cancel();
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close_token.cancelled()
    }

    /// Token cancelled when the connection closes.
    pub fn close_token(&self) -> CancellationToken {
        self.close_token.clone()
    }

    /// Record inbound activity (any frame, Ping or Pong).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if there was activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound activity (or since connecting).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("display_name", &self.display_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Outcome of one [`FrameReader::receive`] call.
#[derive(Debug)]
pub enum Received {
    /// A well-formed frame.
    Frame(InboundFrame),
    /// A text frame that failed to parse. The connection stays usable.
    Malformed(ChatError),
    /// The peer closed the connection or the stream ended.
    Closed,
    /// The transport failed.
    Error(ChatError),
}

/// Inbound half of a connection.
pub struct FrameReader<S> {
    stream: S,
    connection: std::sync::Arc<Connection>,
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    /// Wrap a message stream for `connection`.
    pub fn new(stream: S, connection: std::sync::Arc<Connection>) -> Self {
        Self { stream, connection }
    }

    /// Wait for the next frame, the peer closing, or a transport error.
    ///
    /// Ping and Pong frames only refresh liveness and are not surfaced.
    pub async fn receive(&mut self) -> Received {
        loop {
            let msg = match self.stream.next().await {
                None => return Received::Closed,
                Some(Err(e)) => return Received::Error(ChatError::Transport(e.to_string())),
                Some(Ok(msg)) => msg,
            };
            self.connection.mark_alive();
            match msg {
                Message::Text(text) => {
                    return match InboundFrame::parse_text(text.as_str()) {
                        Ok(frame) => Received::Frame(frame),
                        Err(e) => Received::Malformed(e),
                    };
                }
                Message::Binary(data) => return Received::Frame(InboundFrame::BinaryPayload(data)),
                Message::Close(_) => return Received::Closed,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }
}
