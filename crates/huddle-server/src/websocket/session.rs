//! WebSocket session lifecycle: one task per client, from upgrade through
//! disconnect.
//!
//! 1. Create the [`Connection`] and join its room
//! 2. Spawn the writer (drains the send queue, sends Pings) and the heartbeat
//! 3. Read frames through the [`FileProtocol`] and route completed units
//! 4. On any exit path: close once, leave the room once, flush and send Close
//!
//! The loop is generic over the message stream and sink so it can run over
//! an Axum `WebSocket` or an in-memory channel pair.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream};
use huddle_core::{ChatError, OutboundFrame, RoomName};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::broadcast::BroadcastDispatcher;
use super::connection::{Connection, FrameReader, Received};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::protocol::FileProtocol;
use super::router::{MessageRouter, Routed};
use crate::config::ServerConfig;
use crate::metrics::{
    FRAMES_RECEIVED_TOTAL, HEARTBEAT_TIMEOUTS_TOTAL, PROTOCOL_ERRORS_TOTAL,
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::room::RoomRegistry;
use crate::storage::FileStore;

/// How long cleanup waits for the writer to flush and send Close.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs besides its socket.
pub struct SessionContext {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Room membership.
    pub registry: Arc<RoomRegistry>,
    /// Room fan-out.
    pub dispatcher: BroadcastDispatcher,
    /// Message formatting and file storage.
    pub router: MessageRouter,
    /// Cancelled on server shutdown.
    pub shutdown: CancellationToken,
}

impl SessionContext {
    /// Wire up the dispatcher and router around a shared registry.
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<RoomRegistry>,
        store: Arc<dyn FileStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            dispatcher: BroadcastDispatcher::new(registry.clone()),
            router: MessageRouter::new(store, config.timestamps),
            config,
            registry,
            shutdown,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent Close or the stream ended.
    PeerClosed,
    /// Reading from the transport failed.
    TransportError,
    /// The client broke the frame protocol.
    ProtocolViolation,
    /// The server closed the connection (heartbeat timeout, eviction or a
    /// failed write).
    ClosedByServer,
    /// The server is shutting down.
    Shutdown,
}

impl SessionEnd {
    /// Metric / log label.
    pub fn label(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::TransportError => "transport_error",
            Self::ProtocolViolation => "protocol_violation",
            Self::ClosedByServer => "closed_by_server",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run a session for a client already admitted to `room` as `display_name`.
#[instrument(skip_all, fields(room = %room, conn_id = tracing::field::Empty))]
pub async fn run_session<S, E, K>(
    stream: S,
    sink: K,
    room: RoomName,
    display_name: String,
    ctx: Arc<SessionContext>,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Display + Send,
{
    let (conn, rx) = Connection::channel(room.clone(), display_name, ctx.config.send_queue_capacity);
    let conn = Arc::new(conn);
    let _ = tracing::Span::current().record("conn_id", tracing::field::display(conn.id()));

    let joined = match ctx.registry.join(&room, conn.clone()) {
        Ok(joined) => joined,
        Err(e) => {
            warn!(error = %e, "failed to join room");
            return SessionEnd::ClosedByServer;
        }
    };
    info!(display_name = conn.display_name(), members = joined.members(), "client joined");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        conn.clone(),
        ctx.registry.clone(),
        ctx.config.heartbeat_interval(),
    ));
    drop(tokio::spawn(watch_heartbeat(
        conn.clone(),
        ctx.registry.clone(),
        ctx.config.heartbeat_interval(),
        ctx.config.heartbeat_timeout(),
    )));

    let end = read_loop(stream, &conn, &ctx).await;

    let _ = ctx.registry.disconnect(&conn);
    let writer_abort = writer.abort_handle();
    if time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("writer did not drain in time, aborting");
        writer_abort.abort();
    }

    let age = conn.age();
    info!(
        reason = end.label(),
        dropped = conn.drop_count(),
        duration_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => end.label()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(age.as_secs_f64());
    end
}

async fn read_loop<S, E>(stream: S, conn: &Arc<Connection>, ctx: &SessionContext) -> SessionEnd
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut reader = FrameReader::new(stream, conn.clone());
    let mut protocol = FileProtocol::new(ctx.config.max_file_bytes);

    loop {
        let received = tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => return SessionEnd::Shutdown,
            () = conn.closed() => return SessionEnd::ClosedByServer,
            received = reader.receive() => received,
        };

        let frame = match received {
            Received::Frame(frame) => frame,
            Received::Malformed(err) => {
                if reject(conn, &protocol.reject_malformed(err)) {
                    return SessionEnd::ProtocolViolation;
                }
                continue;
            }
            Received::Closed => return SessionEnd::PeerClosed,
            Received::Error(err) => {
                debug!(error = %err, "transport error");
                return SessionEnd::TransportError;
            }
        };
        counter!(FRAMES_RECEIVED_TOTAL, "kind" => frame.kind()).increment(1);

        let unit = match protocol.advance(frame) {
            Ok(Some(unit)) => unit,
            Ok(None) => continue,
            Err(err) => {
                if reject(conn, &err) {
                    return SessionEnd::ProtocolViolation;
                }
                continue;
            }
        };

        match ctx.router.route(conn.room(), conn.display_name(), unit).await {
            Ok(Routed::Broadcast(frame)) => {
                let _ = ctx.dispatcher.broadcast(conn.room(), &frame);
            }
            Ok(Routed::Ignored) => {}
            Err(err) => {
                if reject(conn, &err) {
                    return SessionEnd::ProtocolViolation;
                }
            }
        }
    }
}

/// Send `err` to this client only. Returns whether it ends the session.
fn reject(conn: &Connection, err: &ChatError) -> bool {
    counter!(PROTOCOL_ERRORS_TOTAL, "code" => err.code()).increment(1);
    let fatal = err.is_fatal();
    if fatal {
        warn!(code = err.code(), error = %err, "protocol violation, closing connection");
    } else {
        debug!(code = err.code(), error = %err, "rejected frame");
    }
    if let Err(e) = conn.send(&OutboundFrame::from(err)) {
        debug!(error = %e, "could not queue error frame");
    }
    fatal
}

/// Drain the send queue into the socket and send periodic Pings.
///
/// Once the connection closes, frames queued before the close are flushed
/// and a Close frame is sent.
async fn write_loop<K>(
    mut sink: K,
    mut rx: mpsc::Receiver<Utf8Bytes>,
    conn: Arc<Connection>,
    registry: Arc<RoomRegistry>,
    ping_every: Duration,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let mut ping = time::interval_at(time::Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        let result = tokio::select! {
            biased;
            // a busy queue must not starve the keep-alive
            _ = ping.tick() => sink.send(Message::Ping(Bytes::new())).await,
            msg = rx.recv() => match msg {
                Some(text) => sink.send(Message::Text(text)).await,
                None => break,
            },
            () = conn.closed() => break,
        };
        if let Err(e) = result {
            debug!(conn_id = %conn.id(), error = %e, "write failed, closing connection");
            let _ = registry.disconnect(&conn);
            return;
        }
    }

    while let Ok(text) = rx.try_recv() {
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn watch_heartbeat(
    conn: Arc<Connection>,
    registry: Arc<RoomRegistry>,
    interval: Duration,
    timeout: Duration,
) {
    let cancel = conn.close_token();
    if run_heartbeat(conn.clone(), interval, timeout, cancel).await == HeartbeatResult::TimedOut {
        warn!(
            conn_id = %conn.id(),
            silent_for = ?conn.last_seen_elapsed(),
            "heartbeat timed out, closing connection"
        );
        counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
        let _ = registry.disconnect(&conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use futures::StreamExt;
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
    use serde_json::Value;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct UrlStore;

    #[async_trait]
    impl FileStore for UrlStore {
        async fn store(
            &self,
            room: &RoomName,
            filename: &str,
            _bytes: Bytes,
        ) -> Result<String, StorageError> {
            Ok(format!("/files/{room}/{filename}"))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl FileStore for BrokenStore {
        async fn store(&self, _: &RoomName, _: &str, _: Bytes) -> Result<String, StorageError> {
            Err(StorageError::Rejected("quota exceeded".into()))
        }
    }

    fn context_with(config: ServerConfig, store: Arc<dyn FileStore>) -> Arc<SessionContext> {
        Arc::new(SessionContext::new(
            Arc::new(config),
            Arc::new(RoomRegistry::new()),
            store,
            CancellationToken::new(),
        ))
    }

    fn context() -> Arc<SessionContext> {
        context_with(ServerConfig::default(), Arc::new(UrlStore))
    }

    struct Client {
        inbound: UnboundedSender<Result<Message, String>>,
        outbound: UnboundedReceiver<Message>,
        session: JoinHandle<SessionEnd>,
    }

    impl Client {
        fn spawn(ctx: &Arc<SessionContext>, room: &str, name: &str) -> Self {
            let (inbound, stream) = unbounded();
            let (sink, outbound) = unbounded();
            let session = tokio::spawn(run_session(
                stream,
                sink,
                RoomName::parse(room).unwrap(),
                name.to_string(),
                ctx.clone(),
            ));
            Self {
                inbound,
                outbound,
                session,
            }
        }

        fn send(&self, msg: Message) {
            self.inbound.unbounded_send(Ok(msg)).unwrap();
        }

        fn text(&self, json: &str) {
            self.send(Message::Text(json.to_string().into()));
        }

        /// Next non-Ping frame.
        async fn next(&mut self) -> Message {
            loop {
                let msg = time::timeout(TIMEOUT, self.outbound.next())
                    .await
                    .expect("timed out waiting for a frame")
                    .expect("session sink closed");
                if !matches!(msg, Message::Ping(_)) {
                    return msg;
                }
            }
        }

        async fn next_json(&mut self) -> Value {
            match self.next().await {
                Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("expected text frame, got {other:?}"),
            }
        }

        async fn finish(self) -> SessionEnd {
            time::timeout(TIMEOUT, self.session)
                .await
                .expect("session did not end")
                .unwrap()
        }
    }

    async fn wait_for_members(ctx: &SessionContext, room: &str, n: usize) {
        let room = RoomName::parse(room).unwrap();
        time::timeout(TIMEOUT, async {
            while ctx.registry.member_count(&room) != n {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room never reached expected size");
    }

    #[tokio::test]
    async fn chat_round_trip() {
        let ctx = context();
        let mut alice = Client::spawn(&ctx, "general", "alice");
        wait_for_members(&ctx, "general", 1).await;

        alice.text(r#"{"message":"hello"}"#);
        assert_eq!(alice.next_json().await["message"], "alice: hello");
    }

    #[tokio::test]
    async fn room_members_all_receive() {
        let ctx = context();
        let mut alice = Client::spawn(&ctx, "general", "alice");
        let mut bob = Client::spawn(&ctx, "general", "bob");
        let mut carol = Client::spawn(&ctx, "random", "carol");
        wait_for_members(&ctx, "general", 2).await;
        wait_for_members(&ctx, "random", 1).await;

        bob.text(r#"{"message":"hey all"}"#);
        assert_eq!(alice.next_json().await["message"], "bob: hey all");
        assert_eq!(bob.next_json().await["message"], "bob: hey all");

        carol.text(r#"{"message":"elsewhere"}"#);
        assert_eq!(carol.next_json().await["message"], "carol: elsewhere");
        alice.text(r#"{"message":"still here"}"#);
        // alice's next frame is her own message, not carol's
        assert_eq!(alice.next_json().await["message"], "alice: still here");
    }

    #[tokio::test]
    async fn empty_message_is_ignored() {
        let ctx = context();
        let mut alice = Client::spawn(&ctx, "general", "alice");
        wait_for_members(&ctx, "general", 1).await;

        alice.text(r#"{"message":""}"#);
        alice.text(r#"{"message":"after"}"#);
        assert_eq!(alice.next_json().await["message"], "alice: after");
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_session_continues() {
        let ctx = context();
        let mut alice = Client::spawn(&ctx, "general", "alice");
        wait_for_members(&ctx, "general", 1).await;

        alice.text("{not json");
        let err = alice.next_json().await;
        assert_eq!(err["error"]["code"], "MALFORMED_FRAME");

        alice.text(r#"{"message":"ok"}"#);
        assert_eq!(alice.next_json().await["message"], "alice: ok");
    }

    #[tokio::test]
    async fn binary_while_idle_closes_with_error() {
        let ctx = context();
        let mut alice = Client::spawn(&ctx, "general", "alice");
        let mut bob = Client::spawn(&ctx, "general", "bob");
        wait_for_members(&ctx, "general", 2).await;

        alice.send(Message::Binary(Bytes::from_static(b"\x00\x01")));
        let err = alice.next_json().await;
        assert_eq!(err["error"]["code"], "UNEXPECTED_FRAME");
        assert!(matches!(alice.next().await, Message::Close(_)));
        assert_eq!(alice.finish().await, SessionEnd::ProtocolViolation);

        wait_for_members(&ctx, "general", 1).await;
        bob.text(r#"{"message":"alone now"}"#);
        assert_eq!(bob.next_json().await["message"], "bob: alone now");
    }

    #[tokio::test]
    async fn file_pair_is_announced() {
        let ctx = context();
        let mut alice = Client::spawn(&ctx, "general", "alice");
        let mut bob = Client::spawn(&ctx, "general", "bob");
        wait_for_members(&ctx, "general", 2).await;

        alice.text(r#"{"file_name":"cat.png","file_content":"pending","file_size":4}"#);
        alice.send(Message::Binary(Bytes::from_static(b"meow")));

        let expected = "alice shared a file: cat.png (/files/general/cat.png)";
        assert_eq!(bob.next_json().await["message"], expected);
        assert_eq!(alice.next_json().await["message"], expected);
    }

    #[tokio::test]
    async fn text_between_announcement_and_payload_is_fatal() {
        let ctx = context();
        let mut alice = Client::spawn(&ctx, "general", "alice");
        wait_for_members(&ctx, "general", 1).await;

        alice.text(r#"{"file_name":"a.txt"}"#);
        alice.text(r#"{"message":"oops"}"#);
        assert_eq!(alice.next_json().await["error"]["code"], "UNEXPECTED_FRAME");
        assert_eq!(alice.finish().await, SessionEnd::ProtocolViolation);
    }

    #[tokio::test]
    async fn storage_failure_only_reaches_sender() {
        let ctx = context_with(ServerConfig::default(), Arc::new(BrokenStore));
        let mut alice = Client::spawn(&ctx, "general", "alice");
        let mut bob = Client::spawn(&ctx, "general", "bob");
        wait_for_members(&ctx, "general", 2).await;

        alice.text(r#"{"file_name":"a.txt"}"#);
        alice.send(Message::Binary(Bytes::from_static(b"data")));
        assert_eq!(alice.next_json().await["error"]["code"], "STORAGE_FAILED");

        // bob's first frame is the next chat, not the failure
        alice.text(r#"{"message":"sorry"}"#);
        assert_eq!(bob.next_json().await["message"], "alice: sorry");
        assert_eq!(alice.next_json().await["message"], "alice: sorry");
    }

    #[tokio::test]
    async fn peer_close_leaves_room() {
        let ctx = context();
        let alice = Client::spawn(&ctx, "general", "alice");
        wait_for_members(&ctx, "general", 1).await;

        alice.send(Message::Close(None));
        assert_eq!(alice.finish().await, SessionEnd::PeerClosed);
        assert_eq!(ctx.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn transport_error_ends_session() {
        let ctx = context();
        let alice = Client::spawn(&ctx, "general", "alice");
        wait_for_members(&ctx, "general", 1).await;

        alice.inbound.unbounded_send(Err("reset".into())).unwrap();
        assert_eq!(alice.finish().await, SessionEnd::TransportError);
        assert_eq!(ctx.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_sessions() {
        let ctx = context();
        let mut alice = Client::spawn(&ctx, "general", "alice");
        wait_for_members(&ctx, "general", 1).await;

        ctx.shutdown.cancel();
        assert!(matches!(alice.next().await, Message::Close(_)));
        assert_eq!(alice.finish().await, SessionEnd::Shutdown);
        assert_eq!(ctx.registry.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let config = ServerConfig {
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 300,
            ..ServerConfig::default()
        };
        let ctx = context_with(config, Arc::new(UrlStore));
        let alice = Client::spawn(&ctx, "general", "alice");

        assert_eq!(alice.finish().await, SessionEnd::ClosedByServer);
        assert_eq!(ctx.registry.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_sends_pings() {
        let config = ServerConfig {
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 10_000,
            ..ServerConfig::default()
        };
        let ctx = context_with(config, Arc::new(UrlStore));
        let mut alice = Client::spawn(&ctx, "general", "alice");

        let msg = time::timeout(TIMEOUT, alice.outbound.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, Message::Ping(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn pings_interleave_with_a_busy_queue() {
        let (tx, rx) = mpsc::channel(64);
        for i in 0..32 {
            tx.try_send(Utf8Bytes::from(format!(r#"{{"message":"m{i}"}}"#)))
                .unwrap();
        }
        let (conn, _conn_rx) = Connection::channel(RoomName::parse("general").unwrap(), "alice", 8);
        let registry = Arc::new(RoomRegistry::new());
        // a one-slot socket drained slowly keeps the writer's queue non-empty
        let (sink, mut socket) = futures::channel::mpsc::channel::<Message>(0);
        let _writer = tokio::spawn(write_loop(
            sink,
            rx,
            Arc::new(conn),
            registry,
            Duration::from_millis(100),
        ));

        let mut texts_before_ping = 0;
        loop {
            let msg = time::timeout(TIMEOUT, socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("writer closed the socket");
            match msg {
                Message::Ping(_) => break,
                Message::Text(_) => texts_before_ping += 1,
                other => panic!("unexpected frame {other:?}"),
            }
            time::sleep(Duration::from_millis(30)).await;
        }
        assert!(
            texts_before_ping < 32,
            "ping only went out after the whole queue drained"
        );
        drop(tx);
    }

    #[test]
    fn end_labels_are_distinct() {
        let labels = [
            SessionEnd::PeerClosed,
            SessionEnd::TransportError,
            SessionEnd::ProtocolViolation,
            SessionEnd::ClosedByServer,
            SessionEnd::Shutdown,
        ]
        .map(SessionEnd::label);
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }
}
