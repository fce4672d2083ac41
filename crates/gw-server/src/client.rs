//! Per-connection socket ownership.
//!
//! A [`Connection`] owns one WebSocket. Writes go through a mutex so
//! concurrent producers (the read loop's responses, broadcasts, streaming
//! events) never interleave inside a frame. A [`Client`] is an
//! authenticated connection plus its identity, as held by the registry.

use crate::auth::AuthResult;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use gw_core::{frame_decode, frame_encode, ClientInfo, Frame, GwError, GwResult};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type MessageSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;
type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, axum::Error>> + Send>>;

/// Upper bound on flushing the close handshake to an unresponsive peer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One socket with race-free send/receive and one-time close.
pub struct Connection {
    sink: Mutex<MessageSink>,
    stream: Mutex<MessageStream>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    /// Wrap an upgraded WebSocket.
    pub fn from_socket(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self::from_parts(sink, stream)
    }

    /// Build a connection from any message sink/stream pair.
    pub fn from_parts<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
        R: Stream<Item = Result<Message, axum::Error>> + Send + 'static,
    {
        Self {
            sink: Mutex::new(Box::pin(sink)),
            stream: Mutex::new(Box::pin(stream)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Send one frame. Safe to call from several tasks at once.
    pub async fn send(&self, frame: &Frame) -> GwResult<()> {
        if self.is_closed() {
            return Err(GwError::Closed);
        }
        let text = frame_encode(frame)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| GwError::Transport(format!("WS send failed: {e}")))
    }

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` once the peer closes or [`close`](Self::close) is
    /// called, and [`GwError::Codec`] or [`GwError::BadRequest`] for a
    /// message that is not a valid frame (the connection remains usable).
    /// Ping/pong is handled by the
    /// WebSocket layer and skipped here.
    pub async fn read_frame(&self) -> GwResult<Option<Frame>> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => return frame_decode(text.as_bytes()).map(Some),
                Some(Ok(Message::Binary(data))) => return frame_decode(&data).map(Some),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(GwError::Transport(format!("WS recv failed: {e}"))),
            }
        }
    }

    /// Close the socket. Only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let closing = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "WS close failed"),
            Err(_) => debug!("WS close timed out"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A token cancelled when this connection closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

/// An authenticated, registered connection.
pub struct Client {
    pub id: String,
    pub info: ClientInfo,
    pub auth: AuthResult,
    pub remote: String,
    pub connected_at: SystemTime,
    conn: Connection,
}

impl Client {
    pub fn new(conn: Connection, info: ClientInfo, auth: AuthResult, remote: String) -> Self {
        Self {
            id: generate_conn_id(),
            info,
            auth,
            remote,
            connected_at: SystemTime::now(),
            conn,
        }
    }

    pub async fn send(&self, frame: &Frame) -> GwResult<()> {
        self.conn.send(frame).await
    }

    pub async fn read_frame(&self) -> GwResult<Option<Frame>> {
        self.conn.read_frame().await
    }

    pub async fn close(&self) {
        self.conn.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Cancelled when the client disconnects or is closed by the server.
    pub fn closed_token(&self) -> CancellationToken {
        self.conn.closed_token()
    }
}

/// Generate a random connection ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_conn_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn send_then_read_on_peer() {
        let (conn, mut peer) = memory_connection();
        let frame = Frame::event("tick", &json!({"ts": 1}), 1).unwrap();
        conn.send(&frame).await.unwrap();
        assert_eq!(peer.next_frame().await, Some(frame));
    }

    #[tokio::test]
    async fn concurrent_senders_never_interleave() {
        let (conn, mut peer) = memory_connection();
        let conn = Arc::new(conn);
        let mut tasks = Vec::new();
        for n in 0..16u64 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                let frame = Frame::event("chat.delta", &json!({"text": "x".repeat(512)}), n).unwrap();
                conn.send(&frame).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..16 {
            let Some(Frame::Event(ev)) = peer.next_frame().await else {
                panic!("expected event");
            };
            seen.push(ev.seq);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn read_skips_pings_and_reports_bad_frames() {
        let (conn, peer) = memory_connection();
        peer.inbound
            .send(Ok(Message::Ping(vec![1u8].into())))
            .await
            .unwrap();
        peer.inbound
            .send(Ok(Message::Text("{oops".to_string().into())))
            .await
            .unwrap();
        let req = Frame::request("1", "health", &()).unwrap();
        peer.send_frame(&req).await;

        assert!(matches!(conn.read_frame().await, Err(GwError::Codec(_))));
        assert_eq!(conn.read_frame().await.unwrap(), Some(req));
    }

    #[tokio::test]
    async fn peer_close_ends_reads() {
        let (conn, peer) = memory_connection();
        peer.inbound.send(Ok(Message::Close(None))).await.unwrap();
        assert_eq!(conn.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_wakes_reader() {
        let (conn, _peer) = memory_connection();
        let conn = Arc::new(conn);
        let token = conn.closed_token();

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.read_frame().await })
        };
        tokio::task::yield_now().await;

        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(token.is_cancelled());
        assert_eq!(reader.await.unwrap().unwrap(), None);

        let frame = Frame::event("tick", &(), 1).unwrap();
        assert!(matches!(conn.send(&frame).await, Err(GwError::Closed)));
    }

    #[test]
    fn conn_ids_are_unique_hex() {
        let a = generate_conn_id();
        let b = generate_conn_id();
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
