//! Server-side state for one live client connection.
//!
//! A [`Session`] owns the socket halves, the inbound [`Packer`], the
//! liveness clock, and a keyed attribute store handlers use for
//! connection-scoped scratch state. Two loops drive it: the read loop feeds
//! the codec and dispatches decoded requests, and the heartbeat loop closes
//! the connection once the activity gap exceeds the idle timeout. Both
//! loops observe the server-wide cancellation token every iteration.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, OnceLock, atomic::AtomicI64, atomic::Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::Packer,
    dispatch::Dispatcher,
    message::{CmdCode, DataCode, OpCode, Payload},
};

/// Why a session left the active state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection or the transport failed.
    PeerClosed,
    /// No activity was observed within the idle timeout.
    IdleTimeout,
    /// A newer connection was assigned this session's id.
    IdCollision,
    /// The server is shutting down.
    ServerStopped,
    /// The peer sent bytes that can no longer be framed.
    ProtocolError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PeerClosed => "peer stopped",
            Self::IdleTimeout => "timeout",
            Self::IdCollision => "id collision",
            Self::ServerStopped => "server stopped",
            Self::ProtocolError => "protocol error",
        })
    }
}

/// Errors surfaced when writing a frame to the peer.
#[derive(Debug, Error)]
pub enum SendError {
    /// The session has already closed its socket.
    #[error("session already closed")]
    Closed,
    /// The outgoing payload could not be encoded.
    #[error(transparent)]
    Encode(#[from] crate::codec::CodecError),
    /// The socket write failed.
    #[error("socket write failed: {0}")]
    Io(#[from] io::Error),
}

/// One live client connection.
pub struct Session {
    id: String,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    idle_timeout: Duration,
    /// Write half, taken exactly once when the session closes. All sends
    /// serialize on this lock.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Connection-scoped scratch state (login status and the like).
    attributes: DashMap<DataCode, Value>,
    closing: CancellationToken,
    close_reason: OnceLock<DisconnectReason>,
}

impl Session {
    /// Wrap an accepted connection, returning the session and the read half
    /// the caller hands to [`read_loop`](Self::read_loop).
    ///
    /// # Errors
    ///
    /// Fails when the peer address cannot be resolved.
    pub(crate) fn accept(
        id: String,
        stream: TcpStream,
        idle_timeout: Duration,
    ) -> io::Result<(Arc<Self>, OwnedReadHalf)> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let now = Utc::now();
        let session = Arc::new(Self {
            id,
            remote_addr,
            connected_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            idle_timeout,
            writer: Mutex::new(Some(writer)),
            attributes: DashMap::new(),
            closing: CancellationToken::new(),
            close_reason: OnceLock::new(),
        });
        Ok((session, reader))
    }

    /// Unique id assigned at accept time.
    #[must_use]
    pub fn id(&self) -> &str { &self.id }

    /// Peer address of the underlying connection.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr { self.remote_addr }

    /// When the connection was accepted.
    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> { self.connected_at }

    /// When inbound activity was last observed.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    /// Idle timeout this session enforces.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration { self.idle_timeout }

    /// Elapsed time since the last observed activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let gap = Utc::now().timestamp_millis() - self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(gap.max(0) as u64)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Whether the session has entered the closing state.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closing.is_cancelled() }

    /// Why the session closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason.get().copied()
    }

    /// Resolve once the session has closed.
    pub async fn wait_closed(&self) { self.closing.cancelled().await; }

    /// Close the session, recording `reason`.
    ///
    /// Idempotent: the first caller wins, closes the socket exactly once,
    /// and logs the reason; later calls are no-ops.
    pub async fn close(&self, reason: DisconnectReason) {
        if self.close_reason.set(reason).is_err() {
            return;
        }
        self.closing.cancel();
        let mut writer = self.writer.lock().await;
        if let Some(mut half) = writer.take() {
            let _ = half.shutdown().await;
        }
        info!("session {} closed: {reason}", self.id);
    }

    /// Serialize and send one frame to the peer.
    ///
    /// Writes for a session go out one at a time under the write lock;
    /// failures are classified (peer gone vs unexpected) for logging but
    /// always surfaced to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] after close, [`SendError::Encode`] when
    /// the payload fails to serialize, and [`SendError::Io`] when the write
    /// fails.
    pub async fn send(
        &self,
        send_time: DateTime<Utc>,
        op_code: OpCode,
        cmd_code: CmdCode,
        payload: &Payload,
    ) -> Result<(), SendError> {
        let bytes = Packer::pack_data(send_time, op_code, cmd_code, payload)?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!("session {}: send after close", self.id);
            return Err(SendError::Closed);
        };
        if let Err(err) = writer.write_all(&bytes).await {
            if is_peer_closed(&err) {
                debug!("session {}: peer closed during send: {err}", self.id);
            } else {
                error!("session {}: send failed: {err}", self.id);
            }
            return Err(SendError::Io(err));
        }
        Ok(())
    }

    /// Value stored under `code`, if any.
    #[must_use]
    pub fn attribute(&self, code: DataCode) -> Option<Value> {
        self.attributes.get(&code).map(|entry| entry.value().clone())
    }

    /// Store a connection-scoped value under `code`.
    pub fn set_attribute(&self, code: DataCode, value: impl Into<Value>) {
        self.attributes.insert(code, value.into());
    }

    /// Remove and return the value under `code`.
    pub fn clear_attribute(&self, code: DataCode) -> Option<Value> {
        self.attributes.remove(&code).map(|(_, value)| value)
    }

    /// Drop all connection-scoped values.
    pub fn clear_attributes(&self) { self.attributes.clear(); }

    /// Read loop: accumulate bytes, decode frames, dispatch requests.
    ///
    /// Each decoded request is dispatched on its own task so a slow handler
    /// never stalls the socket. Payload decode errors are logged and the
    /// connection stays open; transport errors and framing corruption close
    /// it.
    pub(crate) async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
        read_buffer: usize,
    ) {
        let mut packer = Packer::new();
        let mut buf = vec![0u8; read_buffer.max(64)];
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    self.close(DisconnectReason::ServerStopped).await;
                    break;
                }
                () = self.closing.cancelled() => break,
                res = reader.read(&mut buf) => match res {
                    Ok(0) => {
                        self.close(DisconnectReason::PeerClosed).await;
                        break;
                    }
                    Ok(n) => {
                        self.touch();
                        if let Err(err) = packer.add(&buf[..n]) {
                            if err.is_fatal() {
                                error!("session {}: unrecoverable framing error: {err}", self.id);
                                self.close(DisconnectReason::ProtocolError).await;
                                break;
                            }
                            error!("session {}: dropped malformed frame: {err}", self.id);
                        }
                        while let Some(mut request) = packer.next() {
                            request.bind_client(&self);
                            let dispatcher = Arc::clone(&dispatcher);
                            tokio::spawn(async move { dispatcher.dispatch(request).await });
                        }
                    }
                    Err(err) => {
                        if is_peer_closed(&err) {
                            debug!("session {}: read ended: {err}", self.id);
                        } else {
                            error!("session {}: read failed: {err}", self.id);
                        }
                        self.close(DisconnectReason::PeerClosed).await;
                        break;
                    }
                },
            }
        }
    }

    /// Heartbeat loop: close the session once the activity gap exceeds the
    /// idle timeout. The cadence equals the timeout, so a stale session is
    /// reaped within one extra period at most.
    pub(crate) async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    self.close(DisconnectReason::ServerStopped).await;
                    break;
                }
                () = self.closing.cancelled() => break,
                () = tokio::time::sleep(self.idle_timeout) => {
                    if self.idle_for() > self.idle_timeout {
                        warn!("session {} timed out after {:?} idle", self.id, self.idle_for());
                        self.close(DisconnectReason::IdleTimeout).await;
                        break;
                    }
                }
            }
        }
    }
}

fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn connected_session() -> (Arc<Session>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (accepted, _) = listener.accept().await.expect("accept");
        let (session, _reader) =
            Session::accept("test-1".into(), accepted, Duration::from_secs(30)).expect("session");
        (session, client)
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_the_first_reason() {
        let (session, _client) = connected_session().await;

        session.close(DisconnectReason::IdleTimeout).await;
        session.close(DisconnectReason::ServerStopped).await;

        assert!(session.is_closed());
        assert_eq!(session.close_reason(), Some(DisconnectReason::IdleTimeout));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (session, _client) = connected_session().await;
        session.close(DisconnectReason::PeerClosed).await;

        let err = session
            .send(Utc::now(), 1, 1, &Payload::new())
            .await
            .expect_err("closed");
        assert!(matches!(err, SendError::Closed));
    }

    #[tokio::test]
    async fn attribute_store_round_trips() {
        let (session, _client) = connected_session().await;

        assert_eq!(session.attribute(0), None);
        session.set_attribute(0, json!(true));
        session.set_attribute(1, "player-7");
        assert_eq!(session.attribute(0), Some(json!(true)));
        assert_eq!(session.attribute(1), Some(json!("player-7")));

        assert_eq!(session.clear_attribute(0), Some(json!(true)));
        assert_eq!(session.attribute(0), None);

        session.clear_attributes();
        assert_eq!(session.attribute(1), None);
    }
}
