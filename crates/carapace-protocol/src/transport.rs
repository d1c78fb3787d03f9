//! Request-socket transport. Per `SPEC_FULL.md` §4.1, a core-bound,
//! router-style endpoint where each connected container has a stable
//! identity; the core can send a reply frame to a specific identity.
//!
//! Two implementations are provided: [`InProcessSocket`] for tests (no
//! actual I/O) and [`UnixRequestSocket`], a length-prefixed JSON framing
//! over a Unix domain socket — the wire implementation referenced in
//! `SPEC_FULL.md` §4.1 and framed per §6 ("JSON object per frame on a
//! per-session byte-stream socket").
//!
//! Framing mirrors the teacher's writer-task-forwards-a-channel pattern in
//! `gateway/src/nodes/ws.rs`, adapted from WebSocket frames to a 4-byte
//! big-endian length prefix since the underlying socket is a raw byte
//! stream rather than a message-framed WebSocket.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no connection registered for identity {0}")]
    UnknownIdentity(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("channel closed")]
    ChannelClosed,
}

/// One inbound frame plus the stable identity of the container that sent it.
pub type InboundFrame = (String, Vec<u8>);

#[async_trait]
pub trait RequestSocket: Send + Sync {
    /// Receive the next inbound frame. Returns `None` once the socket is
    /// closed and no more frames will ever arrive.
    async fn recv(&self) -> Option<InboundFrame>;

    /// Send a reply frame to a specific identity.
    async fn send(&self, identity: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Tear down the socket. Idempotent.
    async fn close(&self);
}

/// In-process fake used by tests and by the in-process event-bus-only test
/// harness. No actual bytes cross a socket; "connections" are simulated via
/// channels registered ahead of time with [`InProcessSocket::connect`].
pub struct InProcessSocket {
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    inbound_rx: parking_lot::Mutex<mpsc::UnboundedReceiver<InboundFrame>>,
    outbound: DashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
}

impl InProcessSocket {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx: tx,
            inbound_rx: parking_lot::Mutex::new(rx),
            outbound: DashMap::new(),
        })
    }

    /// Register a simulated container connection. Returns a sender the test
    /// uses to push inbound frames as that identity, and a receiver for
    /// reply frames the core sends back.
    pub fn connect(&self, identity: impl Into<String>) -> (ConnInjector, mpsc::UnboundedReceiver<Vec<u8>>) {
        let identity = identity.into();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.outbound.insert(identity.clone(), reply_tx);
        (
            ConnInjector {
                identity,
                inbound_tx: self.inbound_tx.clone(),
            },
            reply_rx,
        )
    }

    pub fn disconnect(&self, identity: &str) {
        self.outbound.remove(identity);
    }
}

/// Lets a test inject frames as if a container had written them.
pub struct ConnInjector {
    identity: String,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
}

impl ConnInjector {
    pub fn send(&self, payload: Vec<u8>) {
        let _ = self.inbound_tx.send((self.identity.clone(), payload));
    }
}

#[async_trait]
impl RequestSocket for InProcessSocket {
    async fn recv(&self) -> Option<InboundFrame> {
        self.inbound_rx.lock().recv().await
    }

    async fn send(&self, identity: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let sender = self
            .outbound
            .get(identity)
            .ok_or_else(|| TransportError::UnknownIdentity(identity.to_string()))?;
        sender.send(payload).map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {
        self.outbound.clear();
    }
}

/// Length-prefixed JSON framing over Unix domain sockets. Per `SPEC_FULL.md`
/// §2/§3 ("a per-session Unix datagram/stream socket"; "the sessionId is
/// also the socket identity used for dealer routing") and §4.2 stage 2 (no
/// identity field may ever appear in a frame), a connection's identity
/// cannot be learned from the bytes it sends — it has to come from which
/// socket it connected to. So rather than one shared listener assigning
/// sequential connection ids (which cannot be mapped back to a session),
/// this binds one dedicated listener per session, at a unique path, and
/// treats the session id itself as the connection identity: whoever
/// connects to `session-1`'s socket IS session 1, no handshake needed.
pub struct UnixRequestSocket {
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    inbound_rx: parking_lot::Mutex<mpsc::UnboundedReceiver<InboundFrame>>,
    outbound: Arc<DashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    listeners: Arc<DashMap<String, tokio::task::JoinHandle<()>>>,
    sockets_dir: std::path::PathBuf,
}

impl UnixRequestSocket {
    /// Creates (but does not yet listen on) the directory that will hold
    /// one socket file per session.
    pub fn new(sockets_dir: impl AsRef<Path>) -> std::io::Result<Arc<Self>> {
        let sockets_dir = sockets_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&sockets_dir)?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            inbound_tx,
            inbound_rx: parking_lot::Mutex::new(inbound_rx),
            outbound: Arc::new(DashMap::new()),
            listeners: Arc::new(DashMap::new()),
            sockets_dir,
        }))
    }

    /// Host-side path of `session_id`'s dedicated socket file. Callers mount
    /// this into the spawned container (per `SPEC_FULL.md` §4.4's socket
    /// mounts) ahead of binding it with [`Self::register_session`].
    pub fn session_socket_path(&self, session_id: &str) -> std::path::PathBuf {
        self.sockets_dir.join(format!("{session_id}.sock"))
    }

    /// Binds `session_id`'s dedicated listener and accepts its one
    /// connection. Must be called before the container that will connect to
    /// it is started, so the socket file exists by mount time.
    pub async fn register_session(self: &Arc<Self>, session_id: &str) -> std::io::Result<()> {
        let path = self.session_socket_path(session_id);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        let identity = session_id.to_string();
        let inbound_tx = self.inbound_tx.clone();
        let outbound = self.outbound.clone();
        let task = tokio::spawn(async move {
            let (stream, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(session_id = %identity, error = %e, "session socket accept failed");
                    return;
                }
            };
            let (read_half, write_half) = stream.into_split();
            let (reply_tx, reply_rx) = mpsc::unbounded_channel();
            outbound.insert(identity.clone(), reply_tx);
            let writer = tokio::spawn(writer_task(write_half, reply_rx));
            reader_task(identity.clone(), read_half, inbound_tx, outbound.clone()).await;
            writer.abort();
        });
        self.listeners.insert(session_id.to_string(), task);
        Ok(())
    }

    /// Tears down a finished session's listener, in-flight connection, and
    /// socket file. Idempotent.
    pub fn unregister_session(&self, session_id: &str) {
        if let Some((_, task)) = self.listeners.remove(session_id) {
            task.abort();
        }
        self.outbound.remove(session_id);
        let _ = std::fs::remove_file(self.session_socket_path(session_id));
    }
}

async fn writer_task(mut write_half: tokio::net::unix::OwnedWriteHalf, mut reply_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(payload) = reply_rx.recv().await {
        let len = payload.len() as u32;
        if write_half.write_all(&len.to_be_bytes()).await.is_err() {
            break;
        }
        if write_half.write_all(&payload).await.is_err() {
            break;
        }
    }
}

async fn reader_task(
    identity: String,
    mut read_half: tokio::net::unix::OwnedReadHalf,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    outbound: Arc<DashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
) {
    loop {
        let mut len_buf = [0u8; 4];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if read_half.read_exact(&mut payload).await.is_err() {
            break;
        }
        if inbound_tx.send((identity.clone(), payload)).is_err() {
            break;
        }
    }
    outbound.remove(&identity);
}

#[async_trait]
impl RequestSocket for UnixRequestSocket {
    async fn recv(&self) -> Option<InboundFrame> {
        self.inbound_rx.lock().recv().await
    }

    async fn send(&self, identity: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let sender = self
            .outbound
            .get(identity)
            .ok_or_else(|| TransportError::UnknownIdentity(identity.to_string()))?;
        sender.send(payload).map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {
        for entry in self.listeners.iter() {
            entry.value().abort();
        }
        self.listeners.clear();
        self.outbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_round_trip() {
        let socket = InProcessSocket::new();
        let (injector, mut replies) = socket.connect("session-1");

        injector.send(b"hello".to_vec());
        let (identity, payload) = socket.recv().await.unwrap();
        assert_eq!(identity, "session-1");
        assert_eq!(payload, b"hello");

        socket.send("session-1", b"reply".to_vec()).await.unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply, b"reply");
    }

    #[tokio::test]
    async fn send_to_unknown_identity_errors() {
        let socket = InProcessSocket::new();
        let err = socket.send("nobody", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownIdentity(_)));
    }

    #[tokio::test]
    async fn session_socket_round_trip_uses_session_id_as_identity() {
        let dir = tempfile::tempdir().unwrap();
        let socket = UnixRequestSocket::new(dir.path()).unwrap();
        socket.register_session("session-1").await.unwrap();

        let path = socket.session_socket_path("session-1");
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(&5u32.to_be_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let (identity, payload) = socket.recv().await.unwrap();
        assert_eq!(identity, "session-1");
        assert_eq!(payload, b"hello");

        socket.send("session-1", b"reply".to_vec()).await.unwrap();
        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let mut reply = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"reply");

        socket.unregister_session("session-1");
        assert!(!path.exists());
    }
}
