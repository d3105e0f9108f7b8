//! A single accepted chat connection

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::{RecvError, SendError};

/// Identifier assigned to a connection when it is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Snapshot of per-connection traffic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTraffic {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
}

/// One accepted TCP stream.
///
/// The read half is only ever used by the connection's own handler loop.
/// The write half sits behind an async mutex because any number of
/// dispatchers may send to the same connection at once; holding the lock for
/// a whole `write_all` keeps one message's bytes contiguous on the wire.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    connected_at: Instant,
    read_chunk_size: usize,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Connection {
    /// Wrap an accepted stream
    pub fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr, read_chunk_size: usize) -> Self {
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);

        Self {
            id,
            peer_addr,
            connected_at: Instant::now(),
            read_chunk_size: read_chunk_size.max(1),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Time since the connection was accepted
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the next chunk of data.
    ///
    /// Returns up to `read_chunk_size` bytes. An empty result means the peer
    /// closed its side of the stream. A local `close` while waiting completes
    /// the call with `RecvError::Closed`.
    pub async fn receive(&self) -> Result<Bytes, RecvError> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(RecvError::Closed);
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(RecvError::Closed)?;
        let mut buf = vec![0u8; self.read_chunk_size];

        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = closed_rx.changed() => return Err(RecvError::Closed),
        };

        buf.truncate(n);
        if n > 0 {
            self.messages_received.fetch_add(1, Ordering::Relaxed);
            self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        }

        Ok(Bytes::from(buf))
    }

    /// Write the whole payload or report why it could not be written
    ///
    /// A `close` while the write is stalled completes the call with
    /// `SendError::Closed`; the peer may have seen part of the payload.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(SendError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SendError::Closed)?;

        tokio::select! {
            written = writer.write_all(payload) => written?,
            _ = closed_rx.changed() => return Err(SendError::Closed),
        }

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Release the underlying socket.
    ///
    /// Only the first call does anything; it returns `true`. Later calls
    /// return `false`.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }

        // An in-flight send has been woken by the flag and drops the lock.
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of {} write half failed: {}", self.id, e);
            }
        }

        // A pending receive has already been woken by the flag above.
        self.reader.lock().await.take();

        debug!("Connection {} from {} closed", self.id, self.peer_addr);
        true
    }

    pub fn traffic(&self) -> ConnectionTraffic {
        ConnectionTraffic {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Returns the server-side `Connection` and the client socket
    async fn connected_pair(chunk: usize) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (Connection::new(ConnectionId::new(1), stream, peer, chunk), client)
    }

    #[tokio::test]
    async fn test_receive_returns_sent_bytes() {
        let (conn, mut client) = connected_pair(1024).await;
        client.write_all(b"hello").await.unwrap();

        let data = conn.receive().await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(conn.traffic().messages_received, 1);
        assert_eq!(conn.traffic().bytes_received, 5);
    }

    #[tokio::test]
    async fn test_receive_empty_on_peer_close() {
        let (conn, client) = connected_pair(1024).await;
        drop(client);

        let data = conn.receive().await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_receive_respects_chunk_size() {
        let (conn, mut client) = connected_pair(64).await;
        client.write_all(&[b'x'; 100]).await.unwrap();

        let first = conn.receive().await.unwrap();
        assert!(first.len() <= 64);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (conn, mut client) = connected_pair(1024).await;
        conn.send(b"hi B").await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi B");
        assert_eq!(conn.traffic().bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut client) = connected_pair(1024).await;

        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert!(conn.is_closed());

        // Peer observes end-of-stream.
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (conn, _client) = connected_pair(1024).await;
        conn.close().await;

        assert!(matches!(conn.send(b"late").await, Err(SendError::Closed)));
        assert!(matches!(conn.receive().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (conn, _client) = connected_pair(1024).await;
        let conn = Arc::new(conn);

        let reader = Arc::clone(&conn);
        let pending = tokio::spawn(async move { reader.receive().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close().await;

        let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (conn, mut client) = connected_pair(1024).await;
        let conn = Arc::new(conn);

        let a = vec![b'a'; 32 * 1024];
        let b = vec![b'b'; 32 * 1024];

        let c1 = Arc::clone(&conn);
        let c2 = Arc::clone(&conn);
        let (pa, pb) = (a.clone(), b.clone());
        let t1 = tokio::spawn(async move { c1.send(&pa).await });
        let t2 = tokio::spawn(async move { c2.send(&pb).await });

        let mut received = vec![0u8; a.len() + b.len()];
        client.read_exact(&mut received).await.unwrap();
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        // Exactly one switch from one payload to the other.
        let switches = received.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1);
    }

    #[tokio::test]
    async fn test_close_cancels_stalled_send() {
        let (conn, _client) = connected_pair(1024).await;
        let conn = Arc::new(conn);

        // The client never reads, so this fills both socket buffers.
        let payload = vec![b'x'; 64 * 1024 * 1024];
        let sender = Arc::clone(&conn);
        let stalled = tokio::spawn(async move { sender.send(&payload).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!stalled.is_finished(), "send should be blocked on backpressure");

        let closed = timeout(Duration::from_secs(3), conn.close()).await;
        assert_eq!(closed.ok(), Some(true), "close must not wait behind a stalled send");

        let result = timeout(Duration::from_secs(3), stalled).await.unwrap().unwrap();
        assert!(matches!(result, Err(SendError::Closed)));
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "conn_42");
    }
}
