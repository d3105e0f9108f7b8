//! Shared helpers for chat server integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustchat::error::ConnectError;
use rustchat::metrics::Metrics;
use rustchat::{ChatConfig, ConnectionManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);

pub struct TestServer {
    pub manager: Arc<ConnectionManager>,
    pub addr: SocketAddr,
    pub accept_task: JoinHandle<Result<(), ConnectError>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ChatConfig::default()).await
    }

    /// Start a server on an ephemeral localhost port
    pub async fn start_with(mut config: ChatConfig) -> Self {
        config.server.bind_addr = "127.0.0.1:0".parse().unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let mut manager = ConnectionManager::new(Arc::new(config), metrics);
        let addr = manager.bind().await.unwrap();
        let manager = Arc::new(manager);

        let accept_manager = Arc::clone(&manager);
        let accept_task = tokio::spawn(async move { accept_manager.accept_connections().await });

        Self {
            manager,
            addr,
            accept_task,
        }
    }

    /// Connect a client and wait until the server has registered it
    pub async fn connect(&self) -> TcpStream {
        let expected = self.manager.registry().len() + 1;
        let stream = TcpStream::connect(self.addr).await.unwrap();
        self.wait_for_registered(expected).await;
        stream
    }

    pub async fn wait_for_registered(&self, expected: usize) {
        let registry = Arc::clone(self.manager.registry());
        wait_until(|| registry.len() == expected).await;
    }

    /// Wait until the server has received `expected` chunks in total
    pub async fn wait_for_messages(&self, expected: u64) {
        let metrics = Arc::clone(self.manager.metrics());
        wait_until(|| metrics.messages_received() >= expected).await;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", WAIT);
        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn send(stream: &mut TcpStream, text: &str) {
    stream.write_all(text.as_bytes()).await.unwrap();
}

/// Read exactly `len` bytes or fail the test
pub async fn read_exact_text(stream: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for broadcast")
        .unwrap();
    String::from_utf8(buf).unwrap()
}

/// Assert that nothing arrives on `stream` for a short while
pub async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match timeout(QUIET, stream.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(n)) => panic!(
            "expected no data, got {:?}",
            String::from_utf8_lossy(&buf[..n])
        ),
        Ok(Err(e)) => panic!("expected no data, got error {}", e),
    }
}
