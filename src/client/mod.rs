//! Reference chat client
//!
//! A sender loop reads lines from the user and writes them to the server in
//! the `[COLOR (<name>)] said -> <text>` envelope. A receiver loop prints
//! whatever the server broadcasts. The server does not interpret the
//! envelope.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::DEFAULT_READ_CHUNK_SIZE;

/// Prompt shown before each input line
pub const PROMPT: &str = "You: ";

/// Client-side failures, each with its own user-facing message
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection refused. Ensure the server is running.")]
    ConnectionRefused,

    #[error("Connection reset by server.")]
    ConnectionReset,

    #[error("Connection to the server was lost.")]
    BrokenPipe,

    #[error("An error occurred: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ClientError::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                ClientError::ConnectionReset
            }
            io::ErrorKind::BrokenPipe => ClientError::BrokenPipe,
            _ => ClientError::Io(e),
        }
    }
}

/// Wrap user text in the display envelope
pub fn format_envelope(color: &str, text: &str) -> String {
    format!("[COLOR ({})] said -> {}", color, text)
}

/// Read lines from `input` and send each non-blank one to the server.
///
/// Returns when `input` is exhausted or the server connection fails.
pub async fn send_loop<I, W, P>(input: I, writer: &mut W, prompt: &mut P, color: &str) -> Result<(), ClientError>
where
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    P: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    loop {
        prompt.write_all(PROMPT.as_bytes()).await?;
        prompt.flush().await?;

        let Some(line) = lines.next_line().await? else {
            debug!("Input closed, leaving send loop");
            return Ok(());
        };

        if line.trim().is_empty() {
            continue;
        }

        writer.write_all(format_envelope(color, &line).as_bytes()).await?;
    }
}

/// Print every chunk the server sends, each on a fresh line.
///
/// Returns when the server closes the connection.
pub async fn receive_loop<R, O>(reader: &mut R, output: &mut O) -> Result<(), ClientError>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&buf[..n]);
        output.write_all(format!("\n{}\n", text).as_bytes()).await?;
        output.flush().await?;
    }
}

/// A chat client bound to one server address and display color
#[derive(Debug, Clone)]
pub struct ChatClient {
    server_addr: SocketAddr,
    color: String,
}

impl ChatClient {
    pub fn new(server_addr: SocketAddr, color: impl Into<String>) -> Self {
        Self {
            server_addr,
            color: color.into(),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub async fn connect(&self) -> Result<TcpStream, ClientError> {
        Ok(TcpStream::connect(self.server_addr).await?)
    }

    /// Connect and run both loops until either one finishes.
    ///
    /// `input` supplies user lines, prompts go to `prompt` and incoming
    /// messages to `output`.
    pub async fn run<I, P, O>(&self, input: I, mut prompt: P, mut output: O) -> Result<(), ClientError>
    where
        I: AsyncBufRead + Unpin,
        P: AsyncWrite + Unpin,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let stream = self.connect().await?;
        let (mut reader, mut writer) = stream.into_split();

        prompt
            .write_all(format!("Connected to server at {}\n", self.server_addr).as_bytes())
            .await?;

        let mut receiver = tokio::spawn(async move { receive_loop(&mut reader, &mut output).await });

        let result = tokio::select! {
            sent = send_loop(input, &mut writer, &mut prompt, &self.color) => sent,
            received = &mut receiver => match received {
                Ok(result) => result,
                Err(e) => Err(ClientError::Io(io::Error::other(e))),
            },
        };

        receiver.abort();
        // The server may already be gone.
        let _ = writer.shutdown().await;
        result
    }
}
