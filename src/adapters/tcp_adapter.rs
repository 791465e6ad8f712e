//! Newline-terminated text over TCP.
//!
//! Used for networked instruments and for [`Remote`](crate::variable::Remote) variables
//! talking to another engine's socket server.

use super::Transport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP transport
pub struct TcpTransport {
    address: String,
    terminator: String,
    stream: Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
}

impl TcpTransport {
    /// `address` is anything `TcpStream::connect` accepts, e.g. `"127.0.0.1:6174"`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            terminator: "\n".to_string(),
            stream: None,
        }
    }

    /// Line terminator appended to outgoing messages
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn describe(&self) -> String {
        format!("tcp:{}", self.address)
    }

    async fn connect(&mut self) -> Result<()> {
        let stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        self.stream = Some((BufReader::new(read_half), write_half));
        debug!(address = %self.address, "TCP connection opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some((_, mut write_half)) = self.stream.take() {
            write_half.shutdown().await.ok();
            debug!(address = %self.address, "TCP connection closed");
        }
        Ok(())
    }

    async fn write(&mut self, message: &str) -> Result<()> {
        let (_, writer) = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected to {}", self.address))?;
        writer
            .write_all(format!("{}{}", message, self.terminator).as_bytes())
            .await
            .context("Failed to write to socket")?;
        writer.flush().await.context("Failed to flush socket")?;
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        let (reader, _) = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected to {}", self.address))?;
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .context("Failed to read from socket")?;
        if n == 0 {
            self.stream = None;
            return Err(anyhow!("Connection to {} closed by peer", self.address));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}
