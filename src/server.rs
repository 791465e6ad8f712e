//! Line-oriented socket server exposing a running experiment's variables.
//!
//! Each request is one line; each reply is one line:
//!
//! ```text
//! <name> settable?    ->  <name> settable | <name> read-only
//! <name> ?            ->  <name> <cached value>
//! <name> <value>      ->  <name> <value now held>
//! ```
//!
//! Failures are answered with `Error: <message>`. Reads never touch instruments; writes
//! go through [`RemoteAccess`] and are refused while a routine controls the variable.

use crate::core::Value;
use crate::error::{AppResult, DaqError};
use crate::scheduler::RemoteAccess;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accepts connections and serves each on its own task.
pub struct SocketServer {
    listener: TcpListener,
    access: RemoteAccess,
}

/// Running server; dropping it leaves the server running until the runtime stops.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Connections already open finish on their own.
    pub async fn shutdown(mut self) -> AppResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|e| DaqError::Task(format!("socket server: {}", e)))
    }
}

impl SocketServer {
    pub async fn bind(address: &str, access: RemoteAccess) -> AppResult<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, access })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self) -> AppResult<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.serve(shutdown_rx));
        Ok(ServerHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    async fn serve(self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!(address = ?self.listener.local_addr().ok(), "Socket server listening");
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Client connected");
                        let access = self.access.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(stream, access).await {
                                warn!(%peer, error = %err, "Client connection failed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "Accept failed"),
                },
            }
        }
        info!("Socket server stopped");
    }
}

async fn serve_connection(stream: TcpStream, access: RemoteAccess) -> AppResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = match handle_request(&access, line).await {
            Ok(reply) => reply,
            Err(err) => format!("Error: {}", err),
        };
        write_half.write_all(reply.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}

async fn handle_request(access: &RemoteAccess, line: &str) -> AppResult<String> {
    let (name, argument) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| DaqError::Validation {
            channel: "socket server".to_string(),
            response: line.to_string(),
        })?;
    let argument = argument.trim();
    match argument {
        "settable?" => {
            let word = if access.is_settable(name)? {
                "settable"
            } else {
                "read-only"
            };
            Ok(format!("{} {}", name, word))
        }
        "?" => Ok(format!("{} {}", name, access.get(name)?)),
        raw => {
            let held = access.set(name, Value::recast(raw)?).await?;
            Ok(format!("{} {}", name, held))
        }
    }
}
