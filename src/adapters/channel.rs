//! Serialized, self-healing communication channel
//!
//! Each instrument owns exactly one channel. The channel's transport lives inside a
//! dedicated queue task, and every operation is sent to that task over an mpsc queue:
//!
//! - operations are served strictly in FIFO order, one at a time
//! - each operation runs under the retry/reconnect policy before the next is taken, so a
//!   retrying operation keeps exclusive use of the transport
//! - the result travels back to the caller on a oneshot channel
//!
//! [`ChannelHandle`] is cheap to clone; every variable on the same instrument holds a
//! clone, and this queue is the only synchronization point between them.
//!
//! # Example
//!
//! ```no_run
//! use daq_engine::adapters::{ChannelHandle, MockTransport};
//! use daq_engine::error_recovery::RetryPolicy;
//!
//! # async fn demo() -> daq_engine::error::AppResult<()> {
//! let channel = ChannelHandle::spawn("psu", MockTransport::new("psu"), RetryPolicy::default());
//! channel.connect().await?;
//! channel.write("VOLT 1.5").await?;
//! let reply = channel.query("VOLT?", None).await?;
//! # Ok(())
//! # }
//! ```

use super::Transport;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{retry_with_reconnect, Recoverable, RetryPolicy};
use anyhow::anyhow;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Predicate over a raw response; `false` makes the attempt count as failed.
pub type Validator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Accepts any non-empty response that is not a bare `nan`.
pub fn default_validator() -> Validator {
    Arc::new(|response: &str| {
        let trimmed = response.trim();
        !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("nan")
    })
}

const QUEUE_DEPTH: usize = 100;

enum Operation {
    Connect,
    Write(String),
    Read,
    Query(String),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Connect => write!(f, "connect"),
            Operation::Write(message) => write!(f, "write {:?}", message),
            Operation::Read => write!(f, "read"),
            Operation::Query(message) => write!(f, "query {:?}", message),
        }
    }
}

struct Request {
    operation: Operation,
    validator: Option<Validator>,
    reply: oneshot::Sender<AppResult<String>>,
}

enum Command {
    Run(Request),
    Close(oneshot::Sender<()>),
}

/// One operation bound to the transport, retried by the recovery policy.
struct ChannelAttempt<'a, T: Transport> {
    name: &'a str,
    transport: &'a mut T,
    operation: &'a Operation,
    validator: &'a Validator,
}

#[async_trait]
impl<'a, T: Transport> Recoverable for ChannelAttempt<'a, T> {
    type Output = String;

    async fn attempt(&mut self) -> anyhow::Result<String> {
        let response = match self.operation {
            Operation::Connect => {
                self.transport.connect().await?;
                return Ok(String::new());
            }
            Operation::Write(message) => {
                self.transport.write(message).await?;
                return Ok(String::new());
            }
            Operation::Read => self.transport.read().await?,
            Operation::Query(message) => self.transport.query(message).await?,
        };

        if (self.validator)(&response) {
            Ok(response)
        } else {
            Err(anyhow!(DaqError::Validation {
                channel: self.name.to_string(),
                response,
            }))
        }
    }

    async fn reconnect(&mut self) -> anyhow::Result<()> {
        if let Err(err) = self.transport.disconnect().await {
            debug!(channel = %self.name, error = %err, "Disconnect before reconnect failed");
        }
        self.transport.connect().await
    }
}

/// Handle to an instrument channel queue
#[derive(Clone)]
pub struct ChannelHandle {
    name: Arc<str>,
    command_tx: mpsc::Sender<Command>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle").field("name", &self.name).finish()
    }
}

impl ChannelHandle {
    /// Moves `transport` into a new queue task and returns the handle to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<T>(name: impl Into<String>, transport: T, policy: RetryPolicy) -> Self
    where
        T: Transport + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let (command_tx, command_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_command_queue(
            name.clone(),
            transport,
            policy,
            command_rx,
        ));
        Self { name, command_tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, operation: Operation, validator: Option<Validator>) -> AppResult<String> {
        let (reply, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Run(Request {
                operation,
                validator,
                reply,
            }))
            .await
            .map_err(|_| DaqError::ChannelClosed(self.name.to_string()))?;

        response_rx
            .await
            .map_err(|_| DaqError::ChannelClosed(self.name.to_string()))?
    }

    /// Opens the transport under the retry policy.
    pub async fn connect(&self) -> AppResult<()> {
        self.submit(Operation::Connect, None).await.map(|_| ())
    }

    /// Sends a message that expects no response.
    pub async fn write(&self, message: &str) -> AppResult<()> {
        self.submit(Operation::Write(message.to_string()), None)
            .await
            .map(|_| ())
    }

    /// Reads one response; `None` uses [`default_validator`].
    pub async fn read(&self, validator: Option<Validator>) -> AppResult<String> {
        self.submit(Operation::Read, validator).await
    }

    /// Writes `message` and reads the response as one exclusive operation.
    pub async fn query(&self, message: &str, validator: Option<Validator>) -> AppResult<String> {
        self.submit(Operation::Query(message.to_string()), validator)
            .await
    }

    /// Drains queued operations, disconnects the transport and stops the queue task.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(Command::Close(done_tx)).await.is_err() {
            // already closed
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

async fn run_command_queue<T: Transport>(
    name: Arc<str>,
    mut transport: T,
    policy: RetryPolicy,
    mut command_rx: mpsc::Receiver<Command>,
) {
    debug!(channel = %name, endpoint = %transport.describe(), "Starting channel queue task");
    let fallback = default_validator();

    while let Some(command) = command_rx.recv().await {
        let request = match command {
            Command::Run(request) => request,
            Command::Close(done) => {
                if let Err(err) = transport.disconnect().await {
                    warn!(channel = %name, error = %err, "Disconnect on shutdown failed");
                }
                let _ = done.send(());
                break;
            }
        };

        trace!(channel = %name, operation = %request.operation, "Executing");
        let validator = request.validator.as_ref().unwrap_or(&fallback);
        let mut attempt = ChannelAttempt {
            name: &name,
            transport: &mut transport,
            operation: &request.operation,
            validator,
        };
        let result = retry_with_reconnect(&name, &mut attempt, &policy).await;

        if request.reply.send(result).is_err() {
            trace!(channel = %name, "Caller dropped before the response arrived");
        }
    }

    debug!(channel = %name, "Channel queue task stopped");
}
