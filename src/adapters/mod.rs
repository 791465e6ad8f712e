//! Instrument communication adapters
//!
//! A [`Transport`] is the raw, unprotected I/O endpoint of one instrument (serial port,
//! TCP socket, simulated device). Transports are never used directly by variables: each is
//! moved into a [`ChannelHandle`] queue task that serializes every operation and applies
//! the retry/reconnect policy from [`crate::error_recovery`].

pub mod channel;
pub mod mock;
pub mod serial_adapter;
pub mod tcp_adapter;

pub use channel::{default_validator, ChannelHandle, Validator};
pub use mock::MockTransport;
pub use serial_adapter::SerialTransport;
pub use tcp_adapter::TcpTransport;

use anyhow::Result;
use async_trait::async_trait;

/// Line-oriented text I/O with an instrument.
#[async_trait]
pub trait Transport: Send {
    /// Human-readable endpoint description used in logs.
    fn describe(&self) -> String;

    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Send one message; the transport appends its own terminator.
    async fn write(&mut self, message: &str) -> Result<()>;

    /// Receive one message with the terminator stripped.
    async fn read(&mut self) -> Result<String>;

    async fn query(&mut self, message: &str) -> Result<String> {
        self.write(message).await?;
        self.read().await
    }
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn write(&mut self, message: &str) -> Result<()> {
        (**self).write(message).await
    }

    async fn read(&mut self) -> Result<String> {
        (**self).read().await
    }

    async fn query(&mut self, message: &str) -> Result<String> {
        (**self).query(message).await
    }
}
