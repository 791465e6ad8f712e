//! Line-framed serial transport
//!
//! Port I/O is blocking, so every frame is written or read on Tokio's blocking pool.
//! Opening a device needs the `instrument_serial` feature; any other byte stream can be
//! attached with [`SerialTransport::attached`].

use super::Transport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Byte stream a serial transport talks over.
pub trait Port: Read + Write + Send {}

impl<T: Read + Write + Send> Port for T {}

type SharedPort = Arc<Mutex<Box<dyn Port>>>;

/// Serial transport for RS-232 instruments
#[derive(Clone)]
pub struct SerialTransport {
    /// Device path (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,
    baud_rate: u32,
    /// Deadline for one response line
    timeout: Duration,
    /// Appended to every command
    line_terminator: String,
    /// Ends every response
    response_delimiter: u8,
    port: Option<SharedPort>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
            port: None,
        }
    }

    /// Transport over an already open byte stream; `connect` keeps it.
    pub fn attached(port_name: impl Into<String>, port: impl Port + 'static) -> Self {
        let mut transport = Self::new(port_name, 0);
        transport.port = Some(Arc::new(Mutex::new(Box::new(port))));
        transport
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_framing(mut self, line_terminator: impl Into<String>, response_delimiter: u8) -> Self {
        self.line_terminator = line_terminator.into();
        self.response_delimiter = response_delimiter;
        self
    }

    /// Current settings, as reported in diagnostics
    pub fn settings(&self) -> serde_json::Value {
        json!({
            "port": self.port_name,
            "baud_rate": self.baud_rate,
            "timeout_ms": self.timeout.as_millis() as u64,
            "line_terminator": self.line_terminator,
            "response_delimiter": char::from(self.response_delimiter).to_string(),
        })
    }

    fn port(&self) -> Result<SharedPort> {
        self.port
            .clone()
            .ok_or_else(|| anyhow!("Serial port '{}' not connected", self.port_name))
    }

    #[cfg(feature = "instrument_serial")]
    fn open(&self) -> Result<Box<dyn Port>> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            // Short per-read timeout; `read_frame` enforces the line deadline.
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| {
                format!(
                    "Failed to open serial port '{}' at {} baud",
                    self.port_name, self.baud_rate
                )
            })?;
        Ok(Box::new(port))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn open(&self) -> Result<Box<dyn Port>> {
        Err(crate::error::DaqError::SerialFeatureDisabled.into())
    }
}

fn write_frame(port: &mut dyn Port, message: &str, terminator: &str) -> Result<()> {
    port.write_all(message.as_bytes())
        .and_then(|_| port.write_all(terminator.as_bytes()))
        .context("Failed to write to serial port")?;
    port.flush().context("Failed to flush serial port")
}

/// Reads byte by byte up to `delimiter`, so later responses stay in the port buffer.
fn read_frame(port: &mut dyn Port, delimiter: u8, timeout: Duration) -> Result<String> {
    let start = Instant::now();
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if start.elapsed() > timeout {
            return Err(anyhow!("Serial read timeout after {:?}", timeout));
        }
        match port.read(&mut byte) {
            Ok(0) => return Err(anyhow!("Unexpected EOF from serial port")),
            Ok(_) if byte[0] == delimiter => break,
            Ok(_) => line.push(byte[0]),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => continue,
            Err(e) => return Err(anyhow!("Serial read error: {}", e)),
        }
    }
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

#[async_trait]
impl Transport for SerialTransport {
    fn describe(&self) -> String {
        format!("serial:{}@{}", self.port_name, self.baud_rate)
    }

    async fn connect(&mut self) -> Result<()> {
        if self.port.is_none() {
            self.port = Some(Arc::new(Mutex::new(self.open()?)));
            debug!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    async fn write(&mut self, message: &str) -> Result<()> {
        let port = self.port()?;
        let command = message.to_string();
        let terminator = self.line_terminator.clone();
        tokio::task::spawn_blocking(move || write_frame(port.lock().as_mut(), &command, &terminator))
            .await
            .context("Serial I/O task panicked")??;
        debug!(port = %self.port_name, command = message, "Sent serial command");
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        let port = self.port()?;
        let (delimiter, timeout) = (self.response_delimiter, self.timeout);
        let response =
            tokio::task::spawn_blocking(move || read_frame(port.lock().as_mut(), delimiter, timeout))
                .await
                .context("Serial I/O task panicked")??;
        debug!(port = %self.port_name, response = %response, "Received serial response");
        Ok(response)
    }
}
