//! Mock transport for testing
//!
//! Simulates a register-based instrument without hardware:
//! - `"NAME value"` stores `value` in register `NAME`
//! - `"NAME?"` queues the register contents (empty if unset) for the next read
//!
//! It also provides:
//! - Simulated latency
//! - Controllable failure injection (next N operations, or every operation)
//! - Attempt, connect and disconnect counters
//! - An overlap detector recording the peak number of concurrent operations
//! - Call logging for test verification
//!
//! Clones share state, so a test keeps one clone for inspection and hands the other
//! to a [`ChannelHandle`](super::ChannelHandle).

use super::Transport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    registers: Mutex<HashMap<String, String>>,
    pending: Mutex<Option<String>>,
    call_log: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
    connected: AtomicBool,
    always_fail: AtomicBool,
    fail_remaining: AtomicU32,
    attempts: AtomicU32,
    connects: AtomicU32,
    disconnects: AtomicU32,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Simulated instrument transport
#[derive(Clone, Default)]
pub struct MockTransport {
    name: String,
    state: Arc<MockState>,
}

/// Decrements the in-flight counter when an operation ends, even on cancellation.
struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
        }
    }

    /// Set simulated latency per operation
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = latency;
        self
    }

    /// Fail the next `count` operations
    pub fn fail_next(&self, count: u32) {
        self.state.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Fail every operation until cleared
    pub fn set_always_fail(&self, fail: bool) {
        self.state.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_register(&self, name: &str, value: &str) {
        self.state
            .registers
            .lock()
            .insert(name.to_string(), value.to_string());
    }

    pub fn register(&self, name: &str) -> Option<String> {
        self.state.registers.lock().get(name).cloned()
    }

    /// Number of write/read/query operations attempted
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Highest number of operations observed running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.state.call_log.lock().clone()
    }

    fn log_call(&self, call: String) {
        self.state.call_log.lock().push(call);
    }

    fn check_failure(&self) -> bool {
        if self.state.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.state
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn simulate_latency(&self) {
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn apply(&self, message: &str) {
        if let Some(register) = message.strip_suffix('?') {
            let value = self
                .state
                .registers
                .lock()
                .get(register.trim())
                .cloned()
                .unwrap_or_default();
            *self.state.pending.lock() = Some(value);
        } else if let Some((register, value)) = message.split_once(' ') {
            self.set_register(register.trim(), value.trim());
        }
    }

    async fn operation(&self, call: String) -> Result<()> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.state);
        self.simulate_latency().await;
        self.log_call(call);
        if self.check_failure() {
            return Err(anyhow!("Injected failure on '{}'", self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn describe(&self) -> String {
        format!("mock:{}", self.name)
    }

    async fn connect(&mut self) -> Result<()> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.log_call("connect".to_string());
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.log_call("disconnect".to_string());
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&mut self, message: &str) -> Result<()> {
        self.operation(format!("write {}", message)).await?;
        self.apply(message);
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        self.operation("read".to_string()).await?;
        Ok(self.state.pending.lock().take().unwrap_or_default())
    }

    async fn query(&mut self, message: &str) -> Result<String> {
        self.operation(format!("query {}", message)).await?;
        self.apply(message);
        Ok(self.state.pending.lock().take().unwrap_or_default())
    }
}
