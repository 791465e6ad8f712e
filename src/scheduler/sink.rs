//! Consumers of published states.

use super::State;
use crate::error::AppResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Receives every published state, in strictly increasing time order.
///
/// `flush` is called every `save_interval`, `split` every `split_interval` and `close`
/// once at teardown. Storage format is entirely the sink's concern.
pub trait StateSink: Send {
    fn record(&mut self, state: &State) -> AppResult<()>;

    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Start a new output segment.
    fn split(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.flush()
    }
}

/// Keeps every state in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    states: Arc<Mutex<Vec<State>>>,
    flushes: Arc<AtomicUsize>,
    splits: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<State> {
        self.states.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn splits(&self) -> usize {
        self.splits.load(Ordering::SeqCst)
    }
}

impl StateSink for MemorySink {
    fn record(&mut self, state: &State) -> AppResult<()> {
        self.states.lock().push(state.clone());
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn split(&mut self) -> AppResult<()> {
        self.splits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
