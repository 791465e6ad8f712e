use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Stopwatch {
    accumulated: Duration,
    running_since: Option<Instant>,
}

/// Experiment time: a stopwatch that only advances while the run is `Running`.
///
/// Shared between the scheduler and the async-mode routine loops, hence the interior
/// lock.
#[derive(Debug, Default)]
pub struct Clock {
    inner: Mutex<Stopwatch>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume(&self) {
        let mut watch = self.inner.lock();
        if watch.running_since.is_none() {
            watch.running_since = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut watch = self.inner.lock();
        if let Some(since) = watch.running_since.take() {
            watch.accumulated += since.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running_since.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        let watch = self.inner.lock();
        watch.accumulated + watch.running_since.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn seconds(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}
