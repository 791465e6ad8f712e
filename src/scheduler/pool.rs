use crate::error::{AppResult, DaqError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::error;

/// Bounded fan-out: at most `size` Tokio tasks drain a shared job queue.
///
/// [`run`](Self::run) returns once every job has finished (a barrier) with results in
/// job order. A panicking job is reported as [`DaqError::Task`] for every job its
/// worker had not yet returned.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn run<T>(&self, jobs: Vec<BoxFuture<'static, T>>) -> Vec<AppResult<T>>
    where
        T: Send + 'static,
    {
        let count = jobs.len();
        if count == 0 {
            return Vec::new();
        }
        let queue = Arc::new(Mutex::new(
            jobs.into_iter().enumerate().collect::<VecDeque<_>>(),
        ));

        let workers: Vec<_> = (0..self.size.min(count))
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut finished = Vec::new();
                    loop {
                        let next = queue.lock().pop_front();
                        let Some((index, job)) = next else {
                            break;
                        };
                        finished.push((index, job.await));
                    }
                    finished
                })
            })
            .collect();

        let mut results: Vec<Option<T>> = (0..count).map(|_| None).collect();
        for worker in workers {
            match worker.await {
                Ok(finished) => {
                    for (index, result) in finished {
                        results[index] = Some(result);
                    }
                }
                Err(err) => error!(error = %err, "Worker task failed"),
            }
        }
        results
            .into_iter()
            .map(|r| r.ok_or_else(|| DaqError::Task("job did not complete".to_string())))
            .collect()
    }
}
