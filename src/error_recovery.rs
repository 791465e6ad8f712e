//! Retry and reconnect strategy for instrument operations.
//!
//! Every primitive instrument operation runs under [`retry_with_reconnect`]: the
//! operation is attempted up to `max_attempts` times; when a round of attempts is spent
//! the endpoint is reconnected and a fresh round begins, for at most `max_reconnects`
//! reconnects. A timeout, a transport error and a rejected response all count as a
//! failed attempt. When both budgets are spent the caller gets
//! [`DaqError::Communication`].

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts per round, before a reconnect.
    pub max_attempts: u32,
    /// Reconnects before giving up.
    pub max_reconnects: u32,
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Pause between disconnecting and connecting again.
    pub reconnect_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_reconnects: 1,
            timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Upper bound on the attempts a single operation can make.
    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1) * self.max_reconnects.max(1)
    }
}

/// An operation bound to an endpoint that can be re-established.
#[async_trait]
pub trait Recoverable: Send {
    type Output: Send;

    /// One try of the operation.
    async fn attempt(&mut self) -> anyhow::Result<Self::Output>;

    /// Tear down and re-open the underlying endpoint.
    async fn reconnect(&mut self) -> anyhow::Result<()>;
}

/// Runs `target` until it succeeds or both retry budgets are exhausted.
pub async fn retry_with_reconnect<R>(
    channel: &str,
    target: &mut R,
    policy: &RetryPolicy,
) -> AppResult<R::Output>
where
    R: Recoverable + ?Sized,
{
    let rounds = policy.max_reconnects.max(1);
    let mut attempts = 0u32;
    let mut reconnects = 0u32;
    let mut last = String::from("no attempt made");

    for _ in 0..rounds {
        for _ in 0..policy.max_attempts.max(1) {
            attempts += 1;
            match timeout(policy.timeout, target.attempt()).await {
                Ok(Ok(output)) => {
                    if attempts > 1 {
                        debug!(channel, attempts, reconnects, "Operation recovered");
                    }
                    return Ok(output);
                }
                Ok(Err(err)) => last = format!("{:#}", err),
                Err(_) => last = format!("timed out after {:?}", policy.timeout),
            }
            warn!(channel, attempt = attempts, error = %last, "Operation failed");
        }

        if reconnects < policy.max_reconnects {
            reconnects += 1;
            warn!(channel, reconnect = reconnects, "Attempts exhausted, reconnecting");
            sleep(policy.reconnect_delay).await;
            if let Err(err) = target.reconnect().await {
                warn!(channel, error = %err, "Reconnect failed");
                last = format!("reconnect failed: {:#}", err);
            }
        }
    }

    error!(channel, attempts, reconnects, error = %last, "Channel exhausted");
    Err(DaqError::Communication {
        channel: channel.to_string(),
        attempts,
        reconnects,
        last,
    })
}
