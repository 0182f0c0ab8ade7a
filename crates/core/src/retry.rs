//! Bounded retry with a fixed delay.
//!
//! Every polling loop in the driver has the same shape: try a bounded number
//! of times, sleeping a fixed interval between tries. The loops differ only in
//! their constants and in what "exhausted" means to the caller, so
//! [`RetryPolicy::poll`] reports exhaustion as `Ok(None)` and lets each caller
//! pick its own error kind.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Upper bound on the time spent sleeping across all attempts.
    pub fn total(&self) -> Duration {
        self.delay * self.attempts
    }

    /// Runs `op` until it yields `Some`, an error, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Errors are returned
    /// immediately; only `Ok(None)` is retried. No sleep follows the final
    /// attempt.
    pub async fn poll<T, F, Fut>(&self, mut op: F) -> Result<Option<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        for attempt in 1..=self.attempts {
            if let Some(value) = op(attempt).await? {
                return Ok(Some(value));
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }
        Ok(None)
    }
}

/// Retry constants for each polling loop in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub destroy: RetryPolicy,
    pub boot_loader: RetryPolicy,
    /// One attempt per nmdm pair: `attempts` bounds how many pairs are
    /// searched (at most [`MAX_CONSOLE_DEVICES`](crate::MAX_CONSOLE_DEVICES)).
    pub console_probe: RetryPolicy,
    pub lease: RetryPolicy,
    pub ssh: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            destroy: RetryPolicy::new(16, Duration::from_millis(100)),
            boot_loader: RetryPolicy::new(16, Duration::from_millis(100)),
            console_probe: RetryPolicy::new(crate::MAX_CONSOLE_DEVICES, Duration::from_secs(1)),
            lease: RetryPolicy::new(60, Duration::from_secs(2)),
            ssh: RetryPolicy::new(60, Duration::from_secs(2)),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
