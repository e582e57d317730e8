//! Backoff timing for cluster interactions.
//!
//! Creating objects in the cluster is retried with an exponentially growing pause that is capped
//! per attempt and bounded in total elapsed time. [`retry_notify`] runs an operation under such a
//! strategy and reports every failed attempt before sleeping.
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::BackoffConfig;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying, or `None` once retrying should stop.
    fn next_duration(&mut self) -> Option<Duration>;
    /// Waits the prescribed amount of time (as per `next_duration`). Returns `false` when
    /// retrying should stop.
    async fn wait(&mut self) -> bool {
        match self.next_duration() {
            Some(d) => {
                tokio::time::sleep(d).await;
                true
            }
            None => false,
        }
    }
}

/// A `BackoffStrategy` in which the durations double until hitting a cap, and which gives up once
/// a total elapsed time has passed.
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    max_elapsed: Duration,
    last_duration: Duration,
    started: Instant,
}

impl Default for ExponentialBackoffStrategy {
    /// Gets the backoff used for cluster interactions: half a second to start, one minute at most
    /// per pause and three minutes in total.
    fn default() -> Self {
        Self::new(BackoffConfig {
            initial: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(180),
        })
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy from configured bounds.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            base_duration: config.initial,
            cap: config.max_interval,
            max_elapsed: config.max_elapsed,
            last_duration: Duration::from_secs(0),
            started: Instant::now(),
        }
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
        self.started = Instant::now();
    }

    fn next_duration(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= self.max_elapsed {
            return None;
        }
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        Some(next_duration)
    }
}

/// Runs `op` until it succeeds or the strategy gives up, calling `notify` with each error and the
/// pause that follows it. The last error is returned together with the number of attempts made.
pub async fn retry_notify<T, E, F, Fut, N>(
    strategy: &mut dyn BackoffStrategy,
    mut op: F,
    mut notify: N,
) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    N: FnMut(&E, Option<Duration>),
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let pause = strategy.next_duration();
                notify(&e, pause);
                match pause {
                    Some(d) => tokio::time::sleep(d).await,
                    None => return Err((e, attempts)),
                }
            }
        }
    }
}
