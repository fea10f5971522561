//! Request pacing and retry backoff.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Called after every outbound request to stay under the API rate limit.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pace(&self);
}

/// Keeps consecutive `pace()` calls at least `interval` apart.
pub struct IntervalPacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl IntervalPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// How long the next `pace()` has to wait, given the current time
    fn wait_time(&self, now: Instant) -> Duration {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(prev) => self.interval.saturating_sub(now.duration_since(prev)),
            None => self.interval,
        }
    }
}

#[async_trait]
impl Pacer for IntervalPacer {
    async fn pace(&self) {
        let wait = self.wait_time(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }
}

/// No delay at all
#[cfg(test)]
pub struct NoPacer;

#[cfg(test)]
#[async_trait]
impl Pacer for NoPacer {
    async fn pace(&self) {}
}

/// Bounded retry with linear backoff (`backoff * attempt`)
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    /// Delay before the next try, after `attempt` failed attempts (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(3));
        assert_eq!(policy.delay_for(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for(2), Duration::from_secs(6));
        assert_eq!(policy.delay_for(5), Duration::from_secs(15));
    }

    #[test]
    fn test_interval_pacer_wait_time() {
        let pacer = IntervalPacer::new(Duration::from_millis(500));
        let now = Instant::now();
        assert_eq!(pacer.wait_time(now), Duration::from_millis(500));

        *pacer.last.lock().unwrap() = Some(now);
        assert_eq!(pacer.wait_time(now + Duration::from_millis(200)), Duration::from_millis(300));
        assert_eq!(pacer.wait_time(now + Duration::from_secs(2)), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_zero_interval_pacer_does_not_sleep() {
        let pacer = IntervalPacer::new(Duration::ZERO);
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
