use std::time::Duration;

use futures::future::BoxFuture;

use loom_core::config::RetryConfig;

/// Delay applied between node retry attempts.
///
/// Pluggable so tests can swap in [`NoBackoff`] and never sleep.
pub trait Backoff: Send + Sync + 'static {
    /// Wait before retry number `attempt` (1 for the first retry).
    fn wait(&self, attempt: u32) -> BoxFuture<'_, ()>;
}

/// Retry immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn wait(&self, _attempt: u32) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Doubling delay capped at `max_backoff_ms`, with optional 0.8x-1.2x jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, &self.config)
    }
}

impl Backoff for ExponentialBackoff {
    fn wait(&self, attempt: u32) -> BoxFuture<'_, ()> {
        let delay = self.delay(attempt);
        Box::pin(tokio::time::sleep(delay))
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(exp))
        .min(config.max_backoff_ms);
    if !config.jitter {
        return Duration::from_millis(ms);
    }
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: bool) -> RetryConfig {
        RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter,
        }
    }

    #[test]
    fn doubles_and_caps() {
        let backoff = ExponentialBackoff::new(config(false));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_millis(1000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let backoff = ExponentialBackoff::new(config(true));
        for _ in 0..50 {
            let ms = backoff.delay(2).as_millis();
            assert!((160..=240).contains(&ms), "{}", ms);
        }
    }

    #[tokio::test]
    async fn no_backoff_returns_immediately() {
        let start = std::time::Instant::now();
        NoBackoff.wait(5).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
