use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Fixed-interval pacing between consecutive requests.
///
/// The first request goes out immediately; each later one waits until at
/// least `interval` has passed since the previous request was released.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    state: Arc<Mutex<RateLimiterState>>,
}

#[derive(Debug, Default)]
struct RateLimiterState {
    /// When the last request was released
    last_request_time: Option<Instant>,
    /// Number of requests released so far
    total_requests: u64,
    /// Sum of all waits imposed
    total_waited: Duration,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(RateLimiterState::default())),
        }
    }

    /// Wait until the next request may be made, returning the time waited.
    pub async fn wait_for_request(&self) -> Duration {
        let delay = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let release_at = match state.last_request_time {
                Some(last) => (last + self.interval).max(now),
                None => now,
            };
            // Reserve the slot before sleeping so clones queue behind each other
            state.last_request_time = Some(release_at);
            state.total_requests += 1;
            let delay = release_at - now;
            state.total_waited += delay;
            delay
        };

        if !delay.is_zero() {
            debug!("Rate limiter waiting for {:?}", delay);
            tokio::time::sleep(delay).await;
        }

        delay
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        let state = self.state.lock();
        RateLimiterStats {
            interval: self.interval,
            total_requests: state.total_requests,
            total_waited: state.total_waited,
        }
    }
}

/// Statistics about rate limiter usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub interval: Duration,
    pub total_requests: u64,
    pub total_waited: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_millis(200));

        let start = Instant::now();
        let waited = limiter.wait_for_request().await;

        assert_eq!(waited, Duration::ZERO);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_second_request_waits_for_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(150));

        let start = Instant::now();
        limiter.wait_for_request().await;
        limiter.wait_for_request().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(140));
        assert!(elapsed <= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_no_wait_after_interval_already_passed() {
        let limiter = RateLimiter::new(Duration::from_millis(50));

        limiter.wait_for_request().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let waited = limiter.wait_for_request().await;

        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_zero_interval_never_waits() {
        let limiter = RateLimiter::new(Duration::ZERO);
        for _ in 0..5 {
            assert_eq!(limiter.wait_for_request().await, Duration::ZERO);
        }
        let stats = limiter.get_stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.total_waited, Duration::ZERO);
    }
}
