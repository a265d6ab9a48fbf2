//! Pacing gate for upstream-touching actions
//!
//! Enforces a jittered minimum interval between browser actions so one
//! scrape loop cannot hammer the upstream. Shared by reference; safe to
//! call from multiple tasks.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

/// Default upper bound for the random jitter added to each wait.
const DEFAULT_JITTER_MAX: Duration = Duration::from_millis(1000);

/// Serializes upstream actions with a minimum spacing plus jitter.
///
/// The lock is held only to reserve the next release slot; the sleep
/// itself happens after release, so concurrent waiters queue up behind
/// monotonically increasing deadlines and any two `wait` returns are at
/// least `min_delay` apart.
pub struct RateLimiter {
    min_delay: Duration,
    jitter_max: Duration,
    next_release: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(min_delay: Duration) -> Self {
        Self::with_jitter(min_delay, DEFAULT_JITTER_MAX)
    }

    pub fn with_jitter(min_delay: Duration, jitter_max: Duration) -> Self {
        Self {
            min_delay,
            jitter_max,
            next_release: Mutex::new(Instant::now()),
        }
    }

    /// Block until at least `min_delay` has passed since the previous
    /// `wait` return, then add uniform jitter in `[0, jitter_max]`.
    ///
    /// No cancellation point of its own; callers that need a bound wrap
    /// the future in their own timeout.
    pub async fn wait(&self) {
        let jitter = if self.jitter_max.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=self.jitter_max)
        };

        let deadline = {
            let mut next = self.next_release.lock();
            let now = Instant::now();
            let deadline = next.max(now) + jitter;
            *next = deadline + self.min_delay;
            deadline
        };

        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn successive_waits_are_spaced_by_min_delay() {
        let limiter = RateLimiter::with_jitter(Duration::from_millis(500), Duration::ZERO);

        limiter.wait().await;
        let first = Instant::now();
        limiter.wait().await;
        let second = Instant::now();
        limiter.wait().await;
        let third = Instant::now();

        assert!(second - first >= Duration::from_millis(500));
        assert!(third - second >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_do_not_share_a_slot() {
        let limiter = Arc::new(RateLimiter::with_jitter(
            Duration::from_millis(200),
            Duration::ZERO,
        ));

        let start = Instant::now();
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.wait().await;
                    Instant::now()
                })
            })
            .collect();

        let mut returns = Vec::new();
        for task in tasks {
            returns.push(task.await.unwrap());
        }
        returns.sort();

        for pair in returns.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        // Four waiters queue behind three full delays at minimum.
        assert!(returns[3] - start >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_bound() {
        let limiter = RateLimiter::with_jitter(
            Duration::from_millis(100),
            Duration::from_millis(50),
        );

        limiter.wait().await;
        let first = Instant::now();
        limiter.wait().await;
        let gap = Instant::now() - first;

        assert!(gap >= Duration::from_millis(100));
        assert!(gap <= Duration::from_millis(151));
    }
}
