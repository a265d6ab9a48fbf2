//! Circuit breaker guarding the headless-browser upstream
//!
//! Trips after a run of consecutive failures, fails fast while open, and
//! probes with a single call once the cooldown elapses.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One probe call is in flight; its outcome decides the next state.
    HalfOpen,
}

/// Error surfaced by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker is open; the protected function was not invoked.
    #[error("circuit breaker is open")]
    Open,
    /// The protected function ran and failed.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

impl BreakerInner {
    fn on_failure(&mut self, max_failures: u32) {
        self.last_failure = Some(Instant::now());
        match self.state {
            CircuitState::HalfOpen => {
                // The probe failed; back to cooling down.
                self.state = CircuitState::Open;
            }
            CircuitState::Closed | CircuitState::Open => {
                self.failures += 1;
                if self.failures >= max_failures {
                    self.state = CircuitState::Open;
                }
            }
        }
    }

    fn on_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }
}

/// Three-state gate protecting a single slow upstream.
///
/// The lock is held across the protected invocation. That coarseness is
/// deliberate: one breaker guards one browser session at a time, and the
/// scrape loop already serializes its calls.
pub struct CircuitBreaker {
    max_failures: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Default consecutive-failure threshold.
    pub const DEFAULT_MAX_FAILURES: u32 = 3;
    /// Default cooldown before a half-open probe.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(max_failures: u32, timeout: Duration) -> Self {
        Self {
            max_failures,
            timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `fut` under the breaker.
    ///
    /// While open and inside the cooldown window this returns
    /// [`CallError::Open`] without polling `fut`. Once the cooldown has
    /// elapsed the breaker moves to half-open and lets the call probe the
    /// upstream.
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let mut inner = self.inner.lock().await;

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .last_failure
                .map(|at| at.elapsed() > self.timeout)
                .unwrap_or(true);
            if !cooled_down {
                return Err(CallError::Open);
            }
            inner.state = CircuitState::HalfOpen;
        }

        match fut.await {
            Ok(value) => {
                inner.on_success();
                Ok(value)
            }
            Err(err) => {
                inner.on_failure(self.max_failures);
                if inner.state == CircuitState::Open {
                    warn!(failures = inner.failures, "circuit breaker opened");
                }
                Err(CallError::Inner(err))
            }
        }
    }

    /// Record a failure observed outside `call` (a driver error during an
    /// already-running harvest). Query exhaustion is a normal end state
    /// and must not be reported here.
    pub(crate) async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.on_failure(self.max_failures);
        if inner.state == CircuitState::Open {
            warn!(failures = inner.failures, "circuit breaker opened");
        }
    }

    /// Current breaker position.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}
