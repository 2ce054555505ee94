// SPDX-License-Identifier: MIT OR Apache-2.0
//! Three-state circuit breaker guarding a single named dependency
//! (a broker connection, an enrichment provider, a rule store).

use pipeline_error::{ErrorCode, PipelineError};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    /// Stable 0/1/2 encoding for gauge export.
    pub fn as_code(self) -> i64 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

/// Tunables for [`CircuitBreaker`], mirroring `pipeline_config::CircuitBreakerConfig`.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Minimum requests observed in a closed-state sampling window before
    /// `ready_to_trip` is even consulted.
    pub min_requests: u64,
    /// Failure ratio (0-100) at or above which the breaker trips.
    pub failure_ratio_pct: u8,
    /// Length of the closed-state sampling window. Counts reset at each
    /// window boundary regardless of whether the breaker tripped.
    pub interval: Duration,
    /// Time the breaker stays open before allowing a half-open probe.
    pub open_timeout: Duration,
    /// Consecutive successes required in half-open to close again; also
    /// the concurrency cap on in-flight half-open probes.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            failure_ratio_pct: 50,
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u64,
    failures: u64,
    consecutive_successes: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.requests += 1;
        self.consecutive_successes += 1;
    }

    fn on_failure(&mut self) {
        self.requests += 1;
        self.failures += 1;
        self.consecutive_successes = 0;
    }

    fn failure_ratio_pct(&self) -> u64 {
        if self.requests == 0 {
            return 0;
        }
        self.failures * 100 / self.requests
    }
}

struct Inner {
    state: State,
    counts: Counts,
    generation_started_at: Instant,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// A named circuit breaker protecting calls to a single dependency.
///
/// Follows the standard generation-counted design: the closed state
/// samples failures over rolling `interval` windows and trips when
/// `ready_to_trip` holds at a window boundary; the open state rejects
/// every call until `open_timeout` has elapsed, then allows a bounded
/// number of half-open probes; a run of `half_open_max_requests`
/// consecutive successes closes the breaker again, while any half-open
/// failure reopens it with a fresh timeout.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// A token returned by [`CircuitBreaker::admit`] that must be resolved
/// with [`CircuitBreaker::record_success`] or
/// [`CircuitBreaker::record_failure`] once the guarded call completes.
pub struct Admission {
    generation_started_at: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                counts: Counts::default(),
                generation_started_at: now,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn state_code(&self) -> i64 {
        self.state().as_code()
    }

    /// Decide whether a call may proceed right now. Returns `Ok(Admission)`
    /// to grant it (the caller must resolve the token afterwards) or an
    /// error when the breaker is open or a half-open probe slot is full.
    pub fn admit(&self) -> Result<Admission, PipelineError> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        let now = Instant::now();

        match inner.state {
            State::Closed => {
                if now.duration_since(inner.generation_started_at) >= self.config.interval {
                    inner.counts = Counts::default();
                    inner.generation_started_at = now;
                }
            }
            State::Open => {
                let opened_at = inner.opened_at.expect("open state always has opened_at");
                if now.duration_since(opened_at) >= self.config.open_timeout {
                    debug!(breaker = %self.name, "circuit breaker moving to half-open");
                    inner.state = State::HalfOpen;
                    inner.counts = Counts::default();
                    inner.generation_started_at = now;
                    inner.half_open_in_flight = 0;
                } else {
                    return Err(PipelineError::new(
                        ErrorCode::CircuitOpen,
                        format!("circuit breaker '{}' is open", self.name),
                    )
                    .with_context("dependency", self.name.clone()));
                }
            }
            State::HalfOpen => {}
        }

        if inner.state == State::HalfOpen {
            if inner.half_open_in_flight >= self.config.half_open_max_requests {
                return Err(PipelineError::new(
                    ErrorCode::CircuitOpen,
                    format!("circuit breaker '{}' half-open probe slots full", self.name),
                )
                .with_context("dependency", self.name.clone()));
            }
            inner.half_open_in_flight += 1;
        }

        Ok(Admission {
            generation_started_at: inner.generation_started_at,
        })
    }

    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == State::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        if inner.generation_started_at != admission.generation_started_at {
            return;
        }
        inner.counts.on_success();

        match inner.state {
            State::HalfOpen => {
                if inner.counts.consecutive_successes >= self.config.half_open_max_requests {
                    debug!(breaker = %self.name, "circuit breaker closing after successful probes");
                    inner.state = State::Closed;
                    inner.counts = Counts::default();
                    inner.generation_started_at = Instant::now();
                    inner.opened_at = None;
                }
            }
            State::Closed => self.maybe_trip(&mut inner),
            State::Open => {}
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == State::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        if inner.generation_started_at != admission.generation_started_at && inner.state != State::HalfOpen {
            return;
        }

        match inner.state {
            State::HalfOpen => {
                warn!(breaker = %self.name, "circuit breaker reopening after failed probe");
                self.trip(&mut inner);
            }
            State::Closed => {
                inner.counts.on_failure();
                self.maybe_trip(&mut inner);
            }
            State::Open => {}
        }
    }

    fn maybe_trip(&self, inner: &mut Inner) {
        let ready = inner.counts.requests >= self.config.min_requests
            && inner.counts.failure_ratio_pct() >= self.config.failure_ratio_pct as u64;
        if ready {
            warn!(
                breaker = %self.name,
                requests = inner.counts.requests,
                failures = inner.counts.failures,
                "circuit breaker tripping open"
            );
            self.trip(inner);
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = State::Open;
        inner.opened_at = Some(Instant::now());
        inner.counts = Counts::default();
        inner.half_open_in_flight = 0;
    }

    /// Run `f` through the breaker, recording success or failure based on
    /// whether it returns `Ok`. Short-circuits with `ErrorCode::CircuitOpen`
    /// without invoking `f` when the breaker is open or the half-open
    /// probe budget is exhausted.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        let admission = self.admit()?;
        match f().await {
            Ok(v) => {
                self.record_success(admission);
                Ok(v)
            }
            Err(e) => {
                self.record_failure(admission);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            min_requests: 2,
            failure_ratio_pct: 50,
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_millis(20),
            half_open_max_requests: 2,
        }
    }

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new("dep", cfg());
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let cb = CircuitBreaker::new("dep", cfg());
        let a = cb.admit().unwrap();
        cb.record_failure(a);
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn trips_open_when_failure_ratio_reached() {
        let cb = CircuitBreaker::new("dep", cfg());
        let a1 = cb.admit().unwrap();
        cb.record_failure(a1);
        let a2 = cb.admit().unwrap();
        cb.record_failure(a2);
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn open_rejects_calls_until_timeout() {
        let cb = CircuitBreaker::new("dep", cfg());
        let a1 = cb.admit().unwrap();
        cb.record_failure(a1);
        let a2 = cb.admit().unwrap();
        cb.record_failure(a2);
        assert_eq!(cb.state(), State::Open);

        let err = cb.admit().unwrap_err();
        assert_eq!(err.code, ErrorCode::CircuitOpen);
    }

    #[tokio::test]
    async fn half_open_closes_after_consecutive_successes() {
        let cb = CircuitBreaker::new("dep", cfg());
        let a1 = cb.admit().unwrap();
        cb.record_failure(a1);
        let a2 = cb.admit().unwrap();
        cb.record_failure(a2);
        assert_eq!(cb.state(), State::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let probe1 = cb.admit().unwrap();
        assert_eq!(cb.state(), State::HalfOpen);
        cb.record_success(probe1);
        assert_eq!(cb.state(), State::HalfOpen);

        let probe2 = cb.admit().unwrap();
        cb.record_success(probe2);
        assert_eq!(cb.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_any_failure() {
        let cb = CircuitBreaker::new("dep", cfg());
        let a1 = cb.admit().unwrap();
        cb.record_failure(a1);
        let a2 = cb.admit().unwrap();
        cb.record_failure(a2);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let probe = cb.admit().unwrap();
        assert_eq!(cb.state(), State::HalfOpen);
        cb.record_failure(probe);
        assert_eq!(cb.state(), State::Open);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let cb = CircuitBreaker::new("dep", cfg());
        let a1 = cb.admit().unwrap();
        cb.record_failure(a1);
        let a2 = cb.admit().unwrap();
        cb.record_failure(a2);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let _p1 = cb.admit().unwrap();
        let _p2 = cb.admit().unwrap();
        let p3 = cb.admit();
        assert!(p3.is_err());
    }

    #[tokio::test]
    async fn call_helper_records_outcomes() {
        let cb = CircuitBreaker::new("dep", cfg());
        let ok: Result<u32, PipelineError> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32, PipelineError> = cb
            .call(|| async { Err(PipelineError::new(ErrorCode::BrokerFetchError, "boom")) })
            .await;
        assert!(err.is_err());
    }
}
