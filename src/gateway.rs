//! Rate-limited gateway for outbound generation calls.
//!
//! The external captioning/enhancement service is quota-bound, so every
//! generation call in the process funnels through one `RateGate`. The gate
//! enforces an inter-call delay, a per-batch call ceiling, and a longer
//! cooldown when the ceiling is hit. Admission holds a mutex for the
//! duration of the wait, which is what serializes concurrent callers.
//!
//! The clock is injected so tests can observe delays without sleeping.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::generate::GenerationError;

/// Time source and sleeper, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used in production.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Rate limits for the generation service.
#[derive(Debug, Clone)]
pub struct RateGateConfig {
    /// Calls allowed before a batch cooldown kicks in.
    pub max_calls_per_batch: u32,
    /// Mandatory delay between consecutive calls.
    pub inter_call_delay: Duration,
    /// Longer delay once the batch ceiling is reached.
    pub batch_cooldown: Duration,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            max_calls_per_batch: 60,
            inter_call_delay: Duration::from_millis(1000),
            batch_cooldown: Duration::from_millis(10_000),
        }
    }
}

struct GateState {
    calls_in_batch: u32,
    last_call: Option<Instant>,
    total_calls: u64,
}

/// Process-wide admission control for external generation calls.
///
/// Constructed once and shared by reference; there is no ambient/static
/// state. Cache reads never touch the gate.
pub struct RateGate {
    config: RateGateConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<GateState>,
}

impl RateGate {
    pub fn new(config: RateGateConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(GateState {
                calls_in_batch: 0,
                last_call: None,
                total_calls: 0,
            }),
        }
    }

    /// Block until the next outbound call is allowed, then record it.
    pub fn admit(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.calls_in_batch >= self.config.max_calls_per_batch {
            log::info!(
                "generation batch ceiling ({}) reached, cooling down {:?}",
                self.config.max_calls_per_batch,
                self.config.batch_cooldown
            );
            self.clock.sleep(self.config.batch_cooldown);
            state.calls_in_batch = 0;
        }

        if let Some(last) = state.last_call {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < self.config.inter_call_delay {
                self.clock.sleep(self.config.inter_call_delay - elapsed);
            }
        }

        state.last_call = Some(self.clock.now());
        state.calls_in_batch += 1;
        state.total_calls += 1;
    }

    /// Total calls admitted since construction.
    pub fn total_calls(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .total_calls
    }
}

/// Bounded retry with exponential backoff and jitter.
///
/// Only `GenerationError::Retryable` failures are retried; terminal
/// failures surface immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Run `f` until it succeeds, fails terminally, or attempts run out.
    pub fn run<T, F>(&self, clock: &dyn Clock, mut f: F) -> Result<T, GenerationError>
    where
        F: FnMut() -> Result<T, GenerationError>,
    {
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(GenerationError::Retryable(msg)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(GenerationError::Retryable(format!(
                            "{msg} (gave up after {attempt} attempts)"
                        )));
                    }
                    let delay = self.base_delay * 2u32.pow(attempt - 1)
                        + Duration::from_millis(rand_jitter());
                    log::info!(
                        "generation call failed (attempt {}/{}): {}, backing off {:?}",
                        attempt,
                        self.max_attempts,
                        msg,
                        delay
                    );
                    clock.sleep(delay);
                }
                Err(terminal) => return Err(terminal),
            }
        }
    }
}

fn rand_jitter() -> u64 {
    rand::random::<u64>() % 250
}


#[cfg(test)]
mod tests {
    use super::testing::FakeClock;
    use super::*;

    fn fast_config() -> RateGateConfig {
        RateGateConfig {
            max_calls_per_batch: 3,
            inter_call_delay: Duration::from_millis(100),
            batch_cooldown: Duration::from_millis(1000),
        }
    }

    #[test]
    fn test_first_call_admits_without_delay() {
        let clock = Arc::new(FakeClock::new());
        let gate = RateGate::new(fast_config(), clock.clone());

        gate.admit();
        assert_eq!(gate.total_calls(), 1);
        assert_eq!(clock.total_slept(), Duration::ZERO);
    }

    #[test]
    fn test_inter_call_delay_enforced() {
        let clock = Arc::new(FakeClock::new());
        let gate = RateGate::new(fast_config(), clock.clone());

        gate.admit();
        gate.admit();

        // Second admission had to wait out the inter-call delay.
        assert_eq!(clock.total_slept(), Duration::from_millis(100));
    }

    #[test]
    fn test_batch_cooldown_after_ceiling() {
        let clock = Arc::new(FakeClock::new());
        let gate = RateGate::new(fast_config(), clock.clone());

        for _ in 0..4 {
            gate.admit();
        }

        let slept = clock.slept.lock().unwrap().clone();
        // Three inter-call delays plus one cooldown when the 4th call
        // crossed the ceiling of 3.
        assert!(slept.contains(&Duration::from_millis(1000)));
        assert_eq!(gate.total_calls(), 4);
    }

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let clock = FakeClock::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let mut calls = 0;
        let result = policy.run(&clock, || {
            calls += 1;
            if calls < 3 {
                Err(GenerationError::Retryable("flaky".into()))
            } else {
                Ok("caption".to_string())
            }
        });

        assert_eq!(result.unwrap(), "caption");
        assert_eq!(calls, 3);
        // Two backoffs were requested.
        assert_eq!(clock.slept.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let clock = FakeClock::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(10));

        let mut calls = 0;
        let result: Result<(), _> = policy.run(&clock, || {
            calls += 1;
            Err(GenerationError::Retryable("down".into()))
        });

        assert!(matches!(result, Err(GenerationError::Retryable(_))));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_terminal_error_not_retried() {
        let clock = FakeClock::new();
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        let mut calls = 0;
        let result: Result<(), _> = policy.run(&clock, || {
            calls += 1;
            Err(GenerationError::Terminal("bad request".into()))
        });

        assert!(matches!(result, Err(GenerationError::Terminal(_))));
        assert_eq!(calls, 1);
    }
}
