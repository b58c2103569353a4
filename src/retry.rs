//! Policy-driven retry engine
//!
//! Runs an operation until it succeeds, the attempt budget or total timeout
//! is exhausted, or an abort rule fires for the error's class.

use rand::Rng;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorClass, ErrorKind, NetworkError, Result};
use crate::platform::StopPipe;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    Immediate,
}

/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Budget for the whole sequence; zero means unbounded
    pub timeout: Duration,
    pub strategy: BackoffStrategy,
    pub backoff_multiplier: f64,
    /// Fraction of the delay added as random jitter, 0.0..=1.0
    pub jitter_factor: f64,
    pub abort_on_auth_failure: bool,
    pub abort_on_protocol_error: bool,
    pub continue_on_network_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(5_000),
            timeout: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            abort_on_auth_failure: true,
            abort_on_protocol_error: false,
            continue_on_network_error: true,
        }
    }
}

impl RetryPolicy {
    /// LAN discovery probes
    pub fn discovery() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(2_000),
            timeout: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            backoff_multiplier: 1.0,
            jitter_factor: 0.1,
            abort_on_auth_failure: true,
            abort_on_protocol_error: false,
            continue_on_network_error: true,
        }
    }

    /// Wake packets, resent at a steady pace while the console boots
    pub fn wake() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(1_000),
            timeout: Duration::from_secs(30),
            strategy: BackoffStrategy::Fixed,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            abort_on_auth_failure: true,
            abort_on_protocol_error: false,
            continue_on_network_error: true,
        }
    }

    /// Session init and Takion handshake: 1 s, 2 s, 3 s between attempts
    pub fn session_init() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(3_000),
            timeout: Duration::from_secs(60),
            strategy: BackoffStrategy::Linear,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            abort_on_auth_failure: true,
            abort_on_protocol_error: false,
            continue_on_network_error: true,
        }
    }

    /// Short in-stream recoveries
    pub fn streaming() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2_000),
            timeout: Duration::from_secs(15),
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            abort_on_auth_failure: true,
            abort_on_protocol_error: true,
            continue_on_network_error: true,
        }
    }

    /// Full reconnect after a lost session
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(30_000),
            timeout: Duration::from_secs(120),
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter_factor: 0.25,
            abort_on_auth_failure: true,
            abort_on_protocol_error: false,
            continue_on_network_error: true,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based), before jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32 - 1);
                Duration::from_secs_f64((self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()))
            }
        };
        delay.min(self.max_delay)
    }

    /// Delay with jitter, `sample` drawn uniformly from 0.0..1.0
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let delay = self.base_delay_for(attempt);
        let jitter = self.jitter_factor.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        delay.mul_f64(1.0 + jitter).min(self.max_delay)
    }

    /// Whether an error of this class stops the sequence early
    pub fn should_abort(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::Auth => self.abort_on_auth_failure,
            ErrorClass::Protocol => self.abort_on_protocol_error,
            ErrorClass::Network => !self.continue_on_network_error,
            ErrorClass::Other => false,
        }
    }
}

/// Progress of one retry sequence
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub policy: RetryPolicy,
    /// 1-based number of the attempt in progress
    pub attempt: u32,
    pub start_time: Instant,
    pub last_attempt_time: Option<Instant>,
    pub last_error: Option<ErrorKind>,
    /// Set when an abort rule or an interrupted backoff ended the sequence
    /// before its budget ran out
    pub aborted: bool,
}

/// Time source and sleeper for the engine
pub trait RetryClock {
    fn now(&self) -> Instant;

    /// Sleep; returns `false` if interrupted
    fn sleep(&self, duration: Duration) -> bool;
}

/// Wall-clock sleeping
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl RetryClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> bool {
        std::thread::sleep(duration);
        true
    }
}

/// Sleeping that a stop-pipe can interrupt
pub struct CancelableClock<'a> {
    pub stop: &'a StopPipe,
}

impl RetryClock for CancelableClock<'_> {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> bool {
        self.stop.sleep(duration)
    }
}

/// Run `op` under `policy` with the system clock
pub fn execute<T, F>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut(&RetryContext) -> Result<T>,
{
    execute_with(policy, &SystemClock, op)
}

/// Run `op` under `policy` with an explicit clock
pub fn execute_with<T, F, C>(policy: &RetryPolicy, clock: &C, op: F) -> Result<T>
where
    F: FnMut(&RetryContext) -> Result<T>,
    C: RetryClock + ?Sized,
{
    execute_traced(policy, clock, op).0
}

/// Like [`execute_with`], also handing back the final context
pub fn execute_traced<T, F, C>(policy: &RetryPolicy, clock: &C, mut op: F) -> (Result<T>, RetryContext)
where
    F: FnMut(&RetryContext) -> Result<T>,
    C: RetryClock + ?Sized,
{
    let mut ctx = RetryContext {
        policy: policy.clone(),
        attempt: 0,
        start_time: clock.now(),
        last_attempt_time: None,
        last_error: None,
        aborted: false,
    };
    if policy.max_attempts == 0 {
        return (Err(Error::InvalidParam("retry policy allows zero attempts".into())), ctx);
    }
    let mut rng = rand::thread_rng();

    loop {
        ctx.attempt += 1;
        ctx.last_attempt_time = Some(clock.now());

        let err = match op(&ctx) {
            Ok(value) => {
                if ctx.attempt > 1 {
                    tracing::debug!(attempt = ctx.attempt, "Operation succeeded after retry");
                }
                return (Ok(value), ctx);
            }
            Err(err) => err,
        };
        ctx.last_error = Some(err.kind());

        ctx.aborted = matches!(err, Error::Network(NetworkError::Canceled)) || policy.should_abort(err.class());
        if ctx.aborted {
            tracing::warn!(attempt = ctx.attempt, "Aborting retries on {:?} error: {}", err.class(), err);
            return (Err(err), ctx);
        }
        if ctx.attempt >= policy.max_attempts {
            tracing::warn!(attempts = ctx.attempt, "Retry budget exhausted: {}", err);
            return (Err(err), ctx);
        }

        let sample = if policy.jitter_factor > 0.0 { rng.gen::<f64>() } else { 0.0 };
        let delay = policy.delay_for(ctx.attempt, sample);

        if !policy.timeout.is_zero() {
            let elapsed = clock.now().saturating_duration_since(ctx.start_time);
            let remaining = policy.timeout.saturating_sub(elapsed);
            if delay >= remaining {
                if !remaining.is_zero() {
                    clock.sleep(remaining);
                }
                tracing::warn!(attempt = ctx.attempt, "Retry timeout reached: {}", err);
                return (Err(err), ctx);
            }
        }

        tracing::debug!(
            attempt = ctx.attempt,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying: {}",
            err
        );
        ctx.aborted = !delay.is_zero() && !clock.sleep(delay);
        if ctx.aborted {
            tracing::debug!(attempt = ctx.attempt, "Retry backoff interrupted");
            return (Err(err), ctx);
        }
    }
}
