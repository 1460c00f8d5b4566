//! Retry policies evaluated inside orchestrations. Each attempt schedules a
//! fresh operation (new correlation id) and each backoff pause is a durable
//! timer, so the whole loop replays deterministically from history.

use std::time::Duration;

use crate::OrchestrationContext;

/// Delay progression between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl BackoffStrategy {
    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => {
                let scaled = base.saturating_mul(attempt);
                scaled.min(*max)
            }
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let millis = (base.as_millis() as f64) * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis as u64).min(*max)
                }
            }
        }
    }
}

/// Retry budget for an activity or sub-orchestration call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Must be at least 1.
    pub max_attempts: u32,
    /// Cap on the cumulative backoff delay; once the next pause would cross
    /// it the loop gives up with a timeout error instead of waiting.
    pub timeout: Option<Duration>,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            timeout: None,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            },
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Drive `op` under `policy`. `op` is handed the 1-based attempt number and
/// must schedule a new durable operation each call. Elapsed time is the sum
/// of scheduled backoff delays, never the wall clock, so give-up decisions
/// replay identically.
pub(crate) async fn run_retry_loop<F, Fut>(
    ctx: &OrchestrationContext,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<String, String>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let mut elapsed = Duration::ZERO;
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.backoff.delay_for_attempt(attempt);
                if let Some(timeout) = policy.timeout {
                    if elapsed + delay >= timeout {
                        return Err(format!(
                            "timeout: retry budget of {}ms exhausted after attempt {attempt}: {err}",
                            timeout.as_millis()
                        ));
                    }
                }
                if !delay.is_zero() {
                    ctx.schedule_timer(delay).into_timer().await;
                }
                elapsed += delay;
                attempt += 1;
            }
        }
    }
}
