use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempt is 1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1_u32 << shift)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached. `op` receives the 1-based attempt number.
pub fn retry_with_backoff<T, E, F, R>(policy: RetryPolicy, is_retryable: R, op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    retry_with_sleep(policy, is_retryable, op, std::thread::sleep)
}

fn retry_with_sleep<T, E, F, R, S>(
    policy: RetryPolicy,
    is_retryable: R,
    mut op: F,
    mut sleep: S,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
    S: FnMut(Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max_attempts || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = policy.delay_after(attempt);
                tracing::debug!(attempt, ?delay, "retrying after failure");
                sleep(delay);
                attempt += 1;
            }
        }
    }
}
