//! Deterministic retry backoff.
//!
//! One generic retry core, parameterised by the spawn callable and the
//! sleep callable, is shared by the launcher trait's default
//! `spawn_with_retry` and by tests that substitute recorded fakes. Sync
//! and async callers therefore share semantics exactly.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SpawnResult;

/// Backoff strategies for spawn retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Delay before retry number `attempt + 1`, for 1-based `attempt`.
///
/// - exponential: `min(max, base * 2^(attempt - 1))`
/// - linear: `min(max, base * attempt)`
/// - fixed: `min(max, base)`
pub fn calculate_delay(
    attempt: u32,
    strategy: BackoffStrategy,
    base_seconds: u64,
    max_seconds: u64,
) -> Duration {
    debug_assert!(attempt >= 1, "attempt numbering is 1-based");
    let attempt = attempt.max(1);
    let raw = match strategy {
        BackoffStrategy::Exponential => base_seconds.saturating_mul(
            2u64.saturating_pow(attempt - 1),
        ),
        BackoffStrategy::Linear => base_seconds.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Fixed => base_seconds,
    };
    Duration::from_secs(raw.min(max_seconds))
}

/// Retry policy for worker spawns.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_seconds: u64,
    pub max_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_seconds: 2,
            max_seconds: 30,
        }
    }
}

/// The shared retry core.
///
/// `spawn_fn` is attempted up to `policy.max_attempts` times; between
/// failed attempts `sleep_fn` is awaited with the calculated delay. No
/// sleep after the final attempt.
pub async fn spawn_with_retry<S, SF, D, DF>(
    worker_id: u32,
    policy: &RetryPolicy,
    mut spawn_fn: S,
    mut sleep_fn: D,
) -> SpawnResult
where
    S: FnMut() -> SF,
    SF: Future<Output = SpawnResult>,
    D: FnMut(Duration) -> DF,
    DF: Future<Output = ()>,
{
    let mut last_error = String::from("unknown error");

    for attempt in 1..=policy.max_attempts.max(1) {
        tracing::info!(
            worker_id,
            attempt,
            max_attempts = policy.max_attempts,
            "spawn attempt"
        );
        let result = spawn_fn().await;
        if result.success {
            if attempt > 1 {
                tracing::info!(worker_id, attempt, "spawn succeeded after retry");
            }
            return result;
        }

        last_error = result.error.unwrap_or_else(|| "unknown error".into());
        tracing::warn!(worker_id, attempt, error = %last_error, "spawn attempt failed");

        if attempt < policy.max_attempts {
            let delay =
                calculate_delay(attempt, policy.strategy, policy.base_seconds, policy.max_seconds);
            tracing::info!(worker_id, delay_secs = delay.as_secs(), "backing off before retry");
            sleep_fn(delay).await;
        }
    }

    tracing::error!(
        worker_id,
        attempts = policy.max_attempts,
        error = %last_error,
        "all spawn attempts failed"
    );
    SpawnResult {
        success: false,
        worker_id,
        handle: None,
        error: Some(format!(
            "all {} spawn attempts failed, last error: {last_error}",
            policy.max_attempts
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let d = |n| calculate_delay(n, BackoffStrategy::Exponential, 2, 30).as_secs();
        assert_eq!(d(1), 2);
        assert_eq!(d(2), 4);
        assert_eq!(d(3), 8);
        assert_eq!(d(4), 16);
        assert_eq!(d(5), 30); // capped from 32
        assert_eq!(d(60), 30); // no overflow
    }

    #[test]
    fn linear_delay_grows_and_caps() {
        let d = |n| calculate_delay(n, BackoffStrategy::Linear, 5, 12).as_secs();
        assert_eq!(d(1), 5);
        assert_eq!(d(2), 10);
        assert_eq!(d(3), 12);
    }

    #[test]
    fn fixed_delay_is_constant() {
        let d = |n| calculate_delay(n, BackoffStrategy::Fixed, 7, 30).as_secs();
        assert_eq!(d(1), 7);
        assert_eq!(d(9), 7);
    }

    #[test]
    fn fixed_delay_respects_cap() {
        assert_eq!(
            calculate_delay(1, BackoffStrategy::Fixed, 60, 30).as_secs(),
            30
        );
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = spawn_with_retry(
            0,
            &RetryPolicy::default(),
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        SpawnResult::failure(0, "transient")
                    } else {
                        SpawnResult {
                            success: true,
                            worker_id: 0,
                            handle: None,
                            error: None,
                        }
                    }
                }
            },
            |_| async {},
        )
        .await;

        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_exhaustion_reports_last_error() {
        let slept: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let slept_clone = Arc::clone(&slept);

        let policy = RetryPolicy {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_seconds: 2,
            max_seconds: 30,
        };
        let result = spawn_with_retry(
            7,
            &policy,
            || async { SpawnResult::failure(7, "image missing") },
            move |d| {
                slept_clone.lock().unwrap().push(d);
                async {}
            },
        )
        .await;

        assert!(!result.success);
        assert!(result.handle.is_none());
        assert!(result.error.unwrap().contains("image missing"));
        // Two sleeps for three attempts, with exponential spacing.
        let slept = slept.lock().unwrap();
        assert_eq!(
            slept.as_slice(),
            &[Duration::from_secs(2), Duration::from_secs(4)]
        );
    }
}
