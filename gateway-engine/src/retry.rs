//! Bounded calls and exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use gateway_types::AppError;

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Upper bound of the delay before retry number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before retry number `attempt`: half the ceiling plus a random
    /// share of the other half.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let floor = ceiling / 2;
        let jitter = rand::rng().random_range(0..=ceiling - floor);
        Duration::from_millis(floor + jitter)
    }

    /// Same as [`Backoff::delay`], as a chrono offset for persisted timestamps.
    pub fn delay_chrono(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::milliseconds(self.delay(attempt).as_millis() as i64)
    }
}

/// Runs a store call under `limit`; running out of time is a transient failure.
pub async fn bounded<T, E, F>(limit: Duration, what: &'static str, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<AppError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::warn!(operation = what, "Store call timed out");
            Err(AppError::TransientDependency(format!("{} timed out", what)))
        }
    }
}

/// Converts a configured duration to a timestamp offset, saturating on overflow.
pub(crate) fn chrono_duration(value: Duration) -> chrono::Duration {
    chrono::Duration::from_std(value).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(800));
        assert_eq!(backoff.ceiling(5), Duration::from_millis(1_000));
        assert_eq!(backoff.ceiling(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_delay_stays_within_jitter_window() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        for attempt in 1..8 {
            let ceiling = backoff.ceiling(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[tokio::test]
    async fn test_bounded_times_out_as_transient() {
        let result: Result<(), AppError> = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), AppError>(())
        })
        .await;
        assert!(matches!(result, Err(AppError::TransientDependency(_))));
    }

    #[test]
    fn test_chrono_duration_saturates() {
        assert_eq!(
            chrono_duration(Duration::from_secs(90)),
            chrono::Duration::seconds(90)
        );
        assert_eq!(chrono_duration(Duration::MAX), chrono::Duration::MAX);
    }
}
