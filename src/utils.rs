//! Utility functions for the naneos-devices crate.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Current wall-clock time as whole Unix seconds.
#[inline]
pub fn unix_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Time left until the next wall-clock second boundary.
///
/// Ticking on boundaries instead of sleeping a fixed second keeps a loop
/// from drifting against wall-clock time.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use naneos_devices::utils::until_next_second;
///
/// let now = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
/// assert_eq!(until_next_second(now).as_millis(), 750);
/// ```
pub fn until_next_second(now: DateTime<Utc>) -> Duration {
    let nanos = u64::from(now.nanosecond() % 1_000_000_000);
    Duration::from_nanos(1_000_000_000 - nanos)
}

/// Keeps per-device timestamps non-decreasing.
///
/// Wall-clock adjustments can move `now` backwards; the clamp then repeats
/// the last issued second, and the aggregate's last-wins rule merges the two
/// records.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock {
    last: Option<i64>,
}

impl MonotonicClock {
    /// Create a clock that has not issued any timestamp yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp `now` so it never goes below the previously issued value.
    pub fn clamp(&mut self, now: i64) -> i64 {
        let ts = match self.last {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last = Some(ts);
        ts
    }

    /// Issue a timestamp for the current wall-clock second.
    pub fn now(&mut self) -> i64 {
        self.clamp(unix_timestamp())
    }
}

/// Run `fut` with an upper time bound, mapping expiry to [`Error::Timeout`].
pub async fn time_boxed<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation)),
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `false` when the sleep was cut short by cancellation.
pub async fn cancellable_sleep(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_until_next_second() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(until_next_second(now), Duration::from_secs(1));

        let now = Utc.timestamp_opt(1_700_000_000, 999_000_000).unwrap();
        assert_eq!(until_next_second(now), Duration::from_millis(1));
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let mut clock = MonotonicClock::new();
        assert_eq!(clock.clamp(100), 100);
        assert_eq!(clock.clamp(101), 101);
        assert_eq!(clock.clamp(99), 101);
        assert_eq!(clock.clamp(101), 101);
        assert_eq!(clock.clamp(105), 105);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_boxed_expires() {
        let result: Result<()> = time_boxed("stuck", Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { ref operation }) if operation == "stuck"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_sleep() {
        let cancel = CancellationToken::new();
        assert!(cancellable_sleep(&cancel, Duration::from_millis(10)).await);

        cancel.cancel();
        assert!(!cancellable_sleep(&cancel, Duration::from_secs(3600)).await);
    }
}
