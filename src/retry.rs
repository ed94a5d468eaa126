use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Source of delays between retry attempts.
pub trait Backoff: Send {
    /// Delay before the next attempt; advances the schedule.
    fn next_backoff(&mut self) -> Duration;

    /// Start over from the initial interval.
    fn reset(&mut self);

    /// Number of delays handed out since the last reset.
    fn retry_count(&self) -> u32;
}

/// Exponential backoff with jitter.
///
/// Each delay is drawn from `[current * (1 - f), current * (1 + f)]` where `f`
/// is the randomization factor, after which `current` is multiplied.
#[derive(Debug, Clone)]
pub struct ExpBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval: Duration,
    current_interval: Duration,
    retry_count: u32,
}

impl ExpBackoff {
    pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;
    pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.1;
    pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(initial_interval: Duration, multiplier: f64, randomization_factor: f64) -> Self {
        Self {
            initial_interval,
            multiplier,
            randomization_factor,
            max_interval: Self::DEFAULT_MAX_INTERVAL.max(initial_interval),
            current_interval: initial_interval,
            retry_count: 0,
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval.max(self.initial_interval);
        self
    }

    /// `current * multiplier`, clamped to `max_interval`. Overflowing or
    /// non-finite products clamp as well.
    fn grown_interval(&self) -> Duration {
        let next = self.current_interval.as_secs_f64() * self.multiplier;
        Duration::try_from_secs_f64(next)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_INITIAL_INTERVAL,
            Self::DEFAULT_MULTIPLIER,
            Self::DEFAULT_RANDOMIZATION_FACTOR,
        )
    }
}

impl Backoff for ExpBackoff {
    fn next_backoff(&mut self) -> Duration {
        let delay = jittered(
            self.current_interval,
            self.randomization_factor,
            rand::thread_rng().gen::<f64>(),
        );
        self.current_interval = self.grown_interval();
        self.retry_count += 1;
        delay
    }

    fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.retry_count = 0;
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// Pick a point in `[interval * (1 - factor), interval * (1 + factor)]`;
/// `random` is expected in `[0, 1)`.
fn jittered(interval: Duration, factor: f64, random: f64) -> Duration {
    let base = interval.as_secs_f64();
    let delta = factor * base;
    let min = base - delta;
    let max = base + delta;
    Duration::from_secs_f64((min + random * (max - min)).max(0.0))
}

/// Run `op` up to `attempts` times, sleeping between failures.
///
/// Returns the first success, or the last error once attempts are exhausted.
pub async fn retry<B, F, Fut, T, E>(attempts: u32, backoff: &mut B, mut op: F) -> Result<T, E>
where
    B: Backoff,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    backoff.reset();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_backoff();
                warn!(
                    attempt,
                    max_attempts = attempts,
                    retries = backoff.retry_count(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backoff that never waits, counting how often it was asked.
    #[derive(Default)]
    struct NoWait {
        count: u32,
    }

    impl Backoff for NoWait {
        fn next_backoff(&mut self) -> Duration {
            self.count += 1;
            Duration::from_nanos(1)
        }

        fn reset(&mut self) {
            self.count = 0;
        }

        fn retry_count(&self) -> u32 {
            self.count
        }
    }

    fn in_factor_range(d: Duration, compare: Duration, factor: f64) -> bool {
        let f = compare.as_secs_f64();
        let d = d.as_secs_f64();
        // Tolerate float rounding at the edges.
        f - f * factor - 1e-9 <= d && d <= f + f * factor + 1e-9
    }

    #[test]
    fn test_exp_backoff_grows_geometrically() {
        let mut b = ExpBackoff::default();
        for i in 1..=3u32 {
            let current = b.current_interval;
            let delay = b.next_backoff();
            assert_eq!(b.retry_count(), i);
            assert!(in_factor_range(delay, current, b.randomization_factor));
            let expected = b.initial_interval.mul_f64(b.multiplier.powi(i as i32));
            assert!(b.current_interval.abs_diff(expected) < Duration::from_micros(1));
        }

        b.reset();
        assert_eq!(b.current_interval, b.initial_interval);
        assert_eq!(b.retry_count(), 0);
    }

    #[test]
    fn test_exp_backoff_stops_at_max_interval() {
        let mut b = ExpBackoff::new(Duration::from_millis(100), 10.0, 0.0)
            .with_max_interval(Duration::from_secs(1));
        for _ in 0..50 {
            assert!(b.next_backoff() <= Duration::from_secs(1));
        }
        assert_eq!(b.current_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_exp_backoff_non_finite_multiplier_clamps() {
        let mut b = ExpBackoff::new(Duration::from_millis(100), f64::INFINITY, 0.0);
        assert_eq!(b.next_backoff(), Duration::from_millis(100));
        assert_eq!(b.current_interval, ExpBackoff::DEFAULT_MAX_INTERVAL);
        assert_eq!(b.next_backoff(), ExpBackoff::DEFAULT_MAX_INTERVAL);
    }

    #[test]
    fn test_jittered_bounds() {
        let interval = Duration::from_millis(100);
        let close = |a: Duration, b: Duration| a.abs_diff(b) < Duration::from_micros(1);
        assert!(close(jittered(interval, 0.1, 0.0), Duration::from_millis(90)));
        assert!(close(jittered(interval, 0.1, 0.5), interval));
        assert!(jittered(interval, 0.1, 0.999_999) <= Duration::from_millis(110));
        assert!(close(jittered(interval, 0.0, 0.7), interval));
    }

    #[tokio::test]
    async fn test_retry_success_after_failure() {
        let mut calls = 0;
        let mut backoff = NoWait::default();
        let result: Result<u32, String> = retry(3, &mut backoff, |attempt| {
            calls += 1;
            async move {
                if attempt == 1 {
                    Err("retry".to_string())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls, 2);
        assert_eq!(backoff.retry_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let mut calls = 0;
        let mut backoff = NoWait::default();
        let result: Result<(), String> = retry(4, &mut backoff, |_| {
            calls += 1;
            async { Err("retry".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 4);
        assert_eq!(backoff.retry_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_single_attempt_never_sleeps() {
        let mut backoff = NoWait::default();
        let result: Result<(), String> =
            retry(1, &mut backoff, |_| async { Err("nope".to_string()) }).await;
        assert!(result.is_err());
        assert_eq!(backoff.retry_count(), 0);
    }
}
