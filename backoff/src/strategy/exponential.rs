use std::time::Duration;

use rand::Rng;

/// Exponentially growing pauses: `initial * factor^(n - 1)` for the n-th retry, capped at
/// `ceiling`. A non-zero `jitter` scales every pause by a random factor in
/// `[1 - jitter, 1 + jitter]` (the cap still applies afterwards).
///
/// ```
/// use std::time::Duration;
/// use backoff::strategy::exponential::Exponential;
///
/// let pauses: Vec<_> = Exponential::new(Duration::from_millis(10), Duration::from_millis(35), 2.0, 0.0)
///     .max_retries(4)
///     .collect();
/// assert_eq!(pauses, vec![10, 20, 35, 35].into_iter().map(Duration::from_millis).collect::<Vec<_>>());
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    initial: Duration,
    ceiling: Duration,
    factor: f64,
    jitter: f64,
    max_retries: Option<u16>,
    retries: u16,
}

impl Exponential {
    pub fn new(initial: Duration, ceiling: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            initial,
            ceiling,
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            max_retries: None,
            retries: 0,
        }
    }

    /// Stop yielding after `retries` pauses. Unbounded when never set.
    pub fn max_retries(mut self, retries: u16) -> Self {
        self.max_retries = Some(retries);
        self
    }

    fn pause_for(&self, retry: u16) -> Duration {
        let exponent = i32::from(retry.saturating_sub(1));
        let mut secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            secs *= rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        }
        if !secs.is_finite() || secs >= self.ceiling.as_secs_f64() {
            return self.ceiling;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.max_retries.is_some_and(|max| self.retries >= max) {
            return None;
        }
        self.retries = self.retries.saturating_add(1);
        Some(self.pause_for(self.retries))
    }
}
