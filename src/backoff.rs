//! Reconnect delay policy.
use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

/// Configuration for [`Backoff`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_INITIAL_DELAY`].
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_MAX_DELAY`].
    pub max_delay: Duration,
    /// A connection that stayed up at least this long resets the delay to `initial_delay`.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_RESET_THRESHOLD`].
    pub reset_threshold: Duration,
    /// Fraction (`0.0..=1.0`) of each delay that is randomly subtracted. This helps to avoid
    /// many clients reconnecting at the same instant after an outage. Values outside of the range
    /// are clamped and NaN disables jitter.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_JITTER_RATIO`].
    pub jitter_ratio: f64,
}

impl BackoffConfig {
    /// Default value for [`BackoffConfig::initial_delay`].
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
    /// Default value for [`BackoffConfig::max_delay`].
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
    /// Default value for [`BackoffConfig::reset_threshold`].
    pub const DEFAULT_RESET_THRESHOLD: Duration = Duration::from_secs(60);
    /// Default value for [`BackoffConfig::jitter_ratio`].
    pub const DEFAULT_JITTER_RATIO: f64 = 0.5;

    /// Create a new `BackoffConfig` using default configuration.
    pub fn new() -> BackoffConfig {
        BackoffConfig::default()
    }

    /// Update initial delay with `delay`.
    pub fn with_initial_delay(mut self, delay: Duration) -> BackoffConfig {
        self.initial_delay = delay;
        self
    }

    /// Update maximum delay with `delay`.
    pub fn with_max_delay(mut self, delay: Duration) -> BackoffConfig {
        self.max_delay = delay;
        self
    }

    /// Update reset threshold with `threshold`.
    pub fn with_reset_threshold(mut self, threshold: Duration) -> BackoffConfig {
        self.reset_threshold = threshold;
        self
    }

    /// Update jitter ratio with `ratio`. Values outside of `0.0..=1.0` are clamped and NaN is
    /// treated as `0.0`.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> BackoffConfig {
        self.jitter_ratio = sanitize_ratio(ratio);
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            initial_delay: BackoffConfig::DEFAULT_INITIAL_DELAY,
            max_delay: BackoffConfig::DEFAULT_MAX_DELAY,
            reset_threshold: BackoffConfig::DEFAULT_RESET_THRESHOLD,
            jitter_ratio: BackoffConfig::DEFAULT_JITTER_RATIO,
        }
    }
}

/// Exponential backoff with a ceiling, subtractive jitter, and a reset after sustained
/// connectivity.
///
/// The un-jittered delay for attempt `n` (starting at 0) is `initial_delay * 2^n`, capped at
/// `max_delay`. With `jitter_ratio = r`, the actual delay lies in `[(1 - r) * d, d]`, so for
/// `r <= 0.5` consecutive delays never decrease until the ceiling is reached.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    connected_since: Option<Instant>,
}

impl Backoff {
    #[allow(missing_docs)]
    pub fn new(config: BackoffConfig) -> Backoff {
        Backoff {
            config,
            attempt: 0,
            connected_since: None,
        }
    }

    /// Number of failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record that the connection was established at `now`.
    pub fn mark_connected(&mut self, now: Instant) {
        self.connected_since = Some(now);
    }

    /// Forget all failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.connected_since = None;
    }

    /// Record a failure at `now` and return how long to wait before the next attempt.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        if let Some(since) = self.connected_since.take() {
            if now.saturating_duration_since(since) >= self.config.reset_threshold {
                log::debug!(target: "flagsync", "connection was stable, resetting backoff");
                self.attempt = 0;
            }
        }

        let delay = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        jitter(delay, delay.mul_f64(sanitize_ratio(self.config.jitter_ratio)))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        // 2^31 seconds is far beyond any sensible ceiling.
        let factor = 1u32 << attempt.min(31);
        self.config
            .initial_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }
}

fn sanitize_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}

/// Apply randomized `jitter` to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
