//! Requeue backoff for failed reconciliations
//!
//! The reconciler never retries internally. When a cycle fails the
//! controller's error policy asks this module how long to wait before the
//! next attempt: exponential growth per consecutive failure with jitter, reset
//! as soon as the instance reconciles successfully.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;

/// Configuration for the exponential requeue delay
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
    /// Apply 0.5x..1.5x random jitter
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Create a config with the given bounds and default multiplier
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Delay before retrying after `attempt` consecutive failures (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let secs = if self.jitter {
            // Add jitter: 0.5x to 1.5x of the delay, still capped
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            (capped * jitter).min(self.max_delay.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(secs)
    }
}

/// Failure streak of one object
#[derive(Debug, Clone, Copy)]
struct FailureState {
    attempts: u32,
    last_failure: Instant,
}

/// Consecutive failure counts per reconciled object
///
/// Keyed by `namespace/name`. Only the controller's error policy and the
/// success path touch it; the reconciliation logic itself stays stateless.
///
/// Deleted objects are never reconciled again, so their entries are never
/// reset. Entries untouched for twice `max_delay` are dropped on every write;
/// a still-failing object is retried within `max_delay`.
#[derive(Debug, Default)]
pub struct FailureTracker {
    config: BackoffConfig,
    failures: DashMap<String, FailureState>,
}

impl FailureTracker {
    /// Create a tracker using the given backoff configuration
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Record a failure and return the delay before the next attempt
    pub fn record_failure(&self, key: &str) -> Duration {
        let now = Instant::now();
        self.prune_stale(now);

        let attempt = {
            let mut entry = self.failures.entry(key.to_string()).or_insert(FailureState {
                attempts: 0,
                last_failure: now,
            });
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_failure = now;
            entry.attempts
        };
        self.config.delay_for_attempt(attempt)
    }

    /// Forget failures after a successful cycle
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
        self.prune_stale(Instant::now());
    }

    /// Drop entries whose last failure is older than twice `max_delay` at `now`
    pub fn prune_stale(&self, now: Instant) {
        let ttl = self.config.max_delay.saturating_mul(2);
        self.failures
            .retain(|_, state| now.saturating_duration_since(state.last_failure) <= ttl);
    }

    /// Current consecutive failure count for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|s| s.attempts).unwrap_or(0)
    }

    /// Number of objects with a failure streak
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}
