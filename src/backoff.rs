//! Retry pacing for the reconciliation watchers.
//!
//! A [`BackoffPolicy`] is a stateful, per-watcher object handing out the delay before the
//! next poll, or `None` once it gives up. [`BackoffConfig`] is the serializable recipe the
//! keeper uses to mint a fresh policy for every watcher it arms.

use crate::error::BuildError;

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

const DEFAULT_INITIAL_INTERVAL_MS: u64 = 500;
const DEFAULT_MULTIPLIER: f64 = 1.5;
const DEFAULT_RANDOMIZATION: f64 = 0.5;
const DEFAULT_MAX_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_ELAPSED_MS: u64 = 15 * 60_000;

/// Swappable retry strategy.
pub trait BackoffPolicy: Send + Sync {
  /// Delay before the next attempt, or `None` when the policy is exhausted.
  fn next_delay(&mut self) -> Option<Duration>;

  /// Restarts the policy as if no attempt had been made.
  fn reset(&mut self);
}

/// Exponential backoff with randomized intervals and an overall elapsed-time cap.
///
/// Each call returns `current * (1 ± randomization)` and grows `current` by `multiplier`
/// up to `max_interval`. Once `max_elapsed` has passed since the first attempt the policy
/// returns `None`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
  initial_interval: Duration,
  multiplier: f64,
  randomization: f64,
  max_interval: Duration,
  max_elapsed: Option<Duration>,
  current_interval: Duration,
  started: Instant,
}

impl Default for ExponentialBackoff {
  fn default() -> Self {
    Self::new(
      Duration::from_millis(DEFAULT_INITIAL_INTERVAL_MS),
      DEFAULT_MULTIPLIER,
      DEFAULT_RANDOMIZATION,
      Duration::from_millis(DEFAULT_MAX_INTERVAL_MS),
      Some(Duration::from_millis(DEFAULT_MAX_ELAPSED_MS)),
    )
  }
}

impl ExponentialBackoff {
  pub fn new(
    initial_interval: Duration,
    multiplier: f64,
    randomization: f64,
    max_interval: Duration,
    max_elapsed: Option<Duration>,
  ) -> Self {
    Self {
      initial_interval,
      multiplier: multiplier.max(1.0),
      randomization: if randomization.is_finite() {
        randomization.clamp(0.0, 1.0)
      } else {
        0.0
      },
      max_interval,
      max_elapsed,
      current_interval: initial_interval,
      started: Instant::now(),
    }
  }

  fn randomized(&self, interval: Duration) -> Duration {
    if self.randomization == 0.0 {
      return interval;
    }
    let delta = self.randomization * interval.as_secs_f64();
    let low = interval.as_secs_f64() - delta;
    let high = interval.as_secs_f64() + delta;
    Duration::try_from_secs_f64(rand::thread_rng().gen_range(low..=high)).unwrap_or(interval)
  }
}

impl BackoffPolicy for ExponentialBackoff {
  fn next_delay(&mut self) -> Option<Duration> {
    if let Some(cap) = self.max_elapsed {
      if self.started.elapsed() >= cap {
        return None;
      }
    }
    let delay = self.randomized(self.current_interval);
    // Capped in f64 first: the product can exceed what a Duration holds.
    let grown = (self.current_interval.as_secs_f64() * self.multiplier)
      .min(self.max_interval.as_secs_f64());
    self.current_interval = Duration::try_from_secs_f64(grown).unwrap_or(self.max_interval);
    Some(delay)
  }

  fn reset(&mut self) {
    self.current_interval = self.initial_interval;
    self.started = Instant::now();
  }
}

/// Constant delay with the same elapsed-time cap.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
  delay: Duration,
  max_elapsed: Option<Duration>,
  started: Instant,
}

impl FixedBackoff {
  pub fn new(delay: Duration, max_elapsed: Option<Duration>) -> Self {
    Self {
      delay,
      max_elapsed,
      started: Instant::now(),
    }
  }
}

impl BackoffPolicy for FixedBackoff {
  fn next_delay(&mut self) -> Option<Duration> {
    match self.max_elapsed {
      Some(cap) if self.started.elapsed() >= cap => None,
      _ => Some(self.delay),
    }
  }

  fn reset(&mut self) {
    self.started = Instant::now();
  }
}

/// Serializable recipe for watcher backoff policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BackoffConfig {
  #[serde(rename_all = "camelCase")]
  Exponential {
    initial_interval_ms: u64,
    multiplier: f64,
    randomization: f64,
    max_interval_ms: u64,
    /// `None` retries forever.
    max_elapsed_ms: Option<u64>,
  },
  #[serde(rename_all = "camelCase")]
  Fixed {
    delay_ms: u64,
    max_elapsed_ms: Option<u64>,
  },
}

impl Default for BackoffConfig {
  fn default() -> Self {
    BackoffConfig::Exponential {
      initial_interval_ms: DEFAULT_INITIAL_INTERVAL_MS,
      multiplier: DEFAULT_MULTIPLIER,
      randomization: DEFAULT_RANDOMIZATION,
      max_interval_ms: DEFAULT_MAX_INTERVAL_MS,
      max_elapsed_ms: Some(DEFAULT_MAX_ELAPSED_MS),
    }
  }
}

impl BackoffConfig {
  /// Rejects exponential settings that would make the policy misbehave: the multiplier must
  /// be finite and at least 1, the randomization factor finite and within `[0, 1]`.
  pub fn validate(&self) -> Result<(), BuildError> {
    if let BackoffConfig::Exponential {
      multiplier,
      randomization,
      ..
    } = *self
    {
      if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(BuildError::InvalidBackoff(format!(
          "multiplier must be finite and >= 1, got {multiplier}"
        )));
      }
      if !randomization.is_finite() || !(0.0..=1.0).contains(&randomization) {
        return Err(BuildError::InvalidBackoff(format!(
          "randomization must be within [0, 1], got {randomization}"
        )));
      }
    }
    Ok(())
  }

  /// Mints a fresh policy; its elapsed-time clock starts now.
  pub fn build(&self) -> Box<dyn BackoffPolicy> {
    match *self {
      BackoffConfig::Exponential {
        initial_interval_ms,
        multiplier,
        randomization,
        max_interval_ms,
        max_elapsed_ms,
      } => Box::new(ExponentialBackoff::new(
        Duration::from_millis(initial_interval_ms),
        multiplier,
        randomization,
        Duration::from_millis(max_interval_ms),
        max_elapsed_ms.map(Duration::from_millis),
      )),
      BackoffConfig::Fixed {
        delay_ms,
        max_elapsed_ms,
      } => Box::new(FixedBackoff::new(
        Duration::from_millis(delay_ms),
        max_elapsed_ms.map(Duration::from_millis),
      )),
    }
  }
}
