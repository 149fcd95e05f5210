//! Requeue delay calculation
//!
//! Delays grow with the total age of a notification rather than with the
//! number of attempts, so a message that keeps failing backs off even when it
//! moves between reconcilers. With the default multiplier of 2 the delay
//! equals the time already spent, which doubles the spacing on every attempt
//! until the ceiling is reached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tideline_types::Timing;

/// Backoff configuration for requeues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Smallest delay ever returned (milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Ceiling for computed delays (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl BackoffPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay for a notification's timing value as of now
    pub fn compute_delay(&self, timing: Option<Timing>) -> Duration {
        self.compute_delay_at(timing, Utc::now())
    }

    /// Delay for a notification's timing value as of `now`
    pub fn compute_delay_at(&self, timing: Option<Timing>, now: DateTime<Utc>) -> Duration {
        match timing {
            Some(Timing::CreatedAt(created_at)) => self.delay_since(created_at, now),
            Some(Timing::LastDelay(last)) => self.delay_after(last),
            None => self.initial_delay(),
        }
    }

    /// Delay derived from the age of the original notification
    ///
    /// Creation times in the future (clock skew between producer and
    /// reconciler) count as zero age.
    pub fn delay_since(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let elapsed = now
            .signed_duration_since(created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        self.clamp_secs(elapsed.as_secs_f64() * (self.multiplier - 1.0).max(0.0))
    }

    /// Delay derived from the previously applied delay (legacy timing)
    pub fn delay_after(&self, last: Duration) -> Duration {
        self.clamp_secs(last.as_secs_f64() * self.multiplier.max(0.0))
    }

    fn clamp_secs(&self, secs: f64) -> Duration {
        let floor = self.initial_delay();
        let ceiling = self.max_delay();

        if !secs.is_finite() || secs >= ceiling.as_secs_f64() {
            return ceiling;
        }

        Duration::from_secs_f64(secs.max(0.0)).clamp(floor, ceiling)
    }
}
