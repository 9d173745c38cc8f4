//! Frame pacing policy, enforced by whoever pulls frames.

use std::time::Duration;

use web_time::Instant;

use crate::config::PacingConfig;

/// Keeps frames at least `interval` apart.
#[derive(Debug)]
pub struct FramePacer {
  interval: Option<Duration>,
  last: Option<Instant>,
}

impl FramePacer {
  pub fn new(config: &PacingConfig) -> Self {
    Self::with_interval(config.target_interval())
  }

  /// `None` disables pacing.
  pub fn with_interval(interval: Option<Duration>) -> Self {
    Self { interval, last: None }
  }

  pub fn interval(&self) -> Option<Duration> {
    self.interval
  }

  /// Time still to wait before the next frame is due.
  pub fn remaining(&self) -> Duration {
    match (self.interval, self.last) {
      (Some(interval), Some(last)) => interval.saturating_sub(last.elapsed()),
      _ => Duration::ZERO,
    }
  }

  /// Block until the next frame is due, then start its interval.
  /// Returns how long it slept.
  pub fn wait(&mut self) -> Duration {
    let remaining = self.remaining();
    if !remaining.is_zero() {
      std::thread::sleep(remaining);
    }
    self.last = Some(Instant::now());
    remaining
  }
}
