//! Residency and timing statistics for a reconstruction session.
//!
//! Feature-gated and runtime-toggled so recording costs nothing when disabled.
//!
//! ```ignore
//! use patch_fusion::metrics::COLLECT_METRICS;
//!
//! // Compile with --features metrics, then toggle at runtime:
//! COLLECT_METRICS.store(false, Ordering::Relaxed);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;

/// Set to false to pause recording without recompiling.
pub static COLLECT_METRICS: AtomicBool = AtomicBool::new(true);

/// True when built with `metrics` and not paused.
#[inline]
pub fn is_enabled() -> bool {
  #[cfg(feature = "metrics")]
  {
    COLLECT_METRICS.load(Ordering::Relaxed)
  }
  #[cfg(not(feature = "metrics"))]
  {
    false
  }
}

/// Fixed-size history of recent values.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
  buffer: VecDeque<T>,
  capacity: usize,
}

impl<T> RollingWindow<T> {
  pub fn new(capacity: usize) -> Self {
    Self {
      buffer: VecDeque::with_capacity(capacity),
      capacity: capacity.max(1),
    }
  }

  /// Push a value, evicting the oldest at capacity.
  pub fn push(&mut self, value: T) {
    while self.buffer.len() >= self.capacity {
      self.buffer.pop_front();
    }
    self.buffer.push_back(value);
  }

  pub fn len(&self) -> usize {
    self.buffer.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buffer.is_empty()
  }

  pub fn clear(&mut self) {
    self.buffer.clear();
  }

  pub fn iter(&self) -> impl Iterator<Item = &T> {
    self.buffer.iter()
  }

  pub fn last(&self) -> Option<&T> {
    self.buffer.back()
  }
}

impl RollingWindow<u64> {
  pub fn average(&self) -> f64 {
    match self.buffer.len() {
      0 => 0.0,
      n => self.buffer.iter().sum::<u64>() as f64 / n as f64,
    }
  }

  pub fn min_max(&self) -> Option<(u64, u64)> {
    let min = self.buffer.iter().min()?;
    let max = self.buffer.iter().max()?;
    Some((*min, *max))
  }
}

impl Default for RollingWindow<u64> {
  fn default() -> Self {
    Self::new(128)
  }
}

/// Session statistics updated once per pass.
#[derive(Debug, Clone, Default)]
pub struct ResidencyMetrics {
  // Timing
  pub extend_timings: RollingWindow<u64>,
  pub update_timings: RollingWindow<u64>,
  pub build_timings: RollingWindow<u64>,

  // Gauges (last successful pass)
  pub resident_slots: usize,
  pub published_patches: usize,
  pub published_double_stitches: usize,
  pub published_triple_stitches: usize,
  pub incomplete_patches: usize,

  // Counters
  pub passes: u64,
  pub failed_passes: u64,
  pub abandoned_patches: u64,
  pub reclaimed_slots: u64,
}

impl ResidencyMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_extend(&mut self, elapsed_us: u64) {
    if is_enabled() {
      self.extend_timings.push(elapsed_us);
    }
  }

  pub fn record_update(&mut self, elapsed_us: u64) {
    if is_enabled() {
      self.update_timings.push(elapsed_us);
    }
  }

  /// Record a published active set.
  pub fn record_publication(
    &mut self,
    build_us: u64,
    patches: usize,
    doubles: usize,
    triples: usize,
    incomplete: usize,
  ) {
    if !is_enabled() {
      return;
    }
    self.build_timings.push(build_us);
    self.published_patches = patches;
    self.published_double_stitches = doubles;
    self.published_triple_stitches = triples;
    self.incomplete_patches = incomplete;
    self.passes += 1;
  }

  pub fn record_failure(&mut self) {
    if is_enabled() {
      self.passes += 1;
      self.failed_passes += 1;
    }
  }

  pub fn record_maintenance(&mut self, resident_slots: usize, reclaimed: usize, abandoned: usize) {
    if is_enabled() {
      self.resident_slots = resident_slots;
      self.reclaimed_slots += reclaimed as u64;
      self.abandoned_patches += abandoned as u64;
    }
  }

  pub fn avg_extend_us(&self) -> f64 {
    self.extend_timings.average()
  }

  pub fn avg_build_us(&self) -> f64 {
    self.build_timings.average()
  }
}
