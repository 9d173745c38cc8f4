//! Reconstruction configuration.
//!
//! Every section has defaults, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! [storage]
//! slot_count = 2048
//!
//! [completeness]
//! max_incomplete_passes = 30
//!
//! [pacing]
//! replay_speed = 1.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::gpu::SizeClass;
use crate::types::Intrinsics;

/// Root configuration for a reconstruction session.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconstructionConfig {
  pub storage: StorageConfig,
  pub stitching: StitchConfig,
  pub completeness: IncompletePolicy,
  pub neighborhood: NeighborhoodConfig,
  pub pacing: PacingConfig,
  pub dataset: DatasetConfig,
  pub mesher: GridMesherConfig,
}

impl ReconstructionConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Load and validate configuration from a TOML file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&content)
  }

  /// Parse and validate configuration from TOML text.
  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    let config: ReconstructionConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  /// Reject values the session cannot run with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.storage.slot_count == 0 {
      return Err(ConfigError::Invalid("storage.slot_count must be at least 1".into()));
    }
    if !(SizeClass::MIN.log2()..=40).contains(&self.storage.max_size_class_log2) {
      return Err(ConfigError::Invalid(format!(
        "storage.max_size_class_log2 must be in {}..=40, got {}",
        SizeClass::MIN.log2(),
        self.storage.max_size_class_log2
      )));
    }
    if self.neighborhood.context_rings == 0 {
      return Err(ConfigError::Invalid(
        "neighborhood.context_rings must be at least 1 so boundary stitches keep both patches".into(),
      ));
    }
    if !(self.neighborhood.radius > 0.0) {
      return Err(ConfigError::Invalid("neighborhood.radius must be positive".into()));
    }
    if !(self.stitching.max_gap >= 0.0) {
      return Err(ConfigError::Invalid("stitching.max_gap must not be negative".into()));
    }
    if !(self.pacing.replay_speed >= 0.0) {
      return Err(ConfigError::Invalid("pacing.replay_speed must not be negative".into()));
    }
    if !(self.dataset.depth_scale > 0.0) {
      return Err(ConfigError::Invalid("dataset.depth_scale must be positive".into()));
    }
    if !(self.mesher.cell_size > 0.0) {
      return Err(ConfigError::Invalid("mesher.cell_size must be positive".into()));
    }
    if self.mesher.pixel_stride == 0 {
      return Err(ConfigError::Invalid("mesher.pixel_stride must be at least 1".into()));
    }
    if let Some(intrinsics) = &self.dataset.intrinsics {
      if !intrinsics.is_valid() {
        return Err(ConfigError::Invalid("dataset.intrinsics are not a valid pinhole model".into()));
      }
    }
    Ok(())
  }

  pub fn with_storage(mut self, storage: StorageConfig) -> Self {
    self.storage = storage;
    self
  }

  pub fn with_slot_count(mut self, slot_count: usize) -> Self {
    self.storage.slot_count = slot_count;
    self
  }

  pub fn with_completeness(mut self, policy: IncompletePolicy) -> Self {
    self.completeness = policy;
    self
  }

  pub fn with_stitching(mut self, stitching: StitchConfig) -> Self {
    self.stitching = stitching;
    self
  }

  pub fn with_context_rings(mut self, rings: u32) -> Self {
    self.neighborhood.context_rings = rings;
    self
  }
}

/// GPU geometry storage capacity.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
  /// Number of slots (N). Every patch and every stitch buffer takes one.
  pub slot_count: usize,
  /// log2 of the largest slot in bytes.
  pub max_size_class_log2: u8,
}

impl StorageConfig {
  pub fn max_size_class(&self) -> SizeClass {
    SizeClass::from_log2(self.max_size_class_log2)
  }
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      slot_count: 4096,
      max_size_class_log2: 22,
    }
  }
}

/// Boundary stitching options.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StitchConfig {
  /// Compute corner stitches between three mutually adjacent patches.
  pub triple_stitches: bool,
  /// Upload all triple stitches of an active set as one buffer.
  pub coalesce_triple_stitches: bool,
  /// Largest boundary gap (metres) the reference stitcher bridges.
  pub max_gap: f32,
}

impl Default for StitchConfig {
  fn default() -> Self {
    Self {
      triple_stitches: true,
      coalesce_triple_stitches: true,
      max_gap: 0.05,
    }
  }
}

/// How long a boundary may stay incomplete before it is abandoned.
///
/// Incompleteness is expected at mesh frontiers; an abandoned patch keeps its
/// geometry but is no longer re-queued for stitching every pass.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IncompletePolicy {
  /// Consecutive incomplete passes before abandoning (`None` = retry forever).
  pub max_incomplete_passes: Option<u32>,
}

impl IncompletePolicy {
  /// Retry forever.
  pub const UNBOUNDED: Self = Self {
    max_incomplete_passes: None,
  };

  pub const DEFAULT: Self = Self::UNBOUNDED;

  pub const fn bounded(passes: u32) -> Self {
    Self {
      max_incomplete_passes: Some(passes),
    }
  }

  /// Check if a patch incomplete for `passes` consecutive passes is given up on.
  #[inline]
  pub fn is_abandoned(&self, passes: u32) -> bool {
    self.max_incomplete_passes.is_some_and(|max| passes >= max)
  }
}

impl Default for IncompletePolicy {
  fn default() -> Self {
    Self::DEFAULT
  }
}

/// Which patches surround an update.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct NeighborhoodConfig {
  /// Radius (metres) around the camera handed to the mesher as context.
  pub radius: f32,
  /// Neighbor rings added around affected patches in a new active set.
  pub context_rings: u32,
}

impl Default for NeighborhoodConfig {
  fn default() -> Self {
    Self {
      radius: 5.0,
      context_rings: 1,
    }
  }
}

/// Frame pacing at the session boundary.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PacingConfig {
  /// Playback speed relative to a 30 Hz sensor (0 = as fast as possible).
  pub replay_speed: f32,
  /// Explicit interval, overrides `replay_speed` when set.
  pub target_frame_interval_ms: Option<f64>,
}

/// Nominal sensor frame interval (30 Hz).
pub const SENSOR_FRAME_INTERVAL_US: f64 = 33_333.0;

impl PacingConfig {
  /// Minimum time between two frames, if pacing is enabled.
  pub fn target_interval(&self) -> Option<Duration> {
    if let Some(ms) = self.target_frame_interval_ms {
      return (ms > 0.0).then(|| Duration::from_secs_f64(ms / 1000.0));
    }
    (self.replay_speed > 0.0)
      .then(|| Duration::from_micros((SENSOR_FRAME_INTERVAL_US / self.replay_speed as f64) as u64))
  }
}

impl Default for PacingConfig {
  fn default() -> Self {
    Self {
      replay_speed: 0.0,
      target_frame_interval_ms: None,
    }
  }
}

/// TUM-style dataset loading options.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatasetConfig {
  /// Use ground-truth poses from `groundtruth.txt` when present.
  pub use_ground_truth: bool,
  /// Frames skipped at the start of the sequence.
  pub skip_frames: usize,
  /// Frames skipped between two reads after the first one.
  pub skip_count: usize,
  /// Raw depth units per metre (TUM: 5000).
  pub depth_scale: f32,
  /// Scale applied to ground-truth translations.
  pub trajectory_scale: f32,
  /// Invert the rotation part of ground-truth poses.
  pub invert_trajectory: bool,
  /// Override the intrinsics preset (applied to both cameras).
  pub intrinsics: Option<Intrinsics>,
}

impl Default for DatasetConfig {
  fn default() -> Self {
    Self {
      use_ground_truth: true,
      skip_frames: 0,
      skip_count: 0,
      depth_scale: 5000.0,
      trajectory_scale: 1.0,
      invert_trajectory: false,
      intrinsics: None,
    }
  }
}

/// Reference grid mesher parameters.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridMesherConfig {
  /// Edge length (metres) of the world cell one patch covers.
  pub cell_size: f32,
  /// Pixel step between sampled depth values.
  pub pixel_stride: u32,
  /// Depth beyond which samples are ignored (metres).
  pub max_depth: f32,
  /// Relative depth jump that breaks a quad (occlusion edge).
  pub max_depth_jump: f32,
}

impl Default for GridMesherConfig {
  fn default() -> Self {
    Self {
      cell_size: 0.5,
      pixel_stride: 4,
      max_depth: 4.0,
      max_depth_jump: 0.05,
    }
  }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
