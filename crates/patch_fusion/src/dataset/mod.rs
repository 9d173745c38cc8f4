//! Frame sources.
//!
//! A [`FrameSource`] yields RGB-D frames with optional ground-truth poses
//! and exposes the sensor calibration up front, so a source that cannot
//! provide calibration fails before reconstruction starts.

mod pacing;
mod tum;

pub use pacing::FramePacer;
pub use tum::{intrinsics_preset, IntrinsicsPreset, TumDataset};

use image::RgbImage;

use crate::error::FrameSourceError;
use crate::types::{Calibration, Pose};

/// 16-bit depth map with its unit scale.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthImage {
  width: u32,
  height: u32,
  raw: Vec<u16>,
  /// Raw units per metre.
  scale: f32,
}

impl DepthImage {
  /// `raw` is row-major and must hold `width * height` samples.
  pub fn new(width: u32, height: u32, raw: Vec<u16>, scale: f32) -> Option<Self> {
    (raw.len() == width as usize * height as usize && scale > 0.0).then_some(Self {
      width,
      height,
      raw,
      scale,
    })
  }

  /// Constant-depth image, mostly for tests and synthetic sources.
  pub fn filled(width: u32, height: u32, metres: f32, scale: f32) -> Self {
    let value = (metres * scale).round().clamp(0.0, u16::MAX as f32) as u16;
    Self {
      width,
      height,
      raw: vec![value; width as usize * height as usize],
      scale,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn raw(&self) -> &[u16] {
    &self.raw
  }

  /// Depth in metres at `(u, v)`; 0 means no measurement.
  #[inline]
  pub fn metres(&self, u: u32, v: u32) -> f32 {
    if u >= self.width || v >= self.height {
      return 0.0;
    }
    self.raw[(v * self.width + u) as usize] as f32 / self.scale
  }
}

/// One RGB-D frame.
#[derive(Clone, Debug)]
pub struct Frame {
  /// Position in the source sequence (after skipping).
  pub index: u64,
  pub timestamp: f64,
  pub depth: DepthImage,
  pub color: RgbImage,
  /// Ground-truth camera pose, if the source has one.
  pub ground_truth: Option<Pose>,
}

/// Supplier of frames for `GeometryUpdater::extend`.
pub trait FrameSource: Send {
  fn calibration(&self) -> &Calibration;

  /// Next frame, `None` at the end of the sequence.
  fn next_frame(&mut self) -> Option<Result<Frame, FrameSourceError>>;

  /// Number of frames still to come, if known.
  fn remaining(&self) -> Option<usize> {
    None
  }
}
