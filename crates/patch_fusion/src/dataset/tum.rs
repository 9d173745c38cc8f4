//! TUM RGB-D dataset folders.
//!
//! Layout:
//! - `associations.txt`: `t_depth depth/path.png t_rgb rgb/path.png` per line
//! - `groundtruth.txt` (optional): `t x y z qx qy qz qw`, `#` lines are comments
//! - depth PNGs are 16-bit, `depth_scale` raw units per metre (TUM: 5000)

use std::fs;
use std::path::{Path, PathBuf};

use glam::{Mat4, Quat, Vec3};

use super::{DepthImage, Frame, FrameSource};
use crate::config::DatasetConfig;
use crate::error::FrameSourceError;
use crate::types::{Calibration, Intrinsics, Pose};

/// Poses further than this from a frame's timestamp are not matched (seconds).
const MAX_POSE_TIME_DELTA: f64 = 1000.0;

/// Calibration presets chosen by folder name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrinsicsPreset {
  /// Freiburg default for both cameras.
  Tum,
  /// Self-recorded sequences 1, 3, 5-9: ElasticFusion defaults.
  TumalikeRegistered,
  /// Other self-recorded sequences: separate depth and color intrinsics.
  TumalikeRaw,
}

impl IntrinsicsPreset {
  pub fn calibration(&self) -> Calibration {
    let (color, depth) = match self {
      IntrinsicsPreset::Tum => {
        let tum = Intrinsics::new(535.4, 539.2, 320.1, 247.6);
        (tum, tum)
      }
      IntrinsicsPreset::TumalikeRegistered => {
        let registered = Intrinsics::new(528.0, 528.0, 320.0, 240.0);
        (registered, registered)
      }
      IntrinsicsPreset::TumalikeRaw => (
        Intrinsics::new(537.562, 537.278, 313.730, 243.601),
        Intrinsics::new(563.937, 587.847, 328.987, 225.661),
      ),
    };
    Calibration {
      depth,
      color,
      depth_to_color: Mat4::IDENTITY,
    }
  }
}

/// Pick the preset for a dataset folder.
pub fn intrinsics_preset(folder: &Path) -> IntrinsicsPreset {
  let name = folder.to_string_lossy();
  if !name.contains("tumalike") {
    return IntrinsicsPreset::Tum;
  }
  if ['1', '3', '5', '6', '7', '8', '9'].iter().any(|digit| name.contains(*digit)) {
    IntrinsicsPreset::TumalikeRegistered
  } else {
    IntrinsicsPreset::TumalikeRaw
  }
}

#[derive(Clone, Debug)]
struct Association {
  timestamp: f64,
  depth: PathBuf,
  color: PathBuf,
}

#[derive(Clone, Copy, Debug)]
struct TrajectoryPoint {
  timestamp: f64,
  pose: Pose,
}

/// Sequential reader over a TUM-style folder.
pub struct TumDataset {
  folder: PathBuf,
  associations: Vec<Association>,
  trajectory: Vec<TrajectoryPoint>,
  calibration: Calibration,
  depth_scale: f32,
  skip_count: usize,
  cursor: usize,
  emitted: u64,
}

impl TumDataset {
  /// Open a folder. Fails if associations or calibration are unavailable.
  pub fn open(folder: &Path, config: &DatasetConfig) -> Result<Self, FrameSourceError> {
    let associations_path = folder.join("associations.txt");
    let associations = match fs::read_to_string(&associations_path) {
      Ok(content) => parse_associations(folder, &associations_path, &content)?,
      Err(_) => return Err(FrameSourceError::MissingAssociations(associations_path)),
    };
    if associations.is_empty() {
      return Err(FrameSourceError::MissingAssociations(associations_path));
    }

    let trajectory_path = folder.join("groundtruth.txt");
    let trajectory = if config.use_ground_truth && trajectory_path.is_file() {
      let content = fs::read_to_string(&trajectory_path).map_err(|source| FrameSourceError::Io {
        path: trajectory_path.clone(),
        source,
      })?;
      parse_trajectory(&trajectory_path, &content, config.trajectory_scale, config.invert_trajectory)?
    } else {
      Vec::new()
    };

    let mut calibration = intrinsics_preset(folder).calibration();
    if let Some(intrinsics) = config.intrinsics {
      calibration.depth = intrinsics;
      calibration.color = intrinsics;
    }
    if !calibration.is_valid() {
      return Err(FrameSourceError::MissingCalibration(format!(
        "invalid intrinsics for {}",
        folder.display()
      )));
    }

    tracing::info!(
      folder = %folder.display(),
      frames = associations.len(),
      poses = trajectory.len(),
      "opened TUM dataset"
    );

    Ok(Self {
      folder: folder.to_path_buf(),
      associations,
      trajectory,
      calibration,
      depth_scale: config.depth_scale,
      skip_count: config.skip_count,
      cursor: config.skip_frames,
      emitted: 0,
    })
  }

  pub fn folder(&self) -> &Path {
    &self.folder
  }

  pub fn frame_count(&self) -> usize {
    self.associations.len()
  }

  pub fn has_ground_truth(&self) -> bool {
    !self.trajectory.is_empty()
  }

  /// Ground-truth pose closest in time to `timestamp`.
  pub fn pose_at(&self, timestamp: f64) -> Option<Pose> {
    self
      .trajectory
      .iter()
      .map(|point| ((timestamp - point.timestamp).abs(), point.pose))
      .filter(|(delta, _)| *delta < MAX_POSE_TIME_DELTA)
      .min_by(|a, b| a.0.total_cmp(&b.0))
      .map(|(_, pose)| pose)
  }

  fn load(&self, association: &Association, index: u64) -> Result<Frame, FrameSourceError> {
    let depth = image::open(&association.depth)
      .map_err(|source| FrameSourceError::Image {
        path: association.depth.clone(),
        source,
      })?
      .into_luma16();
    let (width, height) = depth.dimensions();
    let depth = DepthImage::new(width, height, depth.into_raw(), self.depth_scale).ok_or_else(|| {
      FrameSourceError::Parse {
        path: association.depth.clone(),
        line: 0,
        message: "depth image has an unexpected size".into(),
      }
    })?;

    let color = image::open(&association.color)
      .map_err(|source| FrameSourceError::Image {
        path: association.color.clone(),
        source,
      })?
      .into_rgb8();

    Ok(Frame {
      index,
      timestamp: association.timestamp,
      depth,
      color,
      ground_truth: self.pose_at(association.timestamp),
    })
  }
}

impl FrameSource for TumDataset {
  fn calibration(&self) -> &Calibration {
    &self.calibration
  }

  fn next_frame(&mut self) -> Option<Result<Frame, FrameSourceError>> {
    if self.emitted > 0 {
      self.cursor += self.skip_count;
    }
    let association = self.associations.get(self.cursor)?.clone();
    let frame = self.load(&association, self.cursor as u64);
    self.cursor += 1;
    self.emitted += 1;
    Some(frame)
  }

  fn remaining(&self) -> Option<usize> {
    let left = self.associations.len().saturating_sub(self.cursor);
    if self.emitted == 0 {
      Some(left.div_ceil(self.skip_count + 1))
    } else {
      Some(left.saturating_sub(self.skip_count).div_ceil(self.skip_count + 1))
    }
  }
}

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> FrameSourceError {
  FrameSourceError::Parse {
    path: path.to_path_buf(),
    line,
    message: message.into(),
  }
}

fn parse_associations(folder: &Path, path: &Path, content: &str) -> Result<Vec<Association>, FrameSourceError> {
  let mut associations = Vec::new();
  for (number, line) in content.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [timestamp, depth, _, color, ..] = fields.as_slice() else {
      return Err(parse_error(path, number + 1, "expected 4 fields"));
    };
    let timestamp: f64 = timestamp
      .parse()
      .map_err(|_| parse_error(path, number + 1, format!("bad timestamp '{timestamp}'")))?;
    associations.push(Association {
      timestamp,
      depth: folder.join(depth),
      color: folder.join(color),
    });
  }
  Ok(associations)
}

fn parse_trajectory(path: &Path, content: &str, scale: f32, invert: bool) -> Result<Vec<TrajectoryPoint>, FrameSourceError> {
  let mut trajectory = Vec::new();
  for (number, line) in content.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let values: Result<Vec<f64>, _> = line.split_whitespace().map(str::parse::<f64>).collect();
    let values = values.map_err(|_| parse_error(path, number + 1, "non-numeric pose field"))?;
    let [timestamp, x, y, z, qx, qy, qz, qw] = values.as_slice() else {
      return Err(parse_error(path, number + 1, "expected 8 fields"));
    };

    let translation = Vec3::new(*x as f32, *y as f32, *z as f32) * scale;
    let mut rotation = Quat::from_xyzw(*qx as f32, *qy as f32, *qz as f32, *qw as f32).normalize();
    if invert {
      rotation = rotation.inverse();
    }
    trajectory.push(TrajectoryPoint {
      timestamp: *timestamp,
      pose: Mat4::from_rotation_translation(rotation, translation),
    });
  }
  Ok(trajectory)
}
