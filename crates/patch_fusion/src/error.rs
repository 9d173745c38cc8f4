//! Error types for patch_fusion operations.
//!
//! Three tiers:
//! - incomplete stitches are not errors at all (see `active_set::completeness`)
//! - recoverable: the frame is skipped, the last published active set stays valid
//! - fatal: storage exhausted after garbage collection, a buffer larger than
//!   the largest slot, broken invariants, missing calibration
//!
//! Patches too large for any slot never reach a build; the updater leaves
//! them out of the active set and reports them in `FrameReport`.

use std::path::PathBuf;

use thiserror::Error;

use crate::gpu::{DeviceError, GpuHandle, SizeClass};
use crate::graph::PatchId;

/// Failures reported by the GPU geometry storage.
#[derive(Debug, Error)]
pub enum StorageError {
  /// Requested bucket is larger than any slot can hold.
  #[error("size class {requested:?} exceeds the largest slot ({max:?})")]
  SizeClassTooLarge { requested: SizeClass, max: SizeClass },

  /// No free slot even after a garbage-collection pass.
  #[error("geometry storage exhausted: all {capacity} slots are referenced")]
  Exhausted { capacity: usize },

  /// The handle was released (or reclaimed) before the upload landed.
  #[error("upload to {0:?} failed: handle is no longer live")]
  UploadFailure(GpuHandle),

  /// The handle does not refer to a live slot.
  #[error("stale handle {0:?}")]
  StaleHandle(GpuHandle),

  /// The device rejected the write.
  #[error("device error: {0}")]
  Device(#[from] DeviceError),
}

impl StorageError {
  /// Errors that would repeat on every later frame, so skipping one cannot help.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      StorageError::Exhausted { .. } | StorageError::SizeClassTooLarge { .. }
    )
  }
}

/// A broken structural invariant detected while assembling an active set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
  #[error("patch {0:?} has no uploaded GPU handle at publication")]
  PatchNotResident(PatchId),

  #[error("stitch references patch {outside:?} which is not a member of the set")]
  StitchOutsideSet { outside: PatchId },

  #[error("patch {0:?} is not in the patch graph")]
  UnknownPatch(PatchId),
}

/// Failures building an active set. Nothing is published when one is returned.
#[derive(Debug, Error)]
pub enum ActiveSetError {
  #[error("active set '{name}' could not be built")]
  BuildFailure {
    name: String,
    #[source]
    source: StorageError,
  },

  #[error("active set invariant violated: {0}")]
  InvariantViolation(#[from] InvariantViolation),
}

impl ActiveSetError {
  pub fn is_fatal(&self) -> bool {
    match self {
      ActiveSetError::BuildFailure { source, .. } => source.is_fatal(),
      ActiveSetError::InvariantViolation(_) => true,
    }
  }
}

/// Failures from `GeometryUpdater::extend` / `update`.
#[derive(Debug, Error)]
pub enum UpdateError {
  #[error(transparent)]
  ActiveSet(#[from] ActiveSetError),

  /// The mesher referred to a patch the graph does not hold.
  #[error("mesher referenced unknown patch {0:?}")]
  UnknownPatch(PatchId),

  /// The mesher produced malformed output (e.g. a neighbor index out of range).
  #[error("mesher output rejected: {0}")]
  Mesher(String),
}

impl From<InvariantViolation> for UpdateError {
  fn from(violation: InvariantViolation) -> Self {
    UpdateError::ActiveSet(violation.into())
  }
}

impl UpdateError {
  /// Fatal errors halt reconstruction; everything else skips one frame.
  pub fn is_fatal(&self) -> bool {
    match self {
      UpdateError::ActiveSet(err) => err.is_fatal(),
      UpdateError::UnknownPatch(_) | UpdateError::Mesher(_) => false,
    }
  }
}

/// Failures opening or reading a frame source.
#[derive(Debug, Error)]
pub enum FrameSourceError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to decode image {path}: {source}")]
  Image {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },

  #[error("no frame associations found in {0}")]
  MissingAssociations(PathBuf),

  #[error("calibration unavailable: {0}")]
  MissingCalibration(String),

  #[error("{path}:{line}: {message}")]
  Parse {
    path: PathBuf,
    line: usize,
    message: String,
  },
}

/// Failures loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config TOML: {0}")]
  Parse(#[from] toml::de::Error),

  #[error("invalid configuration: {0}")]
  Invalid(String),
}
