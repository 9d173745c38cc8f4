//! Contracts for the geometry collaborators driven by the updater.
//!
//! The mesher turns frames into patch geometry, the stitcher computes the
//! connective triangles across patch boundaries. Both are allowed to return
//! "nothing yet": an empty mesher output or an incomplete stitch is expected
//! at mesh frontiers and simply retried on a later pass.

use crate::dataset::Frame;
use crate::graph::{PatchId, PatchView};
use crate::types::{Calibration, PatchGeometry, Pose, StitchTriangle};

/// Reference from mesher output to a neighbor patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NeighborRef {
  /// A patch already in the graph.
  Existing(PatchId),
  /// Index into `MesherOutput::new_patches` of the same output.
  New(usize),
}

/// A patch the mesher wants created.
#[derive(Clone, Debug, Default)]
pub struct NewPatch {
  pub geometry: PatchGeometry,
  pub neighbors: Vec<NeighborRef>,
}

/// Grown or refined geometry for an existing patch.
#[derive(Clone, Debug)]
pub struct PatchUpdate {
  pub id: PatchId,
  pub geometry: PatchGeometry,
  /// Boundaries gained with this growth.
  pub new_neighbors: Vec<NeighborRef>,
}

/// `from` is absorbed by `into`; its neighbors move over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Merge {
  pub from: PatchId,
  pub into: PatchId,
}

#[derive(Clone, Debug, Default)]
pub struct MesherOutput {
  pub new_patches: Vec<NewPatch>,
  pub updated_patches: Vec<PatchUpdate>,
  pub merges: Vec<Merge>,
}

impl MesherOutput {
  pub fn is_empty(&self) -> bool {
    self.new_patches.is_empty() && self.updated_patches.is_empty() && self.merges.is_empty()
  }
}

/// Existing patches around the camera, handed to the mesher as context.
#[derive(Clone, Debug, Default)]
pub struct Neighborhood {
  pub patches: Vec<PatchView>,
}

impl Neighborhood {
  pub fn get(&self, id: PatchId) -> Option<&PatchView> {
    self.patches.iter().find(|view| view.id == id)
  }
}

/// Produces and refreshes patch geometry.
///
/// `mesh` must be idempotent: running it again on the same frame and the
/// neighborhood it produced must not fabricate duplicate geometry.
pub trait Mesher: Send {
  fn mesh(
    &mut self,
    frame: &Frame,
    pose: &Pose,
    calibration: &Calibration,
    neighborhood: &Neighborhood,
  ) -> MesherOutput;

  /// Re-derive geometry for an existing patch without a new frame.
  fn refine(&mut self, _patch: &PatchView) -> Option<PatchGeometry> {
    None
  }
}

/// Result of stitching one boundary.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StitchOutput {
  pub triangles: Vec<StitchTriangle>,
  /// False while the boundary is still waiting for neighbor data.
  pub complete: bool,
}

impl StitchOutput {
  pub fn complete(triangles: Vec<StitchTriangle>) -> Self {
    Self {
      triangles,
      complete: true,
    }
  }

  /// No data yet.
  pub fn pending() -> Self {
    Self::default()
  }
}

/// Computes connective triangles across patch boundaries.
///
/// Called from worker threads for independent boundaries concurrently.
pub trait MeshStitcher: Send + Sync {
  fn stitch_double(&self, a: &PatchView, b: &PatchView) -> StitchOutput;

  fn stitch_triple(&self, a: &PatchView, b: &PatchView, c: &PatchView) -> StitchOutput;
}
