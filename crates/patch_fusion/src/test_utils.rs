//! Shared fixtures for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use glam::Mat4;
use image::RgbImage;

use crate::active_set::{ActivePatch, ActiveStitch, CoalescedTriples, DrawSink};
use crate::config::StorageConfig;
use crate::dataset::{DepthImage, Frame};
use crate::gpu::{DeferredCollector, GpuGeomStorage, HostDevice};
use crate::graph::{DoubleKey, NeighborList, PatchAttributes, PatchId, PatchView, StitchKey, TripleKey};
use crate::types::{Calibration, Intrinsics, PatchGeometry, Pose, StitchTriangle, Vertex, VertexRef};
use crate::updater::{MeshStitcher, Mesher, MesherOutput, Neighborhood, StitchOutput};

/// Unit quad (two triangles) in the XY plane at `origin`.
pub fn quad(origin: [f32; 3], size: f32) -> PatchGeometry {
  let [x, y, z] = origin;
  let normal = [0.0, 0.0, 1.0];
  let vertices = vec![
    Vertex::new([x, y, z], normal),
    Vertex::new([x + size, y, z], normal),
    Vertex::new([x, y + size, z], normal),
    Vertex::new([x + size, y + size, z], normal),
  ];
  PatchGeometry::new(vertices, vec![0, 1, 2, 1, 3, 2])
}

/// Standalone view, not backed by a graph.
pub fn view_of(raw: u64, geometry: PatchGeometry) -> PatchView {
  PatchView {
    id: PatchId::new(raw),
    version: 1,
    geometry: Arc::new(geometry),
    attributes: Arc::new(PatchAttributes::default()),
    neighbors: NeighborList::new(),
  }
}

pub fn test_storage(slot_count: usize) -> (Arc<GpuGeomStorage>, Arc<HostDevice>) {
  test_storage_with(&StorageConfig {
    slot_count,
    ..StorageConfig::default()
  })
}

pub fn test_storage_with(config: &StorageConfig) -> (Arc<GpuGeomStorage>, Arc<HostDevice>) {
  let device = Arc::new(HostDevice::new());
  let storage = GpuGeomStorage::new(config, device.clone(), Arc::new(DeferredCollector::new()));
  (Arc::new(storage), device)
}

/// Row of `count` vertices along x, fanned into triangles.
pub fn strip(origin: [f32; 3], count: u32) -> PatchGeometry {
  let [x, y, z] = origin;
  let normal = [0.0, 0.0, 1.0];
  let vertices = (0..count)
    .map(|i| Vertex::new([x + i as f32 * 0.01, y + (i % 2) as f32 * 0.01, z], normal))
    .collect();
  let indices = (0..count.saturating_sub(2)).flat_map(|i| [i, i + 1, i + 2]).collect();
  PatchGeometry::new(vertices, indices)
}

pub fn test_calibration() -> Calibration {
  let intrinsics = Intrinsics::new(50.0, 50.0, 16.0, 12.0);
  Calibration {
    depth: intrinsics,
    color: intrinsics,
    depth_to_color: Mat4::IDENTITY,
  }
}

/// 32x24 frame of constant depth, with an identity ground-truth pose.
pub fn test_frame(index: u64, metres: f32) -> Frame {
  Frame {
    index,
    timestamp: index as f64 / 30.0,
    depth: DepthImage::filled(32, 24, metres, 5000.0),
    color: RgbImage::new(32, 24),
    ground_truth: Some(Pose::IDENTITY),
  }
}

// =============================================================================
// ScriptedStitcher
// =============================================================================

#[derive(Default)]
struct StitcherScript {
  incomplete: HashMap<StitchKey, bool>,
  calls: usize,
}

/// Stitcher with per-boundary completeness chosen by the test.
///
/// Complete boundaries get one triangle touching every patch involved;
/// incomplete ones get none. Clones share their script.
#[derive(Clone, Default)]
pub struct ScriptedStitcher {
  script: Arc<Mutex<StitcherScript>>,
}

impl ScriptedStitcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make `key` incomplete (or complete again).
  pub fn set_incomplete(&self, key: impl Into<StitchKey>, incomplete: bool) {
    let mut script = self.script.lock().unwrap();
    script.incomplete.insert(key.into(), incomplete);
  }

  /// Number of boundaries stitched so far.
  pub fn calls(&self) -> usize {
    self.script.lock().unwrap().calls
  }

  fn output(&self, key: StitchKey, corners: [VertexRef; 3]) -> StitchOutput {
    let mut script = self.script.lock().unwrap();
    script.calls += 1;
    if script.incomplete.get(&key).copied().unwrap_or(false) {
      return StitchOutput::pending();
    }
    StitchOutput::complete(vec![StitchTriangle(corners)])
  }
}

impl MeshStitcher for ScriptedStitcher {
  fn stitch_double(&self, a: &PatchView, b: &PatchView) -> StitchOutput {
    let corners = [VertexRef::new(a.id, 0), VertexRef::new(b.id, 0), VertexRef::new(a.id, 1)];
    self.output(DoubleKey::new(a.id, b.id).into(), corners)
  }

  fn stitch_triple(&self, a: &PatchView, b: &PatchView, c: &PatchView) -> StitchOutput {
    let corners = [VertexRef::new(a.id, 0), VertexRef::new(b.id, 0), VertexRef::new(c.id, 0)];
    self.output(TripleKey::new(a.id, b.id, c.id).into(), corners)
  }
}

// =============================================================================
// ScriptedMesher
// =============================================================================

#[derive(Default)]
struct MesherScript {
  outputs: VecDeque<MesherOutput>,
  refinements: HashMap<PatchId, PatchGeometry>,
  neighborhoods: Vec<Vec<PatchId>>,
}

/// Mesher replaying queued outputs, one per frame. Clones share their script.
#[derive(Clone, Default)]
pub struct ScriptedMesher {
  script: Arc<Mutex<MesherScript>>,
}

impl ScriptedMesher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, output: MesherOutput) {
    self.script.lock().unwrap().outputs.push_back(output);
  }

  /// Geometry handed out once by the next `refine` of `id`.
  pub fn refine_with(&self, id: PatchId, geometry: PatchGeometry) {
    self.script.lock().unwrap().refinements.insert(id, geometry);
  }

  /// Patch ids of every neighborhood seen by `mesh`, in call order.
  pub fn neighborhoods(&self) -> Vec<Vec<PatchId>> {
    self.script.lock().unwrap().neighborhoods.clone()
  }
}

impl Mesher for ScriptedMesher {
  fn mesh(&mut self, _frame: &Frame, _pose: &Pose, _calibration: &Calibration, neighborhood: &Neighborhood) -> MesherOutput {
    let mut script = self.script.lock().unwrap();
    script
      .neighborhoods
      .push(neighborhood.patches.iter().map(|view| view.id).collect());
    script.outputs.pop_front().unwrap_or_default()
  }

  fn refine(&mut self, patch: &PatchView) -> Option<PatchGeometry> {
    self.script.lock().unwrap().refinements.remove(&patch.id)
  }
}

// =============================================================================
// RecordingSink
// =============================================================================

/// Draw sink remembering what it was asked to draw.
#[derive(Default)]
pub struct RecordingSink {
  pub patches: Vec<PatchId>,
  pub doubles: Vec<StitchKey>,
  pub triples: Vec<StitchKey>,
  pub coalesced: Vec<usize>,
}

impl DrawSink for RecordingSink {
  fn draw_patch(&mut self, patch: &ActivePatch) {
    self.patches.push(patch.view.id);
  }

  fn draw_double_stitch(&mut self, stitch: &ActiveStitch) {
    self.doubles.push(stitch.key);
  }

  fn draw_triple_stitch(&mut self, stitch: &ActiveStitch) {
    self.triples.push(stitch.key);
  }

  fn draw_coalesced_triples(&mut self, triples: &CoalescedTriples) {
    self.coalesced.push(triples.triangle_count);
  }
}
