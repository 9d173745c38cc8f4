//! Core data types shared by the graph, storage and active sets.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::graph::PatchId;

/// Camera pose (camera-to-world, column-major).
pub type Pose = Mat4;

/// Output vertex uploaded to the GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
  /// World-space position.
  pub position: [f32; 3],

  /// Unit normal.
  pub normal: [f32; 3],
}

impl Vertex {
  pub fn new(position: [f32; 3], normal: [f32; 3]) -> Self {
    Self { position, normal }
  }
}

impl Default for Vertex {
  fn default() -> Self {
    Self {
      position: [0.0; 3],
      normal: [0.0, 1.0, 0.0],
    }
  }
}

/// World-space bounds of a patch.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMaxAABB {
  pub min: [f32; 3],
  pub max: [f32; 3],
}

impl MinMaxAABB {
  /// Inverted box that any point grows into.
  pub fn empty() -> Self {
    Self {
      min: [f32::INFINITY; 3],
      max: [f32::NEG_INFINITY; 3],
    }
  }

    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
    Self { min, max }
  }

  /// Grow to contain `point`.
  #[inline]
  pub fn encapsulate(&mut self, point: [f32; 3]) {
    let point = Vec3::from_array(point);
    self.min = Vec3::from_array(self.min).min(point).to_array();
    self.max = Vec3::from_array(self.max).max(point).to_array();
  }

  /// False until at least one point was added.
  pub fn is_valid(&self) -> bool {
    (0..3).all(|i| self.min[i] <= self.max[i])
  }

  pub fn center(&self) -> Vec3 {
    (Vec3::from_array(self.min) + Vec3::from_array(self.max)) * 0.5
  }

  /// Distance from a point to the box (0 inside).
  pub fn distance_to(&self, point: Vec3) -> f32 {
    let clamped = point.clamp(Vec3::from_array(self.min), Vec3::from_array(self.max));
    (point - clamped).length()
  }

  /// True if the two boxes overlap after growing this one by `margin`.
  pub fn overlaps(&self, other: &MinMaxAABB, margin: f32) -> bool {
    (0..3).all(|i| self.min[i] - margin <= other.max[i] && other.min[i] <= self.max[i] + margin)
  }
}

impl Default for MinMaxAABB {
  fn default() -> Self {
    Self::empty()
  }
}

/// Geometry of one patch. Immutable once built; a refined patch gets a new
/// `PatchGeometry` instead of an edited one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchGeometry {
  pub vertices: Vec<Vertex>,

  /// Triangle indices (3 per triangle) into `vertices`.
  pub indices: Vec<u32>,

  pub bounds: MinMaxAABB,
}

impl PatchGeometry {
  /// Build geometry and compute its bounds.
  pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
    let mut bounds = MinMaxAABB::empty();
    for vertex in &vertices {
      bounds.encapsulate(vertex.position);
    }
    Self {
      vertices,
      indices,
      bounds,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.vertices.is_empty()
  }

  pub fn triangle_count(&self) -> usize {
    self.indices.len() / 3
  }

  /// Size of the vertex + index payload in bytes.
  pub fn byte_len(&self) -> usize {
    std::mem::size_of_val(self.vertices.as_slice()) + std::mem::size_of_val(self.indices.as_slice())
  }

  /// Vertex bytes followed by index bytes, the layout written to a slot.
  pub fn to_bytes(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(self.byte_len());
    bytes.extend_from_slice(bytemuck::cast_slice(&self.vertices));
    bytes.extend_from_slice(bytemuck::cast_slice(&self.indices));
    bytes
  }
}

/// Shared, immutable patch geometry.
pub type SharedGeometry = Arc<PatchGeometry>;

/// A vertex owned by some patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexRef {
  pub patch: PatchId,
  pub index: u32,
}

impl VertexRef {
  pub fn new(patch: PatchId, index: u32) -> Self {
    Self { patch, index }
  }
}

/// One connective triangle whose corners live in (possibly) different patches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StitchTriangle(pub [VertexRef; 3]);

impl StitchTriangle {
  pub fn new(a: VertexRef, b: VertexRef, c: VertexRef) -> Self {
    Self([a, b, c])
  }

  pub fn patches(&self) -> impl Iterator<Item = PatchId> + '_ {
    self.0.iter().map(|corner| corner.patch)
  }
}

/// Pinhole intrinsics (focal lengths and principal point, in pixels).
#[derive(Clone, Copy, Debug, PartialEq, serde::Deserialize)]
pub struct Intrinsics {
  pub fx: f32,
  pub fy: f32,
  pub cx: f32,
  pub cy: f32,
}

impl Intrinsics {
  pub const fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
    Self { fx, fy, cx, cy }
  }

  /// Back-project pixel `(u, v)` at `depth` metres into camera space.
  #[inline]
  pub fn unproject(&self, u: f32, v: f32, depth: f32) -> Vec3 {
    Vec3::new(
      (u - self.cx) * depth / self.fx,
      (v - self.cy) * depth / self.fy,
      depth,
    )
  }

  /// Project a camera-space point to pixel coordinates; `None` behind the camera.
  #[inline]
  pub fn project(&self, point: Vec3) -> Option<[f32; 2]> {
    if point.z <= 0.0 {
      return None;
    }
    Some([
      point.x * self.fx / point.z + self.cx,
      point.y * self.fy / point.z + self.cy,
    ])
  }

  /// True if every parameter is finite and the focal lengths are positive.
  pub fn is_valid(&self) -> bool {
    self.fx > 0.0
      && self.fy > 0.0
      && self.fx.is_finite()
      && self.fy.is_finite()
      && self.cx.is_finite()
      && self.cy.is_finite()
  }
}

/// Sensor calibration supplied by the frame source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
  pub depth: Intrinsics,
  pub color: Intrinsics,

  /// Transform from the depth camera frame into the color camera frame.
  pub depth_to_color: Mat4,
}

impl Calibration {
  pub fn is_valid(&self) -> bool {
    self.depth.is_valid() && self.color.is_valid() && self.depth_to_color.is_finite()
  }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
