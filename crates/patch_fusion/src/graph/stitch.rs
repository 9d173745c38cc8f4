//! Stitch keys and records.
//!
//! Stitches are derived data: a record remembers the patch versions it was
//! computed from and is recomputed from scratch once any of them changes.

use std::sync::Arc;

use smallvec::SmallVec;

use super::PatchId;
use crate::gpu::GpuHandle;
use crate::types::StitchTriangle;
use crate::updater::StitchOutput;

/// Canonical (sorted) key of a boundary between two patches.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct DoubleKey([PatchId; 2]);

impl DoubleKey {
  pub fn new(a: PatchId, b: PatchId) -> Self {
    if a <= b {
      Self([a, b])
    } else {
      Self([b, a])
    }
  }

  pub fn patches(&self) -> &[PatchId; 2] {
    &self.0
  }

  pub fn contains(&self, id: PatchId) -> bool {
    self.0.contains(&id)
  }

  /// The patch on the other side of the boundary from `id`.
  pub fn other(&self, id: PatchId) -> Option<PatchId> {
    match self.0 {
      [a, b] if a == id => Some(b),
      [a, b] if b == id => Some(a),
      _ => None,
    }
  }
}

/// Canonical (sorted) key of a corner shared by three patches.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TripleKey([PatchId; 3]);

impl TripleKey {
  pub fn new(a: PatchId, b: PatchId, c: PatchId) -> Self {
    let mut ids = [a, b, c];
    ids.sort_unstable();
    Self(ids)
  }

  pub fn patches(&self) -> &[PatchId; 3] {
    &self.0
  }

  pub fn contains(&self, id: PatchId) -> bool {
    self.0.contains(&id)
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum StitchKey {
  Double(DoubleKey),
  Triple(TripleKey),
}

impl StitchKey {
  pub fn patches(&self) -> &[PatchId] {
    match self {
      StitchKey::Double(key) => key.patches(),
      StitchKey::Triple(key) => key.patches(),
    }
  }

  pub fn contains(&self, id: PatchId) -> bool {
    self.patches().contains(&id)
  }
}

impl From<DoubleKey> for StitchKey {
  fn from(key: DoubleKey) -> Self {
    StitchKey::Double(key)
  }
}

impl From<TripleKey> for StitchKey {
  fn from(key: TripleKey) -> Self {
    StitchKey::Triple(key)
  }
}

/// Uploaded stitch buffer, valid only for the patch slots it was encoded with.
#[derive(Clone, Debug)]
pub(crate) struct StitchBuffer {
  pub handle: GpuHandle,
  pub slots: SmallVec<[u32; 3]>,
}

/// Last stitcher result for one boundary.
#[derive(Clone, Debug)]
pub struct StitchRecord {
  pub triangles: Arc<[StitchTriangle]>,
  pub complete: bool,
  /// Versions of the key's patches (in key order) the result was computed from.
  pub patch_versions: SmallVec<[u64; 3]>,
  pub(crate) gpu: Option<StitchBuffer>,
}

impl StitchRecord {
  pub fn new(output: StitchOutput, patch_versions: SmallVec<[u64; 3]>) -> Self {
    Self {
      triangles: output.triangles.into(),
      complete: output.complete,
      patch_versions,
      gpu: None,
    }
  }

  pub fn is_current(&self, versions: &[u64]) -> bool {
    self.patch_versions.as_slice() == versions
  }

  /// Cached buffer if it was encoded against exactly these patch slots.
  pub(crate) fn cached_buffer(&self, slots: &[u32]) -> Option<GpuHandle> {
    self
      .gpu
      .as_ref()
      .filter(|buffer| buffer.slots.as_slice() == slots)
      .map(|buffer| buffer.handle)
  }
}

/// Bytes per encoded stitch corner: `(patch slot, vertex index)` as two u32.
pub const STITCH_CORNER_BYTES: usize = 8;

/// Encode triangles as `(slot, vertex index)` corner pairs.
///
/// Returns the first patch without a slot as the error.
pub fn encode_triangles(
  triangles: &[StitchTriangle],
  slot_of: impl Fn(PatchId) -> Option<u32>,
) -> Result<Vec<u8>, PatchId> {
  let mut corners: Vec<[u32; 2]> = Vec::with_capacity(triangles.len() * 3);
  for triangle in triangles {
    for corner in &triangle.0 {
      let slot = slot_of(corner.patch).ok_or(corner.patch)?;
      corners.push([slot, corner.index]);
    }
  }
  Ok(bytemuck::cast_slice(&corners).to_vec())
}
