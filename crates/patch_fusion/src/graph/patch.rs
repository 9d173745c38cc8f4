//! Patch arena entries and the views handed out to active sets.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::config::IncompletePolicy;
use crate::gpu::{GpuHandle, HEADER_FLAG_ABANDONED, HEADER_FLAG_INCOMPLETE};
use crate::types::SharedGeometry;

/// Stable patch identifier. Monotonic within a graph, never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PatchId(u64);

impl PatchId {
  pub const fn new(raw: u64) -> Self {
    Self(raw)
  }

  pub const fn raw(self) -> u64 {
    self.0
  }
}

impl fmt::Display for PatchId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "P{}", self.0)
  }
}

/// Neighbor list, inline for the common case.
pub type NeighborList = SmallVec<[PatchId; 8]>;

/// Per-patch flags shared between the graph and every active set holding the
/// patch. These are the lightweight header fields; changing them never
/// requires a geometry re-upload.
#[derive(Debug, Default)]
pub struct PatchAttributes {
  incomplete: AtomicBool,
  incomplete_passes: AtomicU32,
  abandoned: AtomicBool,
  last_seen_frame: AtomicU64,
}

impl PatchAttributes {
  pub fn is_incomplete(&self) -> bool {
    self.incomplete.load(Ordering::Relaxed)
  }

  pub fn incomplete_passes(&self) -> u32 {
    self.incomplete_passes.load(Ordering::Relaxed)
  }

  pub fn is_abandoned(&self) -> bool {
    self.abandoned.load(Ordering::Relaxed)
  }

  pub fn last_seen_frame(&self) -> u64 {
    self.last_seen_frame.load(Ordering::Relaxed)
  }

  pub fn touch(&self, frame: u64) {
    self.last_seen_frame.fetch_max(frame, Ordering::Relaxed);
  }

  /// Fold one completeness result into the flags.
  ///
  /// Returns true if this pass made the patch abandoned.
  pub fn record_pass(&self, complete: bool, policy: &IncompletePolicy) -> bool {
    if complete {
      self.incomplete.store(false, Ordering::Relaxed);
      self.incomplete_passes.store(0, Ordering::Relaxed);
      self.abandoned.store(false, Ordering::Relaxed);
      return false;
    }

    self.incomplete.store(true, Ordering::Relaxed);
    let passes = self.incomplete_passes.fetch_add(1, Ordering::Relaxed).saturating_add(1);
    if policy.is_abandoned(passes) {
      return !self.abandoned.swap(true, Ordering::Relaxed);
    }
    false
  }

  /// New geometry gets a fresh chance at completing its boundaries.
  pub(crate) fn reset_incomplete_run(&self) {
    self.incomplete_passes.store(0, Ordering::Relaxed);
    self.abandoned.store(false, Ordering::Relaxed);
  }

  pub fn header_flags(&self) -> u32 {
    let mut flags = 0;
    if self.is_incomplete() {
      flags |= HEADER_FLAG_INCOMPLETE;
    }
    if self.is_abandoned() {
      flags |= HEADER_FLAG_ABANDONED;
    }
    flags
  }
}

/// Arena entry. Owned by the graph.
#[derive(Debug)]
pub(crate) struct Patch {
  pub id: PatchId,
  pub version: u64,
  pub geometry: SharedGeometry,
  pub attributes: Arc<PatchAttributes>,
  pub neighbors: NeighborList,
  /// Last handle uploaded for `version`. Non-owning: it is only usable while
  /// some active set still holds a reference to it.
  pub resident: Option<GpuHandle>,
  pub resident_version: u64,
  /// Every upload committed for any version that may still be held by a
  /// live set. Pruned once storage no longer holds them.
  pub uploads: SmallVec<[GpuHandle; 2]>,
}

impl Patch {
  pub fn new(id: PatchId, geometry: SharedGeometry) -> Self {
    Self {
      id,
      version: 1,
      geometry,
      attributes: Arc::new(PatchAttributes::default()),
      neighbors: NeighborList::new(),
      resident: None,
      resident_version: 0,
      uploads: SmallVec::new(),
    }
  }

  pub fn view(&self) -> PatchView {
    PatchView {
      id: self.id,
      version: self.version,
      geometry: self.geometry.clone(),
      attributes: self.attributes.clone(),
      neighbors: self.neighbors.clone(),
    }
  }

  pub fn cached_handle(&self) -> Option<GpuHandle> {
    self.resident.filter(|_| self.resident_version == self.version)
  }
}

/// Immutable snapshot of a patch at one version.
///
/// Geometry is shared, so holding a view never copies vertex data and later
/// graph mutations never change what a view shows (attributes excepted).
#[derive(Clone, Debug)]
pub struct PatchView {
  pub id: PatchId,
  pub version: u64,
  pub geometry: SharedGeometry,
  pub attributes: Arc<PatchAttributes>,
  pub neighbors: NeighborList,
}

impl PatchView {
  pub fn is_neighbor(&self, other: PatchId) -> bool {
    self.neighbors.contains(&other)
  }
}

/// A patch removed from the arena whose uploads may still be referenced.
#[derive(Clone, Debug)]
pub(crate) struct Tombstone {
  pub merged_into: Option<PatchId>,
  pub uploads: SmallVec<[GpuHandle; 2]>,
}
