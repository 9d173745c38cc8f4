//! Patch Graph - the CPU-resident mesh.
//!
//! An arena of patches addressed by [`PatchId`]. Neighbor relations are id
//! lists, stitch results are keyed by canonical [`DoubleKey`] / [`TripleKey`].
//! The graph is owned by the producer; active sets only ever see
//! [`PatchView`] snapshots.
//!
//! GPU residency is cached per patch and per stitch, but the cache holds no
//! reference count: a cached handle is reused only if it can still be
//! retained, i.e. while some active set keeps it alive.

mod patch;
mod stitch;
mod stitch_queue;

use std::collections::{BTreeSet, HashMap, VecDeque};

use glam::Vec3;
use smallvec::SmallVec;

pub use patch::{NeighborList, PatchAttributes, PatchId, PatchView};
pub use stitch::{encode_triangles, DoubleKey, StitchKey, StitchRecord, TripleKey, STITCH_CORNER_BYTES};
pub use stitch_queue::{StitchCompletion, StitchRequest, StitchStage};

use patch::{Patch, Tombstone};
use stitch::StitchBuffer;
use web_time::Instant;

use crate::error::InvariantViolation;
use crate::gpu::{GpuGeomStorage, GpuHandle};
use crate::types::{PatchGeometry, SharedGeometry};
use crate::updater::MeshStitcher;

/// Result of one stitch pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StitchPassStats {
  /// Boundaries handed to the stitcher.
  pub stitched: usize,
  /// Boundaries whose record was current and skipped.
  pub reused: usize,
  /// Stitched boundaries the stitcher reported incomplete.
  pub incomplete: usize,
  pub stitch_us: u64,
}

/// Arena of patches with neighbor and stitch relations.
#[derive(Default)]
pub struct PatchGraph {
  patches: HashMap<PatchId, Patch>,
  next_id: u64,
  doubles: HashMap<DoubleKey, StitchRecord>,
  triples: HashMap<TripleKey, StitchRecord>,
  dirty: BTreeSet<PatchId>,
  retired: HashMap<PatchId, Tombstone>,
  stage: StitchStage,
}

impl PatchGraph {
  pub fn new() -> Self {
    Self {
      next_id: 1,
      ..Default::default()
    }
  }

  pub fn len(&self) -> usize {
    self.patches.len()
  }

  pub fn is_empty(&self) -> bool {
    self.patches.is_empty()
  }

  pub fn contains(&self, id: PatchId) -> bool {
    self.patches.contains_key(&id)
  }

  /// Live patch ids in ascending order.
  pub fn ids(&self) -> Vec<PatchId> {
    let mut ids: Vec<PatchId> = self.patches.keys().copied().collect();
    ids.sort_unstable();
    ids
  }

  // ===========================================================================
  // Patch lifecycle
  // ===========================================================================

  /// Add a patch. It starts dirty, with no neighbors.
  pub fn insert(&mut self, geometry: PatchGeometry) -> PatchId {
    self.insert_shared(SharedGeometry::new(geometry))
  }

  pub fn insert_shared(&mut self, geometry: SharedGeometry) -> PatchId {
    let id = PatchId::new(self.next_id.max(1));
    self.next_id = id.raw() + 1;
    self.patches.insert(id, Patch::new(id, geometry));
    self.dirty.insert(id);
    tracing::trace!(%id, "patch inserted");
    id
  }

  /// Swap in refined geometry. Bumps the version, which invalidates the
  /// cached upload and every stitch touching the patch.
  pub fn replace_geometry(&mut self, id: PatchId, geometry: PatchGeometry) -> Result<u64, InvariantViolation> {
    let patch = self.patches.get_mut(&id).ok_or(InvariantViolation::UnknownPatch(id))?;
    patch.geometry = SharedGeometry::new(geometry);
    patch.version += 1;
    patch.attributes.reset_incomplete_run();
    let version = patch.version;
    let neighbors = patch.neighbors.clone();

    self.dirty.insert(id);
    self.dirty.extend(neighbors);
    Ok(version)
  }

  /// Record that `a` and `b` share a boundary. Returns false if they already
  /// did (or `a == b`).
  pub fn link(&mut self, a: PatchId, b: PatchId) -> Result<bool, InvariantViolation> {
    if a == b {
      return Ok(false);
    }
    for id in [a, b] {
      if !self.patches.contains_key(&id) {
        return Err(InvariantViolation::UnknownPatch(id));
      }
    }

    let added = self.add_neighbor(a, b);
    self.add_neighbor(b, a);
    if added {
      self.dirty.insert(a);
      self.dirty.insert(b);
    }
    Ok(added)
  }

  /// Remove the boundary between `a` and `b` and every stitch spanning both.
  pub fn unlink(&mut self, a: PatchId, b: PatchId) -> bool {
    let removed = self.remove_neighbor(a, b);
    self.remove_neighbor(b, a);
    if removed {
      self.doubles.remove(&DoubleKey::new(a, b));
      self.triples.retain(|key, _| !(key.contains(a) && key.contains(b)));
      self.dirty.insert(a);
      self.dirty.insert(b);
    }
    removed
  }

  fn add_neighbor(&mut self, id: PatchId, neighbor: PatchId) -> bool {
    match self.patches.get_mut(&id) {
      Some(patch) if !patch.neighbors.contains(&neighbor) => {
        patch.neighbors.push(neighbor);
        true
      }
      _ => false,
    }
  }

  fn remove_neighbor(&mut self, id: PatchId, neighbor: PatchId) -> bool {
    let Some(patch) = self.patches.get_mut(&id) else {
      return false;
    };
    let before = patch.neighbors.len();
    patch.neighbors.retain(|n| *n != neighbor);
    patch.neighbors.len() != before
  }

  /// Remove a patch (merged into another, or stale).
  ///
  /// Its links and stitches go away. With `merged_into`, the former neighbors
  /// are linked to the surviving patch instead. A tombstone remembers every
  /// upload of the patch until storage has reclaimed all of them, so sets
  /// built at any earlier version can still be resolved.
  pub fn retire(&mut self, id: PatchId, merged_into: Option<PatchId>) -> Result<(), InvariantViolation> {
    if let Some(target) = merged_into {
      if target == id || !self.patches.contains_key(&target) {
        return Err(InvariantViolation::UnknownPatch(target));
      }
    }
    let patch = self.patches.remove(&id).ok_or(InvariantViolation::UnknownPatch(id))?;

    for neighbor in &patch.neighbors {
      self.remove_neighbor(*neighbor, id);
      self.dirty.insert(*neighbor);
    }
    self.doubles.retain(|key, _| !key.contains(id));
    self.triples.retain(|key, _| !key.contains(id));
    self.dirty.remove(&id);

    if let Some(target) = merged_into {
      for neighbor in &patch.neighbors {
        if *neighbor != target {
          self.link(target, *neighbor)?;
        }
      }
      self.dirty.insert(target);
    }

    tracing::debug!(%id, merged_into = ?merged_into, "patch retired");
    self.retired.insert(
      id,
      Tombstone {
        merged_into,
        uploads: patch.uploads,
      },
    );
    Ok(())
  }

  pub fn is_retired(&self, id: PatchId) -> bool {
    self.retired.contains_key(&id)
  }

  /// Follow merges to the live patch that now covers `id`.
  pub fn resolve(&self, mut id: PatchId) -> Option<PatchId> {
    // Merge chains are acyclic: a target is always live when recorded
    for _ in 0..=self.retired.len() {
      if self.patches.contains_key(&id) {
        return Some(id);
      }
      id = self.retired.get(&id)?.merged_into?;
    }
    None
  }

  /// Drop tombstones whose uploads have all been reclaimed. Returns the count.
  pub fn purge_retired(&mut self, storage: &GpuGeomStorage) -> usize {
    for patch in self.patches.values_mut() {
      patch.uploads.retain(|handle| storage.is_live(*handle));
    }
    let before = self.retired.len();
    self.retired.retain(|_, tombstone| {
      tombstone.uploads.retain(|handle| storage.is_live(*handle));
      !tombstone.uploads.is_empty()
    });
    before - self.retired.len()
  }

  pub fn retired_count(&self) -> usize {
    self.retired.len()
  }

  // ===========================================================================
  // Queries
  // ===========================================================================

  pub fn neighbors(&self, id: PatchId) -> Option<&[PatchId]> {
    self.patches.get(&id).map(|patch| patch.neighbors.as_slice())
  }

  pub fn are_neighbors(&self, a: PatchId, b: PatchId) -> bool {
    self.neighbors(a).is_some_and(|neighbors| neighbors.contains(&b))
  }

  pub fn version(&self, id: PatchId) -> Option<u64> {
    self.patches.get(&id).map(|patch| patch.version)
  }

  pub fn view(&self, id: PatchId) -> Option<PatchView> {
    self.patches.get(&id).map(Patch::view)
  }

  pub fn attributes(&self, id: PatchId) -> Option<&PatchAttributes> {
    self.patches.get(&id).map(|patch| patch.attributes.as_ref())
  }

  /// Patches whose bounds come within `radius` of `center`, ascending.
  pub fn patches_within(&self, center: Vec3, radius: f32) -> Vec<PatchId> {
    let mut ids: Vec<PatchId> = self
      .patches
      .values()
      .filter(|patch| patch.geometry.bounds.is_valid() && patch.geometry.bounds.distance_to(center) <= radius)
      .map(|patch| patch.id)
      .collect();
    ids.sort_unstable();
    ids
  }

  /// Live seeds plus `rings` rings of neighbors around them.
  pub fn expand_neighborhood(&self, seeds: impl IntoIterator<Item = PatchId>, rings: u32) -> BTreeSet<PatchId> {
    let mut members = BTreeSet::new();
    let mut frontier = VecDeque::new();
    for seed in seeds {
      if self.contains(seed) && members.insert(seed) {
        frontier.push_back((seed, 0));
      }
    }

    while let Some((id, depth)) = frontier.pop_front() {
      if depth >= rings {
        continue;
      }
      for neighbor in self.neighbors(id).unwrap_or_default() {
        if members.insert(*neighbor) {
          frontier.push_back((*neighbor, depth + 1));
        }
      }
    }
    members
  }

  // ===========================================================================
  // Dirty tracking
  // ===========================================================================

  pub fn is_dirty(&self, id: PatchId) -> bool {
    self.dirty.contains(&id)
  }

  pub fn dirty_patches(&self) -> Vec<PatchId> {
    self.dirty.iter().copied().collect()
  }

  /// Boundaries with at least one dirty side.
  pub fn dirty_boundaries(&self) -> Vec<DoubleKey> {
    let keys: BTreeSet<DoubleKey> = self
      .dirty
      .iter()
      .flat_map(|id| {
        self
          .neighbors(*id)
          .unwrap_or_default()
          .iter()
          .map(move |neighbor| DoubleKey::new(*id, *neighbor))
      })
      .collect();
    keys.into_iter().collect()
  }

  pub fn clear_dirty<'a>(&mut self, ids: impl IntoIterator<Item = &'a PatchId>) {
    for id in ids {
      self.dirty.remove(id);
    }
  }

  // ===========================================================================
  // Stitches
  // ===========================================================================

  pub fn double_stitch(&self, key: &DoubleKey) -> Option<&StitchRecord> {
    self.doubles.get(key)
  }

  pub fn triple_stitch(&self, key: &TripleKey) -> Option<&StitchRecord> {
    self.triples.get(key)
  }

  pub fn stitch(&self, key: &StitchKey) -> Option<&StitchRecord> {
    match key {
      StitchKey::Double(key) => self.doubles.get(key),
      StitchKey::Triple(key) => self.triples.get(key),
    }
  }

  /// (double, triple) record counts.
  pub fn stitch_count(&self) -> (usize, usize) {
    (self.doubles.len(), self.triples.len())
  }

  /// Every boundary whose patches are all in `members`: neighbor pairs, and
  /// with `triples`, mutually adjacent triples.
  pub fn stitch_keys_among(&self, members: &BTreeSet<PatchId>, triples: bool) -> Vec<StitchKey> {
    let mut keys = Vec::new();
    for &a in members {
      let Some(neighbors) = self.neighbors(a) else {
        continue;
      };
      let mut inner: SmallVec<[PatchId; 8]> = neighbors
        .iter()
        .copied()
        .filter(|b| *b > a && members.contains(b))
        .collect();
      inner.sort_unstable();

      for (i, &b) in inner.iter().enumerate() {
        keys.push(StitchKey::Double(DoubleKey::new(a, b)));
        if !triples {
          continue;
        }
        for &c in &inner[i + 1..] {
          if self.are_neighbors(b, c) {
            keys.push(StitchKey::Triple(TripleKey::new(a, b, c)));
          }
        }
      }
    }
    keys
  }

  fn current_versions(&self, key: &StitchKey) -> Option<SmallVec<[u64; 3]>> {
    key.patches().iter().map(|id| self.version(*id)).collect()
  }

  fn needs_stitch(&self, key: &StitchKey, versions: &[u64]) -> bool {
    match self.stitch(key) {
      None => true,
      Some(record) if !record.is_current(versions) => true,
      Some(record) if record.complete => false,
      // Incomplete: retry unless a side has been given up on
      Some(_) => !key
        .patches()
        .iter()
        .any(|id| self.attributes(*id).is_some_and(PatchAttributes::is_abandoned)),
    }
  }

  /// Run the stitcher over every key whose record is missing, stale or
  /// still incomplete, and store the results.
  pub fn refresh_stitches(&mut self, keys: &[StitchKey], stitcher: &dyn MeshStitcher) -> StitchPassStats {
    let _span = tracing::info_span!("stitch_pass", keys = keys.len()).entered();
    let start = Instant::now();
    let mut stats = StitchPassStats::default();

    for key in keys {
      let Some(versions) = self.current_versions(key) else {
        continue;
      };
      if !self.needs_stitch(key, &versions) {
        stats.reused += 1;
        continue;
      }
      let views: Option<SmallVec<[PatchView; 3]>> = key.patches().iter().map(|id| self.view(*id)).collect();
      if let Some(views) = views {
        self.stage.enqueue(*key, views);
      }
    }

    stats.stitched = self.stage.tick(stitcher);
    for completion in self.stage.drain_completions() {
      if !completion.output.complete {
        stats.incomplete += 1;
      }
      let record = StitchRecord::new(completion.output, completion.patch_versions);
      match completion.key {
        StitchKey::Double(key) => {
          self.doubles.insert(key, record);
        }
        StitchKey::Triple(key) => {
          self.triples.insert(key, record);
        }
      }
    }

    stats.stitch_us = start.elapsed().as_micros() as u64;
    tracing::debug!(
      stitched = stats.stitched,
      reused = stats.reused,
      incomplete = stats.incomplete,
      "stitch pass done"
    );
    stats
  }

  // ===========================================================================
  // Residency cache
  // ===========================================================================

  /// Handle uploaded for the patch's current version, if one was recorded.
  pub(crate) fn cached_patch_handle(&self, id: PatchId) -> Option<GpuHandle> {
    self.patches.get(&id).and_then(Patch::cached_handle)
  }

  /// Remember a fresh upload, unless the patch changed since.
  pub(crate) fn commit_patch_handle(&mut self, id: PatchId, handle: GpuHandle, version: u64) {
    if let Some(patch) = self.patches.get_mut(&id) {
      if !patch.uploads.contains(&handle) {
        patch.uploads.push(handle);
      }
      if patch.version == version {
        patch.resident = Some(handle);
        patch.resident_version = version;
      }
    }
  }

  pub(crate) fn cached_stitch_buffer(&self, key: &StitchKey, slots: &[u32]) -> Option<GpuHandle> {
    self.stitch(key).and_then(|record| record.cached_buffer(slots))
  }

  pub(crate) fn commit_stitch_buffer(&mut self, key: &StitchKey, handle: GpuHandle, slots: SmallVec<[u32; 3]>) {
    let record = match key {
      StitchKey::Double(key) => self.doubles.get_mut(key),
      StitchKey::Triple(key) => self.triples.get_mut(key),
    };
    if let Some(record) = record {
      record.gpu = Some(StitchBuffer { handle, slots });
    }
  }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
