//! Active Set - immutable snapshot of GPU-resident patches and stitches.
//!
//! # Construction
//!
//! ```text
//! resolve views ─► refresh stitches ─► retain / upload patches ─► retain / upload stitches
//!                                                                        │
//!                          ┌──────────── any failure ◄──────────────────┤
//!                          ▼                                            ▼
//!                release everything held                      check invariants
//!                (counts back to pre-build)                             │
//!                                                                       ▼
//!                                                     commit uploads to graph cache, publish
//! ```
//!
//! A set holds one storage reference per handle it contains and releases all
//! of them on drop. Nothing a set exposes changes after construction, except
//! the per-patch attribute flags.
//!
//! # Headers
//!
//! Header records are not snapshotted. Live sets that hold the same patch
//! handle read the same slot header, so `reupload_headers` on the newest set
//! also changes the flags an older set's consumer sees. Geometry, versions and
//! stitches stay as they were when the older set was built.

mod completeness;
mod draw;
mod publication;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use smallvec::SmallVec;

pub use completeness::{CompletenessReport, PatchCompleteness};
pub use draw::{DrawSink, NullSink};
pub use publication::Publication;

use crate::config::StitchConfig;
use crate::error::{ActiveSetError, InvariantViolation, StorageError};
use crate::gpu::{GpuGeomStorage, GpuHandle, HandleKind, PatchHeader, SizeClass};
use crate::graph::{encode_triangles, DoubleKey, PatchGraph, PatchId, PatchView, StitchKey, TripleKey};
use crate::types::StitchTriangle;
use crate::updater::MeshStitcher;

// =============================================================================
// ActiveSetId - publication order
// =============================================================================

/// Monotonically increasing active set identifier.
///
/// Issued by the storage the set is built over, so sets built later over the
/// same storage always compare greater. That gives publication its total
/// order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ActiveSetId(u64);

impl ActiveSetId {
  fn next(storage: &GpuGeomStorage) -> Self {
    Self(storage.next_set_sequence())
  }

  pub fn raw(&self) -> u64 {
    self.0
  }
}

// =============================================================================
// Contents
// =============================================================================

/// Which patches to snapshot.
#[derive(Clone, Debug)]
pub struct BuildRequest {
  pub name: String,
  pub patches: BTreeSet<PatchId>,
  pub stitching: StitchConfig,
}

impl BuildRequest {
  pub fn new(name: impl Into<String>, patches: impl IntoIterator<Item = PatchId>) -> Self {
    Self {
      name: name.into(),
      patches: patches.into_iter().collect(),
      stitching: StitchConfig::default(),
    }
  }

  pub fn with_stitching(mut self, stitching: StitchConfig) -> Self {
    self.stitching = stitching;
    self
  }
}

/// A retained patch.
#[derive(Clone, Debug)]
pub struct ActivePatch {
  pub view: PatchView,
  pub handle: GpuHandle,
}

/// A retained stitch. `handle` is `None` when the stitch has no triangles or
/// its triangles live in the coalesced triple buffer.
#[derive(Clone, Debug)]
pub struct ActiveStitch {
  pub key: StitchKey,
  pub triangles: Arc<[StitchTriangle]>,
  pub complete: bool,
  pub handle: Option<GpuHandle>,
}

/// All triple-stitch triangles of a set in one buffer.
#[derive(Clone, Debug)]
pub struct CoalescedTriples {
  pub handle: GpuHandle,
  pub triangle_count: usize,
}

/// Immutable snapshot for one consumption cycle.
pub struct ActiveSet {
  id: ActiveSetId,
  name: String,
  storage: Arc<GpuGeomStorage>,
  patches: BTreeMap<PatchId, ActivePatch>,
  doubles: BTreeMap<DoubleKey, ActiveStitch>,
  triples: BTreeMap<TripleKey, ActiveStitch>,
  coalesced: Option<CoalescedTriples>,
  /// One storage reference each; released on drop.
  held: Vec<GpuHandle>,
}

impl std::fmt::Debug for ActiveSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ActiveSet")
      .field("id", &self.id)
      .field("name", &self.name)
      .field("patches", &self.patches.len())
      .field("doubles", &self.doubles.len())
      .field("triples", &self.triples.len())
      .finish()
  }
}

impl ActiveSet {
  pub fn id(&self) -> ActiveSetId {
    self.id
  }

  /// Position in publication order.
  pub fn sequence(&self) -> u64 {
    self.id.raw()
  }

  pub fn name(&self) -> &str {
    &self.name
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

  pub fn patch_ids(&self) -> impl Iterator<Item = PatchId> + '_ {
    self.patches.keys().copied()
  }

  pub fn patch(&self, id: PatchId) -> Option<&ActivePatch> {
    self.patches.get(&id)
  }

  pub fn patches(&self) -> impl Iterator<Item = &ActivePatch> {
    self.patches.values()
  }

  pub fn double_stitches(&self) -> impl Iterator<Item = &ActiveStitch> {
    self.doubles.values()
  }

  pub fn double_stitch(&self, a: PatchId, b: PatchId) -> Option<&ActiveStitch> {
    self.doubles.get(&DoubleKey::new(a, b))
  }

  pub fn triple_stitches(&self) -> impl Iterator<Item = &ActiveStitch> {
    self.triples.values()
  }

  pub fn coalesced_triple_stitches(&self) -> Option<&CoalescedTriples> {
    self.coalesced.as_ref()
  }

  /// Every storage handle this set keeps alive.
  pub fn handles(&self) -> &[GpuHandle] {
    &self.held
  }

  /// Rewrite each patch header from the current attribute flags, without
  /// touching geometry. Returns the number of headers written.
  pub fn reupload_headers(&self) -> Result<usize, StorageError> {
    for patch in self.patches.values() {
      let header = PatchHeader::new(
        patch.view.id,
        patch.view.version,
        patch.view.attributes.header_flags(),
        &patch.view.geometry.bounds,
      );
      self.storage.write_header(patch.handle, &header)?;
    }
    Ok(self.patches.len())
  }

  // ===========================================================================
  // Construction
  // ===========================================================================

  /// Build a set over `request.patches`.
  ///
  /// Missing, stale or incomplete boundary stitches between members are
  /// recomputed first. Either every handle is retained and the set is
  /// returned, or nothing stays retained and an error is returned.
  pub fn build(
    request: &BuildRequest,
    graph: &mut PatchGraph,
    storage: &Arc<GpuGeomStorage>,
    stitcher: &dyn MeshStitcher,
  ) -> Result<ActiveSet, ActiveSetError> {
    let _span = tracing::info_span!("active_set_build", name = %request.name, patches = request.patches.len()).entered();

    let mut views = Vec::with_capacity(request.patches.len());
    for id in &request.patches {
      views.push(graph.view(*id).ok_or(InvariantViolation::UnknownPatch(*id))?);
    }

    let keys = graph.stitch_keys_among(&request.patches, request.stitching.triple_stitches);
    graph.refresh_stitches(&keys, stitcher);

    let mut txn = Transaction::new(storage);
    let contents = match assemble(request, graph, views, &keys, &mut txn) {
      Ok(contents) => contents,
      Err(err) => {
        tracing::warn!(name = %request.name, error = %err, "active set build failed, releasing retained handles");
        return Err(err);
      }
    };

    for (id, handle, version) in txn.staged_patches.drain(..) {
      graph.commit_patch_handle(id, handle, version);
    }
    for (key, handle, slots) in txn.staged_stitches.drain(..) {
      graph.commit_stitch_buffer(&key, handle, slots);
    }

    let set = ActiveSet {
      id: ActiveSetId::next(storage),
      name: request.name.clone(),
      storage: storage.clone(),
      patches: contents.patches,
      doubles: contents.doubles,
      triples: contents.triples,
      coalesced: contents.coalesced,
      held: txn.commit(),
    };
    tracing::debug!(
      id = set.id.raw(),
      patches = set.patches.len(),
      doubles = set.doubles.len(),
      triples = set.triples.len(),
      "active set built"
    );
    Ok(set)
  }
}

impl Drop for ActiveSet {
  fn drop(&mut self) {
    for handle in self.held.drain(..) {
      if let Err(err) = self.storage.release(handle) {
        tracing::warn!(?handle, error = %err, "active set released a stale handle");
      }
    }
  }
}

struct Contents {
  patches: BTreeMap<PatchId, ActivePatch>,
  doubles: BTreeMap<DoubleKey, ActiveStitch>,
  triples: BTreeMap<TripleKey, ActiveStitch>,
  coalesced: Option<CoalescedTriples>,
}

fn assemble(
  request: &BuildRequest,
  graph: &PatchGraph,
  views: Vec<PatchView>,
  keys: &[StitchKey],
  txn: &mut Transaction<'_>,
) -> Result<Contents, ActiveSetError> {
  let failure = |source: StorageError| ActiveSetError::BuildFailure {
    name: request.name.clone(),
    source,
  };

  // Patches: reuse the cached upload while it is still alive, else upload fresh
  let mut patches = BTreeMap::new();
  for view in views {
    let cached = graph
      .cached_patch_handle(view.id)
      .filter(|handle| txn.storage.uploaded_version(*handle) == Some(view.version));
    let handle = match cached {
      Some(handle) if txn.retain(handle) => handle,
      _ => {
        let handle = txn
          .upload(&view.geometry.to_bytes(), HandleKind::Patch, view.version)
          .map_err(failure)?;
        let header = PatchHeader::new(
          view.id,
          view.version,
          view.attributes.header_flags(),
          &view.geometry.bounds,
        );
        txn.storage.write_header(handle, &header).map_err(failure)?;
        txn.staged_patches.push((view.id, handle, view.version));
        handle
      }
    };
    patches.insert(view.id, ActivePatch { view, handle });
  }

  let slots: HashMap<PatchId, u32> = patches.iter().map(|(id, patch)| (*id, patch.handle.slot())).collect();
  let slot_of = |id: PatchId| slots.get(&id).copied();

  let mut doubles = BTreeMap::new();
  let mut triples = BTreeMap::new();
  let mut triple_triangles = Vec::new();
  let coalesce = request.stitching.coalesce_triple_stitches;

  for key in keys {
    let Some(record) = graph.stitch(key) else {
      continue;
    };
    for triangle in record.triangles.iter() {
      if let Some(outside) = triangle.patches().find(|id| !slots.contains_key(id)) {
        return Err(InvariantViolation::StitchOutsideSet { outside }.into());
      }
    }

    let is_triple = matches!(key, StitchKey::Triple(_));
    let handle = if record.triangles.is_empty() {
      None
    } else if is_triple && coalesce {
      triple_triangles.extend_from_slice(&record.triangles);
      None
    } else {
      let key_slots: SmallVec<[u32; 3]> = key.patches().iter().filter_map(|id| slot_of(*id)).collect();
      match graph.cached_stitch_buffer(key, &key_slots) {
        Some(handle) if txn.retain(handle) => Some(handle),
        _ => {
          let bytes = encode_triangles(&record.triangles, slot_of)
            .map_err(|outside| InvariantViolation::StitchOutsideSet { outside })?;
          let kind = if is_triple {
            HandleKind::TripleStitch
          } else {
            HandleKind::DoubleStitch
          };
          let version = record.patch_versions.iter().copied().max().unwrap_or_default();
          let handle = txn.upload(&bytes, kind, version).map_err(failure)?;
          txn.staged_stitches.push((*key, handle, key_slots));
          Some(handle)
        }
      }
    };

    let stitch = ActiveStitch {
      key: *key,
      triangles: record.triangles.clone(),
      complete: record.complete,
      handle,
    };
    match key {
      StitchKey::Double(double) => {
        doubles.insert(*double, stitch);
      }
      StitchKey::Triple(triple) => {
        triples.insert(*triple, stitch);
      }
    }
  }

  let coalesced = if triple_triangles.is_empty() {
    None
  } else {
    let bytes = encode_triangles(&triple_triangles, slot_of)
      .map_err(|outside| InvariantViolation::StitchOutsideSet { outside })?;
    let handle = txn.upload(&bytes, HandleKind::CoalescedTriples, 0).map_err(failure)?;
    Some(CoalescedTriples {
      handle,
      triangle_count: triple_triangles.len(),
    })
  };

  // Every member must be resident at the moment of publication
  for patch in patches.values() {
    if !txn.storage.is_uploaded(patch.handle) {
      return Err(InvariantViolation::PatchNotResident(patch.view.id).into());
    }
  }

  Ok(Contents {
    patches,
    doubles,
    triples,
    coalesced,
  })
}

/// References taken during one build. Dropping it without `commit` releases
/// all of them, which is how a failed build returns counts to their
/// pre-build values.
struct Transaction<'a> {
  storage: &'a GpuGeomStorage,
  held: Vec<GpuHandle>,
  staged_patches: Vec<(PatchId, GpuHandle, u64)>,
  staged_stitches: Vec<(StitchKey, GpuHandle, SmallVec<[u32; 3]>)>,
}

impl<'a> Transaction<'a> {
  fn new(storage: &'a GpuGeomStorage) -> Self {
    Self {
      storage,
      held: Vec::new(),
      staged_patches: Vec::new(),
      staged_stitches: Vec::new(),
    }
  }

  /// Take a reference on a cached handle. False if it is no longer alive.
  fn retain(&mut self, handle: GpuHandle) -> bool {
    match self.storage.retain(handle) {
      Ok(()) => {
        self.held.push(handle);
        true
      }
      Err(_) => false,
    }
  }

  /// Allocate a slot sized for `bytes` and upload into it.
  fn upload(&mut self, bytes: &[u8], kind: HandleKind, version: u64) -> Result<GpuHandle, StorageError> {
    let handle = self.storage.allocate(SizeClass::for_bytes(bytes.len()), kind)?;
    self.held.push(handle);
    self.storage.upload(handle, bytes, version)?;
    Ok(handle)
  }

  fn commit(mut self) -> Vec<GpuHandle> {
    std::mem::take(&mut self.held)
  }
}

impl Drop for Transaction<'_> {
  fn drop(&mut self) {
    for handle in self.held.drain(..) {
      let _ = self.storage.release(handle);
    }
  }
}
