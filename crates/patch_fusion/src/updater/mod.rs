//! Geometry Updater - per-frame growth and refinement of the patch graph.
//!
//! ```text
//! extend(frame, pose)                       update(active_set)
//!   │ mesher.mesh(neighborhood)               │ mesher.refine(patch) per member
//!   │ insert / grow / merge patches           │ replace geometry
//!   └──────────────┬──────────────────────────┘
//!                  ▼
//!   members = region + affected patches + context rings
//!                  ▼
//!   ActiveSet::build (stitch pass, retain/upload, invariants)
//!        │ ok                          │ err
//!        ▼                             ▼
//!   fold completeness, publish    keep last published set, report
//!                  ▼
//!   collect garbage, purge retired patches
//! ```

mod collaborators;

use std::collections::BTreeSet;
use std::sync::Arc;

use glam::Vec3;
use web_time::Instant;

pub use collaborators::{
  Merge, MeshStitcher, Mesher, MesherOutput, NeighborRef, Neighborhood, NewPatch, PatchUpdate, StitchOutput,
};

use crate::active_set::{ActiveSet, BuildRequest, Publication};
use crate::config::ReconstructionConfig;
use crate::dataset::Frame;
use crate::error::UpdateError;
use crate::gpu::{GpuGeomStorage, SizeClass};
use crate::graph::{PatchGraph, PatchId};
use crate::metrics::ResidencyMetrics;
use crate::types::{Calibration, Pose};

/// Outcome of one `extend` or `update` pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
  /// Source frame index (`None` for `update`).
  pub frame: Option<u64>,
  pub new_patches: usize,
  pub updated_patches: usize,
  pub merged_patches: usize,
  /// Sequence of the published active set, if the pass published one.
  pub published: Option<u64>,
  pub active_patches: usize,
  pub double_stitches: usize,
  pub triple_stitches: usize,
  pub incomplete_patches: usize,
  pub newly_abandoned: usize,
  /// Patches left out of the set because no slot can hold their geometry.
  pub oversized_patches: usize,
  pub reclaimed_slots: usize,
  pub resident_slots: usize,
  pub elapsed_us: u64,
}

/// Patches changed by applying one mesher output.
#[derive(Debug, Default)]
struct Applied {
  affected: BTreeSet<PatchId>,
  new_patches: usize,
  updated_patches: usize,
  merged_patches: usize,
}

/// Drives the mesher and stitcher, owns the patch graph, publishes active sets.
pub struct GeometryUpdater {
  config: ReconstructionConfig,
  calibration: Calibration,
  graph: PatchGraph,
  storage: Arc<GpuGeomStorage>,
  mesher: Box<dyn Mesher>,
  stitcher: Box<dyn MeshStitcher>,
  publication: Arc<Publication>,
  metrics: ResidencyMetrics,
}

impl GeometryUpdater {
  pub fn new(
    config: ReconstructionConfig,
    calibration: Calibration,
    storage: Arc<GpuGeomStorage>,
    mesher: Box<dyn Mesher>,
    stitcher: Box<dyn MeshStitcher>,
  ) -> Self {
    Self {
      config,
      calibration,
      graph: PatchGraph::new(),
      storage,
      mesher,
      stitcher,
      publication: Arc::new(Publication::new()),
      metrics: ResidencyMetrics::new(),
    }
  }

  /// Publish into an existing publication (shared with consumers).
  pub fn with_publication(mut self, publication: Arc<Publication>) -> Self {
    self.publication = publication;
    self
  }

  pub fn config(&self) -> &ReconstructionConfig {
    &self.config
  }

  pub fn graph(&self) -> &PatchGraph {
    &self.graph
  }

  pub fn storage(&self) -> &Arc<GpuGeomStorage> {
    &self.storage
  }

  pub fn publication(&self) -> &Arc<Publication> {
    &self.publication
  }

  /// Last published active set.
  pub fn published(&self) -> Option<Arc<ActiveSet>> {
    self.publication.latest()
  }

  pub fn metrics(&self) -> &ResidencyMetrics {
    &self.metrics
  }

  /// Grow the graph from a new frame and publish the surrounding region.
  pub fn extend(&mut self, frame: &Frame, pose: &Pose) -> Result<FrameReport, UpdateError> {
    let _span = tracing::info_span!("extend", frame = frame.index).entered();
    let start = Instant::now();

    let camera = pose.transform_point3(Vec3::ZERO);
    let nearby = self.graph.patches_within(camera, self.config.neighborhood.radius);
    let neighborhood = Neighborhood {
      patches: nearby.iter().filter_map(|id| self.graph.view(*id)).collect(),
    };

    let output = self.mesher.mesh(frame, pose, &self.calibration, &neighborhood);
    if output.is_empty() {
      tracing::trace!("mesher produced nothing for this frame");
    }
    let applied = self.apply_mesher_output(output)?;
    for id in &applied.affected {
      if let Some(attributes) = self.graph.attributes(*id) {
        attributes.touch(frame.index);
      }
    }

    let core: BTreeSet<PatchId> = nearby.into_iter().collect();
    let result = self.finish_pass(format!("frame {}", frame.index), core, applied.affected.clone());
    let elapsed_us = start.elapsed().as_micros() as u64;
    self.metrics.record_extend(elapsed_us);

    let mut report = result?;
    report.frame = Some(frame.index);
    report.new_patches = applied.new_patches;
    report.updated_patches = applied.updated_patches;
    report.merged_patches = applied.merged_patches;
    report.elapsed_us = elapsed_us;
    Ok(report)
  }

  /// Refresh geometry and stitches of the patches in `active` without a new
  /// frame, and publish the result.
  pub fn update(&mut self, active: &ActiveSet) -> Result<FrameReport, UpdateError> {
    let _span = tracing::info_span!("update", source = active.sequence()).entered();
    let start = Instant::now();

    let targets: BTreeSet<PatchId> = active.patch_ids().filter_map(|id| self.graph.resolve(id)).collect();
    let mut refined = BTreeSet::new();
    for id in &targets {
      let Some(view) = self.graph.view(*id) else {
        continue;
      };
      if let Some(geometry) = self.mesher.refine(&view) {
        self.graph.replace_geometry(*id, geometry)?;
        refined.insert(*id);
      }
    }

    let updated_patches = refined.len();
    let result = self.finish_pass(format!("update of {}", active.name()), targets, refined);
    let elapsed_us = start.elapsed().as_micros() as u64;
    self.metrics.record_update(elapsed_us);

    let mut report = result?;
    report.updated_patches = updated_patches;
    report.elapsed_us = elapsed_us;
    Ok(report)
  }

  /// Validate, then apply, a mesher output. Nothing is applied if any
  /// reference is out of range.
  fn apply_mesher_output(&mut self, output: MesherOutput) -> Result<Applied, UpdateError> {
    let new_count = output.new_patches.len();
    let check = |neighbor: &NeighborRef| -> Result<(), UpdateError> {
      match neighbor {
        NeighborRef::New(index) if *index >= new_count => Err(UpdateError::Mesher(format!(
          "new patch index {index} out of range ({new_count} new patches)"
        ))),
        NeighborRef::Existing(id) if !self.graph.contains(*id) => Err(UpdateError::UnknownPatch(*id)),
        _ => Ok(()),
      }
    };
    for patch in &output.new_patches {
      patch.neighbors.iter().try_for_each(check)?;
    }
    for update in &output.updated_patches {
      if !self.graph.contains(update.id) {
        return Err(UpdateError::UnknownPatch(update.id));
      }
      update.new_neighbors.iter().try_for_each(check)?;
    }
    for merge in &output.merges {
      if merge.from == merge.into {
        return Err(UpdateError::Mesher(format!("patch {} merged into itself", merge.from)));
      }
      for id in [merge.from, merge.into] {
        if !self.graph.contains(id) {
          return Err(UpdateError::UnknownPatch(id));
        }
      }
    }

    let mut applied = Applied::default();
    let new_ids: Vec<PatchId> = output
      .new_patches
      .iter()
      .map(|patch| self.graph.insert(patch.geometry.clone()))
      .collect();
    let resolve = |neighbor: &NeighborRef| match neighbor {
      NeighborRef::Existing(id) => *id,
      NeighborRef::New(index) => new_ids[*index],
    };

    for (id, patch) in new_ids.iter().zip(&output.new_patches) {
      for neighbor in &patch.neighbors {
        self.graph.link(*id, resolve(neighbor))?;
      }
      applied.affected.insert(*id);
    }
    applied.new_patches = new_ids.len();

    for update in output.updated_patches {
      self.graph.replace_geometry(update.id, update.geometry)?;
      for neighbor in &update.new_neighbors {
        self.graph.link(update.id, resolve(neighbor))?;
      }
      applied.affected.insert(update.id);
      applied.updated_patches += 1;
    }

    for merge in output.merges {
      let (Some(from), Some(into)) = (self.graph.resolve(merge.from), self.graph.resolve(merge.into)) else {
        continue;
      };
      if from == into || from != merge.from {
        continue;
      }
      self.graph.retire(from, Some(into))?;
      applied.affected.remove(&from);
      applied.affected.insert(into);
      applied.merged_patches += 1;
    }

    Ok(applied)
  }

  /// Build and publish a set over `core` plus `affected` and its context
  /// rings, then run garbage collection.
  fn finish_pass(
    &mut self,
    name: String,
    core: BTreeSet<PatchId>,
    affected: BTreeSet<PatchId>,
  ) -> Result<FrameReport, UpdateError> {
    let seeds = affected.into_iter().chain(self.graph.dirty_patches());
    let mut members = self
      .graph
      .expand_neighborhood(seeds, self.config.neighborhood.context_rings);
    members.extend(core.into_iter().filter(|id| self.graph.contains(*id)));

    let mut report = FrameReport {
      oversized_patches: self.drop_oversized(&mut members),
      ..FrameReport::default()
    };
    if !members.is_empty() {
      let request = BuildRequest::new(name, members).with_stitching(self.config.stitching);
      let build_start = Instant::now();
      match ActiveSet::build(&request, &mut self.graph, &self.storage, self.stitcher.as_ref()) {
        Ok(set) => {
          let build_us = build_start.elapsed().as_micros() as u64;
          self.fold_completeness(&set, &mut report);
          self.graph.clear_dirty(request.patches.iter());

          report.active_patches = set.len();
          report.double_stitches = set.double_stitches().count();
          report.triple_stitches = set.triple_stitches().count();
          self.metrics.record_publication(
            build_us,
            report.active_patches,
            report.double_stitches,
            report.triple_stitches,
            report.incomplete_patches,
          );
          report.published = Some(self.publication.publish(set).sequence());
        }
        Err(err) => {
          if err.is_fatal() {
            tracing::error!(error = %err, "active set build failed fatally");
          } else {
            tracing::warn!(error = %err, "frame skipped, previous active set stays published");
          }
          self.metrics.record_failure();
          self.maintenance(&mut report);
          return Err(err.into());
        }
      }
    }

    self.maintenance(&mut report);
    Ok(report)
  }

  /// Remove patches whose geometry exceeds the largest slot. They stay out of
  /// every set until new geometry marks them dirty again.
  fn drop_oversized(&mut self, members: &mut BTreeSet<PatchId>) -> usize {
    let max = self.storage.max_size_class();
    let oversized: Vec<PatchId> = members
      .iter()
      .copied()
      .filter(|id| {
        self
          .graph
          .view(*id)
          .is_some_and(|view| SizeClass::for_bytes(view.geometry.byte_len()) > max)
      })
      .collect();

    for id in &oversized {
      members.remove(id);
      if self.graph.is_dirty(*id) {
        tracing::warn!(patch = %id, max = ?max, "patch geometry exceeds the largest slot, left out of the active set");
      }
    }
    self.graph.clear_dirty(oversized.iter());
    oversized.len()
  }

  fn fold_completeness(&self, set: &ActiveSet, report: &mut FrameReport) {
    let completeness = set.check_for_complete_geometry();
    let policy = self.config.completeness;
    for entry in completeness.entries() {
      let Some(attributes) = self.graph.attributes(entry.id) else {
        continue;
      };
      if attributes.record_pass(entry.complete, &policy) {
        tracing::info!(
          patch = %entry.id,
          passes = attributes.incomplete_passes(),
          "boundary abandoned after repeated incomplete passes"
        );
        report.newly_abandoned += 1;
      }
    }
    report.incomplete_patches = completeness.incomplete_count();

    // Flags changed, geometry did not
    if let Err(err) = set.reupload_headers() {
      tracing::warn!(error = %err, "failed to refresh patch headers");
    }
  }

  fn maintenance(&mut self, report: &mut FrameReport) {
    report.reclaimed_slots = self.storage.collect_garbage();
    let purged = self.graph.purge_retired(&self.storage);
    report.resident_slots = self.storage.resident_count();
    self
      .metrics
      .record_maintenance(report.resident_slots, report.reclaimed_slots, report.newly_abandoned);
    tracing::trace!(
      reclaimed = report.reclaimed_slots,
      purged,
      resident = report.resident_slots,
      "maintenance done"
    );
  }
}
