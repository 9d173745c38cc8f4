//! Read-only draw traversal of an active set.

use super::{ActivePatch, ActiveSet, ActiveStitch, CoalescedTriples};

/// Consumer of draw calls (renderer, tracker, exporter).
///
/// Draw operations never touch the patch graph. They must not run on a set
/// concurrently with its own release, which `Arc<ActiveSet>` rules out.
pub trait DrawSink {
  fn draw_patch(&mut self, patch: &ActivePatch);

  fn draw_double_stitch(&mut self, stitch: &ActiveStitch);

  fn draw_triple_stitch(&mut self, stitch: &ActiveStitch);

  fn draw_coalesced_triples(&mut self, triples: &CoalescedTriples);
}

/// No-op implementation for headless operation.
pub struct NullSink;

impl DrawSink for NullSink {
  fn draw_patch(&mut self, _patch: &ActivePatch) {
    // No-op
  }

  fn draw_double_stitch(&mut self, _stitch: &ActiveStitch) {
    // No-op
  }

  fn draw_triple_stitch(&mut self, _stitch: &ActiveStitch) {
    // No-op
  }

  fn draw_coalesced_triples(&mut self, _triples: &CoalescedTriples) {
    // No-op
  }
}

impl ActiveSet {
  pub fn draw_patches(&self, sink: &mut dyn DrawSink) {
    for patch in self.patches.values() {
      sink.draw_patch(patch);
    }
  }

  /// Draw double stitches that have triangles.
  pub fn draw_double_stitches(&self, sink: &mut dyn DrawSink) {
    for stitch in self.doubles.values().filter(|stitch| stitch.handle.is_some()) {
      sink.draw_double_stitch(stitch);
    }
  }

  /// Draw triple stitches: one call for the coalesced buffer if there is one,
  /// otherwise one per uploaded triple.
  pub fn draw_triple_stitches(&self, sink: &mut dyn DrawSink) {
    if let Some(coalesced) = &self.coalesced {
      sink.draw_coalesced_triples(coalesced);
      return;
    }
    for stitch in self.triples.values().filter(|stitch| stitch.handle.is_some()) {
      sink.draw_triple_stitch(stitch);
    }
  }

  pub fn draw_everything(&self, sink: &mut dyn DrawSink) {
    self.draw_patches(sink);
    self.draw_double_stitches(sink);
    self.draw_triple_stitches(sink);
  }
}
