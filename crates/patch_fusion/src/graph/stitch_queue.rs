//! Stitch pass over dirty boundaries.
//!
//! Enqueue → Tick → Completions. Boundaries are independent of each other, so
//! `tick` runs the stitcher over all pending requests in parallel with rayon.

use rayon::prelude::*;
use smallvec::SmallVec;
use web_time::Instant;

use super::{PatchView, StitchKey};
use crate::updater::{MeshStitcher, StitchOutput};

/// A boundary to (re)stitch, with the patch snapshots it is computed from.
pub struct StitchRequest {
  pub key: StitchKey,
  /// Views in key order.
  pub views: SmallVec<[PatchView; 3]>,
}

/// Completed stitcher run.
pub struct StitchCompletion {
  pub key: StitchKey,
  pub output: StitchOutput,
  /// Versions of the views the output was computed from.
  pub patch_versions: SmallVec<[u64; 3]>,
  pub stitch_time_us: u64,
}

/// Parallel stitch stage.
#[derive(Default)]
pub struct StitchStage {
  pending: Vec<StitchRequest>,
  completed: Vec<StitchCompletion>,
}

impl StitchStage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn enqueue(&mut self, key: StitchKey, views: SmallVec<[PatchView; 3]>) {
    self.pending.push(StitchRequest { key, views });
  }

  /// Run the stitcher over every pending request. Returns the number processed.
  pub fn tick(&mut self, stitcher: &dyn MeshStitcher) -> usize {
    if self.pending.is_empty() {
      return 0;
    }

    let requests = std::mem::take(&mut self.pending);
    let count = requests.len();

    let completions: Vec<StitchCompletion> = requests
      .into_par_iter()
      .map(|request| {
        let start = Instant::now();
        let output = match request.views.as_slice() {
          [a, b] => stitcher.stitch_double(a, b),
          [a, b, c] => stitcher.stitch_triple(a, b, c),
          _ => StitchOutput::pending(),
        };
        StitchCompletion {
          key: request.key,
          output,
          patch_versions: request.views.iter().map(|view| view.version).collect(),
          stitch_time_us: start.elapsed().as_micros() as u64,
        }
      })
      .collect();

    self.completed.extend(completions);
    count
  }

  pub fn drain_completions(&mut self) -> Vec<StitchCompletion> {
    std::mem::take(&mut self.completed)
  }

  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  pub fn is_idle(&self) -> bool {
    self.pending.is_empty() && self.completed.is_empty()
  }
}
