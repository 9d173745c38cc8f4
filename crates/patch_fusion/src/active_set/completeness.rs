//! Per-patch completeness of an active set.
//!
//! A patch is complete when every neighbor that is also a member of the set
//! is joined to it by a complete double stitch, and no triple stitch it takes
//! part in is still incomplete. Neighbors outside the set expect no stitch in
//! this set and are only counted.

use smallvec::SmallVec;

use super::ActiveSet;
use crate::graph::{DoubleKey, PatchId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchCompleteness {
  pub id: PatchId,
  pub complete: bool,
  /// Member neighbors whose stitch is missing or incomplete.
  pub missing: SmallVec<[PatchId; 4]>,
  /// Incomplete corner stitches the patch takes part in.
  pub incomplete_corners: u32,
  /// Neighbors that are not members of the set.
  pub outside_neighbors: u32,
}

/// Result of [`ActiveSet::check_for_complete_geometry`], sorted by patch id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletenessReport {
  entries: Vec<PatchCompleteness>,
}

impl CompletenessReport {
  pub fn entries(&self) -> &[PatchCompleteness] {
    &self.entries
  }

  pub fn get(&self, id: PatchId) -> Option<&PatchCompleteness> {
    self
      .entries
      .binary_search_by_key(&id, |entry| entry.id)
      .ok()
      .map(|index| &self.entries[index])
  }

  pub fn is_complete(&self, id: PatchId) -> Option<bool> {
    self.get(id).map(|entry| entry.complete)
  }

  pub fn incomplete(&self) -> impl Iterator<Item = PatchId> + '_ {
    self.entries.iter().filter(|entry| !entry.complete).map(|entry| entry.id)
  }

  pub fn incomplete_count(&self) -> usize {
    self.entries.iter().filter(|entry| !entry.complete).count()
  }

  pub fn all_complete(&self) -> bool {
    self.entries.iter().all(|entry| entry.complete)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl ActiveSet {
  /// Scan retained patches and stitches and report which patches have all
  /// their expected boundary stitches. Reads only snapshot data, so repeated
  /// calls on the same set return identical reports.
  pub fn check_for_complete_geometry(&self) -> CompletenessReport {
    let entries = self
      .patches
      .values()
      .map(|patch| {
        let id = patch.view.id;
        let mut missing = SmallVec::new();
        let mut outside_neighbors = 0;

        let mut neighbors = patch.view.neighbors.clone();
        neighbors.sort_unstable();
        for neighbor in neighbors {
          if !self.patches.contains_key(&neighbor) {
            outside_neighbors += 1;
            continue;
          }
          let stitched = self
            .doubles
            .get(&DoubleKey::new(id, neighbor))
            .is_some_and(|stitch| stitch.complete);
          if !stitched {
            missing.push(neighbor);
          }
        }

        let incomplete_corners = self
          .triples
          .iter()
          .filter(|(key, stitch)| key.contains(id) && !stitch.complete)
          .count() as u32;

        PatchCompleteness {
          id,
          complete: missing.is_empty() && incomplete_corners == 0,
          missing,
          incomplete_corners,
          outside_neighbors,
        }
      })
      .collect();

    CompletenessReport { entries }
  }
}
