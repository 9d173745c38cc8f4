use glam::Vec3;

use super::*;
use crate::config::IncompletePolicy;
use crate::test_utils::{quad, test_storage, ScriptedStitcher};

/// P1, P2, P3 side by side along x, all mutually adjacent.
fn triangle_graph() -> (PatchGraph, [PatchId; 3]) {
  let mut graph = PatchGraph::new();
  let ids = [0.0, 1.0, 2.0].map(|x| graph.insert(quad([x, 0.0, 0.0], 1.0)));
  graph.link(ids[0], ids[1]).unwrap();
  graph.link(ids[1], ids[2]).unwrap();
  graph.link(ids[0], ids[2]).unwrap();
  (graph, ids)
}

fn all_keys(graph: &PatchGraph) -> Vec<StitchKey> {
  let members = graph.ids().into_iter().collect();
  graph.stitch_keys_among(&members, true)
}

// =============================================================================
// Patch lifecycle
// =============================================================================

#[test]
fn test_insert_assigns_fresh_dirty_ids() {
  let mut graph = PatchGraph::new();
  let a = graph.insert(quad([0.0; 3], 1.0));
  let b = graph.insert(quad([1.0, 0.0, 0.0], 1.0));

  assert_eq!(a, PatchId::new(1));
  assert_eq!(b, PatchId::new(2));
  assert_eq!(graph.len(), 2);
  assert_eq!(graph.version(a), Some(1));
  assert!(graph.is_dirty(a) && graph.is_dirty(b));
  assert_eq!(graph.neighbors(a), Some(&[][..]));
}

#[test]
fn test_link_is_symmetric_and_checked() {
  let mut graph = PatchGraph::new();
  let a = graph.insert(quad([0.0; 3], 1.0));
  let b = graph.insert(quad([1.0, 0.0, 0.0], 1.0));

  assert_eq!(graph.link(a, b), Ok(true));
  assert_eq!(graph.link(b, a), Ok(false));
  assert_eq!(graph.link(a, a), Ok(false));
  assert!(graph.are_neighbors(a, b) && graph.are_neighbors(b, a));
  assert_eq!(
    graph.link(a, PatchId::new(99)),
    Err(InvariantViolation::UnknownPatch(PatchId::new(99)))
  );
}

#[test]
fn test_replace_geometry_bumps_version_and_dirties_neighbors() {
  let (mut graph, [a, b, c]) = triangle_graph();
  graph.clear_dirty([a, b, c].iter());
  let attributes = graph.view(a).unwrap().attributes;
  attributes.record_pass(false, &IncompletePolicy::bounded(1));
  assert!(attributes.is_abandoned());

  let old = graph.view(a).unwrap();
  assert_eq!(graph.replace_geometry(a, quad([0.0, 0.5, 0.0], 1.0)), Ok(2));

  assert!(graph.is_dirty(a) && graph.is_dirty(b) && graph.is_dirty(c));
  assert!(!attributes.is_abandoned());
  // Snapshots taken earlier are unaffected
  assert_eq!(old.version, 1);
  assert_eq!(old.geometry.bounds.min, [0.0, 0.0, 0.0]);
  assert_eq!(graph.view(a).unwrap().geometry.bounds.min, [0.0, 0.5, 0.0]);
}

#[test]
fn test_retire_with_merge_moves_links() {
  let mut graph = PatchGraph::new();
  let ids: Vec<PatchId> = (0..4).map(|i| graph.insert(quad([i as f32, 0.0, 0.0], 1.0))).collect();
  let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
  graph.link(a, b).unwrap();
  graph.link(b, c).unwrap();
  graph.link(c, d).unwrap();

  graph.retire(b, Some(c)).unwrap();
  assert!(!graph.contains(b));
  assert!(graph.is_retired(b));
  assert!(graph.are_neighbors(a, c));
  assert!(graph.are_neighbors(c, d));
  assert_eq!(graph.resolve(b), Some(c));

  graph.retire(c, Some(d)).unwrap();
  assert_eq!(graph.resolve(b), Some(d));
  assert!(graph.are_neighbors(a, d));

  // Never uploaded, so nothing keeps the tombstones around
  let (storage, _) = test_storage(4);
  assert_eq!(graph.purge_retired(&storage), 2);
  assert_eq!(graph.retired_count(), 0);
  assert_eq!(graph.resolve(b), None);
}

#[test]
fn test_tombstone_kept_while_older_upload_is_live() {
  use crate::gpu::{HandleKind, SizeClass};

  let mut graph = PatchGraph::new();
  let a = graph.insert(quad([0.0, 0.0, 0.0], 1.0));
  let b = graph.insert(quad([1.0, 0.0, 0.0], 1.0));
  graph.link(a, b).unwrap();
  let (storage, _) = test_storage(8);

  // An older set still holds the version 1 upload
  let first = storage.allocate(SizeClass::MIN, HandleKind::Patch).unwrap();
  graph.commit_patch_handle(a, first, 1);
  let version = graph.replace_geometry(a, quad([0.0, 0.5, 0.0], 1.0)).unwrap();
  let second = storage.allocate(SizeClass::MIN, HandleKind::Patch).unwrap();
  graph.commit_patch_handle(a, second, version);

  // The newest set is gone and its upload reclaimed
  storage.release(second).unwrap();
  storage.collect_garbage();
  assert!(!storage.is_live(second));

  graph.retire(a, Some(b)).unwrap();
  assert_eq!(graph.purge_retired(&storage), 0);
  assert_eq!(graph.resolve(a), Some(b));

  storage.release(first).unwrap();
  storage.collect_garbage();
  assert_eq!(graph.purge_retired(&storage), 1);
  assert_eq!(graph.resolve(a), None);
}

#[test]
fn test_purge_prunes_reclaimed_uploads_of_live_patches() {
  use crate::gpu::{HandleKind, SizeClass};

  let mut graph = PatchGraph::new();
  let a = graph.insert(quad([0.0, 0.0, 0.0], 1.0));
  let (storage, _) = test_storage(8);
  let handle = storage.allocate(SizeClass::MIN, HandleKind::Patch).unwrap();
  graph.commit_patch_handle(a, handle, 1);
  assert_eq!(graph.patches[&a].uploads.len(), 1);

  storage.release(handle).unwrap();
  storage.collect_garbage();
  graph.purge_retired(&storage);
  assert!(graph.patches[&a].uploads.is_empty());
}

#[test]
fn test_retire_rejects_unknown_target() {
  let (mut graph, [a, ..]) = triangle_graph();
  assert_eq!(
    graph.retire(a, Some(a)),
    Err(InvariantViolation::UnknownPatch(a))
  );
  assert_eq!(
    graph.retire(PatchId::new(42), None),
    Err(InvariantViolation::UnknownPatch(PatchId::new(42)))
  );
  assert!(graph.contains(a));
}

// =============================================================================
// Queries
// =============================================================================

#[test]
fn test_expand_neighborhood_by_rings() {
  let mut graph = PatchGraph::new();
  let ids: Vec<PatchId> = (0..5).map(|i| graph.insert(quad([i as f32, 0.0, 0.0], 1.0))).collect();
  for pair in ids.windows(2) {
    graph.link(pair[0], pair[1]).unwrap();
  }

  let zero = graph.expand_neighborhood([ids[2]], 0);
  assert_eq!(zero.into_iter().collect::<Vec<_>>(), vec![ids[2]]);

  let one = graph.expand_neighborhood([ids[2]], 1);
  assert_eq!(one.into_iter().collect::<Vec<_>>(), vec![ids[1], ids[2], ids[3]]);

  let unknown = graph.expand_neighborhood([PatchId::new(77)], 3);
  assert!(unknown.is_empty());
}

#[test]
fn test_patches_within_radius() {
  let (graph, [a, b, c]) = triangle_graph();
  assert_eq!(graph.patches_within(Vec3::new(0.5, 0.5, 0.0), 0.1), vec![a]);
  assert_eq!(graph.patches_within(Vec3::new(1.0, 0.5, 0.0), 0.1), vec![a, b]);
  assert_eq!(graph.patches_within(Vec3::new(1.5, 0.5, 10.0), 20.0), vec![a, b, c]);
}

#[test]
fn test_dirty_boundaries_cover_dirty_sides() {
  let (mut graph, [a, b, c]) = triangle_graph();
  graph.clear_dirty([a, b, c].iter());
  assert!(graph.dirty_boundaries().is_empty());

  graph.replace_geometry(c, quad([2.0, 0.0, 0.0], 1.0)).unwrap();
  graph.clear_dirty([a, b].iter());
  assert_eq!(
    graph.dirty_boundaries(),
    vec![DoubleKey::new(a, c), DoubleKey::new(b, c)]
  );
}

#[test]
fn test_stitch_keys_among_members() {
  let (graph, [a, b, c]) = triangle_graph();
  let keys = all_keys(&graph);
  assert_eq!(keys.len(), 4);
  assert!(keys.contains(&StitchKey::Triple(TripleKey::new(a, b, c))));

  let pair = [a, b].into_iter().collect();
  let keys = graph.stitch_keys_among(&pair, true);
  assert_eq!(keys, vec![StitchKey::Double(DoubleKey::new(a, b))]);

  let members = [a, b, c].into_iter().collect();
  let doubles_only = graph.stitch_keys_among(&members, false);
  assert_eq!(doubles_only.len(), 3);
}

// =============================================================================
// Stitch pass
// =============================================================================

#[test]
fn test_refresh_reuses_current_records() {
  let (mut graph, _) = triangle_graph();
  let stitcher = ScriptedStitcher::new();
  let keys = all_keys(&graph);

  let first = graph.refresh_stitches(&keys, &stitcher);
  assert_eq!((first.stitched, first.reused, first.incomplete), (4, 0, 0));
  assert_eq!(graph.stitch_count(), (3, 1));

  let second = graph.refresh_stitches(&keys, &stitcher);
  assert_eq!((second.stitched, second.reused), (0, 4));
  assert_eq!(stitcher.calls(), 4);
}

#[test]
fn test_refresh_restitches_after_geometry_change() {
  let (mut graph, [a, b, c]) = triangle_graph();
  let stitcher = ScriptedStitcher::new();
  let keys = all_keys(&graph);
  graph.refresh_stitches(&keys, &stitcher);

  graph.replace_geometry(a, quad([0.0, 0.1, 0.0], 1.0)).unwrap();
  let stats = graph.refresh_stitches(&keys, &stitcher);
  assert_eq!((stats.stitched, stats.reused), (3, 1));

  let record = graph.double_stitch(&DoubleKey::new(a, b)).unwrap();
  assert_eq!(record.patch_versions.as_slice(), &[2, 1]);
  assert!(graph.double_stitch(&DoubleKey::new(b, c)).unwrap().is_current(&[1, 1]));
}

#[test]
fn test_incomplete_retried_until_abandoned() {
  let (mut graph, [a, b, _]) = triangle_graph();
  let stitcher = ScriptedStitcher::new();
  stitcher.set_incomplete(DoubleKey::new(a, b), true);
  let keys = all_keys(&graph);

  let first = graph.refresh_stitches(&keys, &stitcher);
  assert_eq!(first.incomplete, 1);
  assert!(!graph.double_stitch(&DoubleKey::new(a, b)).unwrap().complete);

  let retry = graph.refresh_stitches(&keys, &stitcher);
  assert_eq!((retry.stitched, retry.reused), (1, 3));

  graph
    .attributes(a)
    .unwrap()
    .record_pass(false, &IncompletePolicy::bounded(1));
  let abandoned = graph.refresh_stitches(&keys, &stitcher);
  assert_eq!((abandoned.stitched, abandoned.reused), (0, 4));

  stitcher.set_incomplete(DoubleKey::new(a, b), false);
  graph.replace_geometry(a, quad([0.0; 3], 1.0)).unwrap();
  graph.refresh_stitches(&keys, &stitcher);
  assert!(graph.double_stitch(&DoubleKey::new(a, b)).unwrap().complete);
}

#[test]
fn test_unlink_and_retire_drop_stitches() {
  let (mut graph, [a, b, c]) = triangle_graph();
  let keys = all_keys(&graph);
  graph.refresh_stitches(&keys, &ScriptedStitcher::new());

  assert!(graph.unlink(a, b));
  assert!(!graph.unlink(a, b));
  assert!(graph.double_stitch(&DoubleKey::new(a, b)).is_none());
  assert!(graph.triple_stitch(&TripleKey::new(a, b, c)).is_none());
  assert_eq!(graph.stitch_count(), (2, 0));

  graph.retire(c, None).unwrap();
  assert_eq!(graph.stitch_count(), (0, 0));
  assert!(graph.neighbors(a).unwrap().is_empty());
}
