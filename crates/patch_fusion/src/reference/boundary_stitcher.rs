//! Zipper stitcher for patches that face each other across a small gap.

use std::collections::HashSet;

use glam::Vec3;

use crate::graph::PatchView;
use crate::types::{StitchTriangle, VertexRef};
use crate::updater::{MeshStitcher, StitchOutput};

/// Joins boundary vertices closer than `max_gap` to the other patch.
///
/// A boundary with no vertices near the other side is reported incomplete:
/// the gap is expected to close once more of the surface has been observed.
pub struct BoundaryStitcher {
  max_gap: f32,
}

impl BoundaryStitcher {
  pub fn new(max_gap: f32) -> Self {
    Self {
      max_gap: max_gap.max(0.0),
    }
  }

  /// Unique vertices of `patch` within `max_gap` of the other patch's bounds.
  fn boundary(&self, patch: &PatchView, other: &PatchView) -> Vec<(u32, Vec3)> {
    let mut seen = HashSet::new();
    patch
      .geometry
      .vertices
      .iter()
      .enumerate()
      .map(|(index, vertex)| (index as u32, Vec3::from_array(vertex.position)))
      .filter(|(_, position)| other.geometry.bounds.distance_to(*position) <= self.max_gap)
      .filter(|(_, position)| seen.insert(position.to_array().map(f32::to_bits)))
      .collect()
  }

  /// Vertex of `patch` closest to both other patches.
  fn corner(&self, patch: &PatchView, others: [&PatchView; 2]) -> Option<(u32, Vec3, f32)> {
    patch
      .geometry
      .vertices
      .iter()
      .enumerate()
      .map(|(index, vertex)| {
        let position = Vec3::from_array(vertex.position);
        let gap = others
          .iter()
          .map(|other| other.geometry.bounds.distance_to(position))
          .fold(0.0, f32::max);
        (index as u32, position, gap)
      })
      .min_by(|a, b| a.2.total_cmp(&b.2))
  }
}

impl MeshStitcher for BoundaryStitcher {
  fn stitch_double(&self, a: &PatchView, b: &PatchView) -> StitchOutput {
    let mut side_a = self.boundary(a, b);
    let mut side_b = self.boundary(b, a);
    if side_a.is_empty() || side_b.is_empty() {
      return StitchOutput::pending();
    }

    // Sort both sides along the boundary's longest extent
    let (min, max) = side_a
      .iter()
      .chain(&side_b)
      .fold((Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)), |(min, max), (_, p)| {
        (min.min(*p), max.max(*p))
      });
    let extent = max - min;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
      Vec3::X
    } else if extent.y >= extent.z {
      Vec3::Y
    } else {
      Vec3::Z
    };
    side_a.sort_by(|p, q| p.1.dot(axis).total_cmp(&q.1.dot(axis)));
    side_b.sort_by(|p, q| p.1.dot(axis).total_cmp(&q.1.dot(axis)));

    let corner_a = |i: usize| VertexRef::new(a.id, side_a[i].0);
    let corner_b = |j: usize| VertexRef::new(b.id, side_b[j].0);
    let mut triangles = Vec::with_capacity(side_a.len() + side_b.len());
    let (mut i, mut j) = (0, 0);
    while i + 1 < side_a.len() || j + 1 < side_b.len() {
      // Advance the side whose next vertex gives the shorter diagonal
      let advance_a = j + 1 >= side_b.len()
        || (i + 1 < side_a.len()
          && side_a[i + 1].1.distance(side_b[j].1) <= side_a[i].1.distance(side_b[j + 1].1));
      if advance_a {
        triangles.push(StitchTriangle::new(corner_a(i), corner_b(j), corner_a(i + 1)));
        i += 1;
      } else {
        triangles.push(StitchTriangle::new(corner_a(i), corner_b(j), corner_b(j + 1)));
        j += 1;
      }
    }

    StitchOutput::complete(triangles)
  }

  fn stitch_triple(&self, a: &PatchView, b: &PatchView, c: &PatchView) -> StitchOutput {
    let (Some(ca), Some(cb), Some(cc)) = (self.corner(a, [b, c]), self.corner(b, [a, c]), self.corner(c, [a, b]))
    else {
      return StitchOutput::pending();
    };

    // Patches that never meet at a corner need no corner triangle
    if ca.2 > self.max_gap || cb.2 > self.max_gap || cc.2 > self.max_gap {
      return StitchOutput::complete(Vec::new());
    }
    StitchOutput::complete(vec![StitchTriangle::new(
      VertexRef::new(a.id, ca.0),
      VertexRef::new(b.id, cb.0),
      VertexRef::new(c.id, cc.0),
    )])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::{quad, view_of};

  #[test]
  fn test_adjacent_quads_are_zipped() {
    let a = view_of(1, quad([0.0, 0.0, 0.0], 1.0));
    let b = view_of(2, quad([1.01, 0.0, 0.0], 1.0));
    let stitcher = BoundaryStitcher::new(0.05);

    let output = stitcher.stitch_double(&a, &b);
    assert!(output.complete);
    assert_eq!(output.triangles.len(), 2);
    for triangle in &output.triangles {
      let patches: HashSet<_> = triangle.patches().collect();
      assert_eq!(patches.len(), 2);
    }
  }

  #[test]
  fn test_distant_patches_are_incomplete() {
    let a = view_of(1, quad([0.0, 0.0, 0.0], 1.0));
    let b = view_of(2, quad([3.0, 0.0, 0.0], 1.0));
    let output = BoundaryStitcher::new(0.05).stitch_double(&a, &b);

    assert!(!output.complete);
    assert!(output.triangles.is_empty());
  }

  #[test]
  fn test_triple_corner() {
    let a = view_of(1, quad([0.0, 0.0, 0.0], 1.0));
    let b = view_of(2, quad([1.01, 0.0, 0.0], 1.0));
    let c = view_of(3, quad([0.0, 1.01, 0.0], 1.0));
    let output = BoundaryStitcher::new(0.05).stitch_triple(&a, &b, &c);

    assert!(output.complete);
    assert_eq!(output.triangles.len(), 1);
    let patches: Vec<_> = output.triangles[0].patches().collect();
    assert_eq!(patches.len(), 3);
  }
}
