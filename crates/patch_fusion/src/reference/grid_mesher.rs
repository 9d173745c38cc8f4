//! Depth-grid mesher: one patch per world grid cell.
//!
//! Depth samples on a pixel lattice are back-projected, every lattice quad
//! without an occlusion edge becomes two triangles, and each triangle goes to
//! the cell containing its centroid. A cell without a patch yields a new
//! patch; a cell whose patch lacks some of the triangles yields grown
//! geometry. Triangles are matched by quantized centroid, which keeps
//! re-meshing the same frame a no-op.

use std::collections::{BTreeMap, HashMap, HashSet};

use glam::Vec3;

use crate::config::GridMesherConfig;
use crate::dataset::Frame;
use crate::graph::{PatchId, PatchView};
use crate::types::{Calibration, PatchGeometry, Pose, Vertex};
use crate::updater::{Mesher, MesherOutput, NeighborRef, Neighborhood, NewPatch, PatchUpdate};

type Cell = [i32; 3];
type Triangle = [Vec3; 3];

/// Centroid quantization step (metres).
const CENTROID_QUANTUM: f32 = 1e-3;

pub struct GridMesher {
  config: GridMesherConfig,
}

impl GridMesher {
  pub fn new(config: GridMesherConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &GridMesherConfig {
    &self.config
  }

  fn cell_of(&self, point: Vec3) -> Cell {
    let cell = (point / self.config.cell_size).floor();
    [cell.x as i32, cell.y as i32, cell.z as i32]
  }

  /// Cell a patch belongs to: the cell of its first triangle.
  fn cell_of_geometry(&self, geometry: &PatchGeometry) -> Option<Cell> {
    triangles_of(geometry).next().map(|triangle| self.cell_of(centroid(&triangle)))
  }

  /// Back-project the depth lattice and bucket triangles by cell.
  fn triangulate(&self, frame: &Frame, pose: &Pose, calibration: &Calibration) -> BTreeMap<Cell, Vec<Triangle>> {
    let stride = self.config.pixel_stride.max(1) as usize;
    let depth = &frame.depth;
    let us: Vec<u32> = (0..depth.width()).step_by(stride).collect();
    let vs: Vec<u32> = (0..depth.height()).step_by(stride).collect();

    let samples: Vec<Option<(Vec3, f32)>> = vs
      .iter()
      .flat_map(|v| us.iter().map(move |u| (*u, *v)))
      .map(|(u, v)| {
        let d = depth.metres(u, v);
        (d > 0.0 && d <= self.config.max_depth).then(|| {
          let camera = calibration.depth.unproject(u as f32, v as f32, d);
          (pose.transform_point3(camera), d)
        })
      })
      .collect();

    let mut cells: BTreeMap<Cell, Vec<Triangle>> = BTreeMap::new();
    let row = us.len();
    for j in 0..vs.len().saturating_sub(1) {
      for i in 0..row.saturating_sub(1) {
        let corners = [
          samples[j * row + i],
          samples[j * row + i + 1],
          samples[(j + 1) * row + i],
          samples[(j + 1) * row + i + 1],
        ];
        let [Some(p00), Some(p10), Some(p01), Some(p11)] = corners else {
          continue;
        };

        let depths = [p00.1, p10.1, p01.1, p11.1];
        let near = depths.iter().copied().fold(f32::INFINITY, f32::min);
        let far = depths.iter().copied().fold(0.0, f32::max);
        if far - near > self.config.max_depth_jump * near {
          continue;
        }

        for triangle in [[p00.0, p01.0, p10.0], [p10.0, p01.0, p11.0]] {
          cells.entry(self.cell_of(centroid(&triangle))).or_default().push(triangle);
        }
      }
    }
    cells
  }
}

impl Mesher for GridMesher {
  fn mesh(
    &mut self,
    frame: &Frame,
    pose: &Pose,
    calibration: &Calibration,
    neighborhood: &Neighborhood,
  ) -> MesherOutput {
    let _span = tracing::debug_span!("grid_mesh", frame = frame.index).entered();

    let mut existing: HashMap<Cell, &PatchView> = HashMap::new();
    for view in &neighborhood.patches {
      if let Some(cell) = self.cell_of_geometry(&view.geometry) {
        existing.insert(cell, view);
      }
    }

    // Triangles not yet covered, per cell
    let mut fresh: BTreeMap<Cell, Vec<Triangle>> = BTreeMap::new();
    for (cell, triangles) in self.triangulate(frame, pose, calibration) {
      let mut seen: HashSet<[i64; 3]> = existing
        .get(&cell)
        .map(|view| triangles_of(&view.geometry).map(|t| quantize(centroid(&t))).collect())
        .unwrap_or_default();
      let added: Vec<Triangle> = triangles
        .into_iter()
        .filter(|triangle| seen.insert(quantize(centroid(triangle))))
        .collect();
      if !added.is_empty() {
        fresh.insert(cell, added);
      }
    }

    let new_cells: Vec<Cell> = fresh.keys().filter(|cell| !existing.contains_key(*cell)).copied().collect();
    let new_index: HashMap<Cell, usize> = new_cells.iter().enumerate().map(|(i, cell)| (*cell, i)).collect();

    let neighbors_of = |cell: Cell, known: &[PatchId]| -> Vec<NeighborRef> {
      adjacent_cells(cell)
        .filter_map(|other| {
          if let Some(index) = new_index.get(&other) {
            Some(NeighborRef::New(*index))
          } else {
            existing
              .get(&other)
              .filter(|view| !known.contains(&view.id))
              .map(|view| NeighborRef::Existing(view.id))
          }
        })
        .collect()
    };

    let mut output = MesherOutput::default();
    for cell in &new_cells {
      output.new_patches.push(NewPatch {
        geometry: geometry_from(&[], &fresh[cell]),
        neighbors: neighbors_of(*cell, &[]),
      });
    }
    for (cell, added) in &fresh {
      let Some(view) = existing.get(cell) else {
        continue;
      };
      output.updated_patches.push(PatchUpdate {
        id: view.id,
        geometry: geometry_from(&triangles_of(&view.geometry).collect::<Vec<_>>(), added),
        new_neighbors: neighbors_of(*cell, view.neighbors.as_slice()),
      });
    }

    tracing::debug!(
      new = output.new_patches.len(),
      grown = output.updated_patches.len(),
      "grid mesher output"
    );
    output
  }
}

fn centroid(triangle: &Triangle) -> Vec3 {
  (triangle[0] + triangle[1] + triangle[2]) / 3.0
}

fn quantize(point: Vec3) -> [i64; 3] {
  let q = (point / CENTROID_QUANTUM).round();
  [q.x as i64, q.y as i64, q.z as i64]
}

fn adjacent_cells(cell: Cell) -> impl Iterator<Item = Cell> {
  (-1..=1).flat_map(move |dz| {
    (-1..=1).flat_map(move |dy| {
      (-1..=1)
        .filter(move |dx| (*dx, dy, dz) != (0, 0, 0))
        .map(move |dx| [cell[0] + dx, cell[1] + dy, cell[2] + dz])
    })
  })
}

fn triangles_of(geometry: &PatchGeometry) -> impl Iterator<Item = Triangle> + '_ {
  geometry.indices.chunks_exact(3).filter_map(|chunk| {
    let corner = |i: u32| geometry.vertices.get(i as usize).map(|v| Vec3::from_array(v.position));
    Some([corner(chunk[0])?, corner(chunk[1])?, corner(chunk[2])?])
  })
}

/// Unshared-vertex geometry with flat normals.
fn geometry_from(existing: &[Triangle], added: &[Triangle]) -> PatchGeometry {
  let count = existing.len() + added.len();
  let mut vertices = Vec::with_capacity(count * 3);
  for triangle in existing.iter().chain(added) {
    let normal = (triangle[1] - triangle[0]).cross(triangle[2] - triangle[0]).normalize_or_zero();
    for corner in triangle {
      vertices.push(Vertex::new(corner.to_array(), normal.to_array()));
    }
  }
  let indices = (0..vertices.len() as u32).collect();
  PatchGeometry::new(vertices, indices)
}

#[cfg(test)]
#[path = "grid_mesher_test.rs"]
mod grid_mesher_test;
