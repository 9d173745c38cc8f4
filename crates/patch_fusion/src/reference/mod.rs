//! Reference collaborators.
//!
//! Simple, deterministic implementations of [`Mesher`](crate::updater::Mesher)
//! and [`MeshStitcher`](crate::updater::MeshStitcher) so the pipeline can run
//! end-to-end on a dataset without an external meshing backend.

mod boundary_stitcher;
mod grid_mesher;

pub use boundary_stitcher::BoundaryStitcher;
pub use grid_mesher::GridMesher;
