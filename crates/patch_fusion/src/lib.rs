//! patch_fusion - Patch-based mesh residency and stitching
//!
//! Incremental dense reconstruction keeps its surface as a graph of small
//! mesh patches. This crate keeps a bounded subset of that graph resident in
//! GPU memory, stitches patch boundaries, and hands consumers immutable
//! snapshots while the producer keeps growing the mesh.
//!
//! # Features
//!
//! - **Patch Graph**: patch arena with neighbor links, versioned geometry,
//!   double/triple stitch records and merge tombstones
//! - **GPU Geometry Storage**: fixed slot pool with per-slot locks, reference
//!   counts and a pluggable garbage collector
//! - **Active Sets**: all-or-nothing snapshots of resident patches and
//!   stitches, released when the last consumer drops them
//! - **Geometry Updater**: per-frame `extend` and frame-less `update` passes
//!   with completeness tracking and publication
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use patch_fusion::{
//!   BoundaryStitcher, DeferredCollector, GeometryUpdater, GpuGeomStorage, GridMesher, HostDevice,
//!   ReconstructionConfig,
//! };
//!
//! let config = ReconstructionConfig::default();
//! let storage = Arc::new(GpuGeomStorage::new(
//!   &config.storage,
//!   Arc::new(HostDevice::new()),
//!   Arc::new(DeferredCollector::new()),
//! ));
//! let mesher = GridMesher::new(config.mesher);
//! let stitcher = BoundaryStitcher::new(config.stitching.max_gap);
//! let mut updater = GeometryUpdater::new(config, calibration, storage, Box::new(mesher), Box::new(stitcher));
//!
//! let report = updater.extend(&frame, &pose)?;
//! if let Some(set) = updater.published() {
//!   set.draw_everything(&mut renderer);
//! }
//! ```

pub mod active_set;
pub mod config;
pub mod dataset;
pub mod error;
pub mod gpu;
pub mod graph;
pub mod metrics;
pub mod types;

// Re-export commonly used items
pub use active_set::{ActiveSet, ActiveSetId, BuildRequest, CompletenessReport, DrawSink, NullSink, Publication};
pub use config::{IncompletePolicy, ReconstructionConfig};
pub use error::{ActiveSetError, ConfigError, FrameSourceError, InvariantViolation, StorageError, UpdateError};
pub use gpu::{DeferredCollector, GarbageCollector, GeometryDevice, GpuGeomStorage, GpuHandle, HostDevice};
pub use graph::{PatchGraph, PatchId, PatchView};
pub use types::{Calibration, Intrinsics, PatchGeometry, Pose, StitchTriangle, Vertex, VertexRef};

// Frame-driven growth and publication
pub mod updater;
pub use updater::{FrameReport, GeometryUpdater, MeshStitcher, Mesher};

// Reference mesher and stitcher
pub mod reference;
pub use reference::{BoundaryStitcher, GridMesher};

// Producer thread
pub mod session;
pub use session::{Session, SessionEvent, SessionSummary};

#[cfg(test)]
pub mod test_utils;
