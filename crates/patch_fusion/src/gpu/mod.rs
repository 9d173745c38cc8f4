//! GPU geometry residency.
//!
//! - [`handle`]: `GpuHandle` value type and `SizeClass` buckets
//! - [`storage`]: `GpuGeomStorage`, the reference-counted slot table
//! - [`collector`]: `GarbageCollector` contract and `DeferredCollector`
//! - [`device`]: `GeometryDevice` upload seam and the in-memory `HostDevice`

pub mod collector;
pub mod device;
pub mod handle;
pub mod storage;

pub use collector::{DeferredCollector, GarbageCollector};
pub use device::{
  DeviceError, GeometryDevice, HostDevice, PatchHeader, HEADER_FLAG_ABANDONED,
  HEADER_FLAG_INCOMPLETE,
};
pub use handle::{GpuHandle, HandleKind, SizeClass};
pub use storage::{GpuGeomStorage, StorageStats};
