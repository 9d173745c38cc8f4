//! GeometryDevice - upload seam between storage and the graphics backend.
//!
//! Storage decides *which* slot holds what; the device only copies bytes.
//! Renderer internals live behind this trait so the core never depends on a
//! specific graphics API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::graph::PatchId;
use crate::types::MinMaxAABB;

/// Error reported by a device write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DeviceError(pub String);

/// Lightweight per-patch metadata, refreshable without reallocating geometry.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PatchHeader {
  /// Patch id split into low/high words.
  pub id: [u32; 2],
  /// Geometry version the slot holds.
  pub version: u32,
  /// `HEADER_FLAG_*` bits.
  pub flags: u32,
  pub bounds_min: [f32; 4],
  pub bounds_max: [f32; 4],
}

pub const HEADER_FLAG_INCOMPLETE: u32 = 1 << 0;
pub const HEADER_FLAG_ABANDONED: u32 = 1 << 1;

impl PatchHeader {
  pub fn new(id: PatchId, version: u64, flags: u32, bounds: &MinMaxAABB) -> Self {
    let raw = id.raw();
    Self {
      id: [raw as u32, (raw >> 32) as u32],
      version: version as u32,
      flags,
      bounds_min: [bounds.min[0], bounds.min[1], bounds.min[2], 0.0],
      bounds_max: [bounds.max[0], bounds.max[1], bounds.max[2], 0.0],
    }
  }

  pub fn patch_id(&self) -> PatchId {
    PatchId::new(self.id[0] as u64 | ((self.id[1] as u64) << 32))
  }
}

/// Backend receiving slot writes.
///
/// Calls for one slot are serialized by the storage (slot lock held);
/// calls for different slots may arrive concurrently.
pub trait GeometryDevice: Send + Sync {
  /// Copy `bytes` into the backing memory of `slot`. Must be resident when
  /// this returns.
  fn write_slot(&self, slot: u32, bytes: &[u8]) -> Result<(), DeviceError>;

  /// Write the header record associated with `slot`.
  fn write_header(&self, slot: u32, header: &PatchHeader) -> Result<(), DeviceError>;

  /// Slot returned to the free pool; backing memory may be discarded.
  fn free_slot(&self, slot: u32);
}

/// Device keeping slot contents in host memory.
///
/// Used for headless runs and tests. `fail_writes` simulates a device that
/// rejects uploads.
#[derive(Default)]
pub struct HostDevice {
  slots: Mutex<HashMap<u32, Vec<u8>>>,
  headers: Mutex<HashMap<u32, PatchHeader>>,
  uploads: AtomicU64,
  header_writes: AtomicU64,
  fail_writes: AtomicBool,
}

impl HostDevice {
  pub fn new() -> Self {
    Self::default()
  }

  /// Copy of the bytes currently held by `slot`.
  pub fn slot_bytes(&self, slot: u32) -> Option<Vec<u8>> {
    let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots.get(&slot).cloned()
  }

  pub fn header(&self, slot: u32) -> Option<PatchHeader> {
    let headers = self.headers.lock().unwrap_or_else(PoisonError::into_inner);
    headers.get(&slot).copied()
  }

  /// Total number of geometry uploads performed.
  pub fn upload_count(&self) -> u64 {
    self.uploads.load(Ordering::Relaxed)
  }

  pub fn header_write_count(&self) -> u64 {
    self.header_writes.load(Ordering::Relaxed)
  }

  /// Make every subsequent write fail (or succeed again).
  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::Relaxed);
  }
}

impl GeometryDevice for HostDevice {
  fn write_slot(&self, slot: u32, bytes: &[u8]) -> Result<(), DeviceError> {
    if self.fail_writes.load(Ordering::Relaxed) {
      return Err(DeviceError(format!("write to slot {slot} rejected")));
    }
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots.insert(slot, bytes.to_vec());
    self.uploads.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  fn write_header(&self, slot: u32, header: &PatchHeader) -> Result<(), DeviceError> {
    if self.fail_writes.load(Ordering::Relaxed) {
      return Err(DeviceError(format!("header write to slot {slot} rejected")));
    }
    let mut headers = self.headers.lock().unwrap_or_else(PoisonError::into_inner);
    headers.insert(slot, *header);
    self.header_writes.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  fn free_slot(&self, slot: u32) {
    self
      .slots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&slot);
    self
      .headers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&slot);
  }
}
