//! GpuGeomStorage - capacity-bounded, reference-counted slot table.
//!
//! ```text
//!            allocate            retain / release              count == 0
//!   Free ──────────────► Live(n) ◄──────────────────► Live(0) ──────────────► notify collector
//!    ▲                                                   │
//!    └───────────────────── collect_garbage ◄────────────┘
//! ```
//!
//! - `allocate` hands out a handle whose count is 1, owned by the caller.
//! - Only `allocate`, `retain` and `release` change counts.
//! - A slot with count 0 is not reused until the collector has it reclaimed,
//!   and a zero-count slot can never be retained again.
//! - Every slot has its own lock. Operations on different slots proceed in
//!   parallel; garbage collection locks one slot at a time.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::device::{GeometryDevice, PatchHeader};
use super::{GarbageCollector, GpuHandle, HandleKind, SizeClass};
use crate::config::StorageConfig;
use crate::error::StorageError;

#[derive(Debug, Default)]
struct Slot {
  generation: u32,
  live: bool,
  kind: Option<HandleKind>,
  size_class: Option<SizeClass>,
  ref_count: u32,
  uploaded: bool,
  version: u64,
}

impl Slot {
  fn holds(&self, handle: GpuHandle) -> bool {
    self.live && self.generation == handle.generation()
  }
}

/// Snapshot of storage occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
  pub capacity: usize,
  /// Slots holding a handle (including ones awaiting reclaim).
  pub resident: usize,
  pub allocations: u64,
  pub reclaims: u64,
}

/// Finite pool of GPU geometry slots.
pub struct GpuGeomStorage {
  slots: Vec<Mutex<Slot>>,
  free: Mutex<Vec<u32>>,
  max_size_class: SizeClass,
  device: Arc<dyn GeometryDevice>,
  collector: Arc<dyn GarbageCollector>,
  resident: AtomicUsize,
  allocations: AtomicU64,
  reclaims: AtomicU64,
  /// Next active set sequence; sets built over one storage share an order.
  set_sequence: AtomicU64,
}

impl GpuGeomStorage {
  pub fn new(
    config: &StorageConfig,
    device: Arc<dyn GeometryDevice>,
    collector: Arc<dyn GarbageCollector>,
  ) -> Self {
    let slots = (0..config.slot_count).map(|_| Mutex::new(Slot::default())).collect();
    // Stack order: slot 0 is handed out first
    let free = (0..config.slot_count as u32).rev().collect();
    Self {
      slots,
      free: Mutex::new(free),
      max_size_class: config.max_size_class(),
      device,
      collector,
      resident: AtomicUsize::new(0),
      allocations: AtomicU64::new(0),
      reclaims: AtomicU64::new(0),
      set_sequence: AtomicU64::new(1),
    }
  }

  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  pub fn max_size_class(&self) -> SizeClass {
    self.max_size_class
  }

  /// Hand out the next active set sequence number (starting at 1).
  pub(crate) fn next_set_sequence(&self) -> u64 {
    self.set_sequence.fetch_add(1, Ordering::Relaxed)
  }

  /// Slots currently holding a handle.
  pub fn resident_count(&self) -> usize {
    self.resident.load(Ordering::Relaxed)
  }

  pub fn stats(&self) -> StorageStats {
    StorageStats {
      capacity: self.capacity(),
      resident: self.resident_count(),
      allocations: self.allocations.load(Ordering::Relaxed),
      reclaims: self.reclaims.load(Ordering::Relaxed),
    }
  }

  fn lock_slot(&self, slot: u32) -> Option<MutexGuard<'_, Slot>> {
    self
      .slots
      .get(slot as usize)
      .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner))
  }

  fn pop_free(&self) -> Option<u32> {
    self.free.lock().unwrap_or_else(PoisonError::into_inner).pop()
  }

  fn push_free(&self, slot: u32) {
    self.free.lock().unwrap_or_else(PoisonError::into_inner).push(slot);
  }

  /// Allocate a slot for `size_class`. The returned handle has count 1.
  ///
  /// When no slot is free a garbage-collection pass runs and the allocation
  /// is retried once; if that also fails the storage is exhausted.
  pub fn allocate(&self, size_class: SizeClass, kind: HandleKind) -> Result<GpuHandle, StorageError> {
    if size_class > self.max_size_class {
      return Err(StorageError::SizeClassTooLarge {
        requested: size_class,
        max: self.max_size_class,
      });
    }

    let slot = match self.pop_free() {
      Some(slot) => slot,
      None => {
        let reclaimed = self.collect_garbage() + self.reclaim_unreferenced();
        tracing::debug!(reclaimed, "storage full, collected garbage before retry");
        match self.pop_free() {
          Some(slot) => slot,
          None => {
            tracing::error!(capacity = self.capacity(), "geometry storage exhausted");
            return Err(StorageError::Exhausted {
              capacity: self.capacity(),
            });
          }
        }
      }
    };

    let Some(mut guard) = self.lock_slot(slot) else {
      return Err(StorageError::Exhausted {
        capacity: self.capacity(),
      });
    };
    guard.generation = guard.generation.wrapping_add(1);
    guard.live = true;
    guard.kind = Some(kind);
    guard.size_class = Some(size_class);
    guard.ref_count = 1;
    guard.uploaded = false;
    guard.version = 0;
    let handle = GpuHandle::new(slot, guard.generation, kind);
    drop(guard);

    self.resident.fetch_add(1, Ordering::Relaxed);
    self.allocations.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(?handle, "allocated slot");
    Ok(handle)
  }

  /// Increment the count of a live handle.
  pub fn retain(&self, handle: GpuHandle) -> Result<(), StorageError> {
    let mut slot = self.lock_slot(handle.slot()).ok_or(StorageError::StaleHandle(handle))?;
    if !slot.holds(handle) || slot.ref_count == 0 {
      return Err(StorageError::StaleHandle(handle));
    }
    slot.ref_count += 1;
    Ok(())
  }

  /// Decrement the count; at zero the collector is notified.
  pub fn release(&self, handle: GpuHandle) -> Result<(), StorageError> {
    let reached_zero = {
      let mut slot = self.lock_slot(handle.slot()).ok_or(StorageError::StaleHandle(handle))?;
      if !slot.holds(handle) || slot.ref_count == 0 {
        return Err(StorageError::StaleHandle(handle));
      }
      slot.ref_count -= 1;
      slot.ref_count == 0
    };

    if reached_zero {
      self.collector.notify_zero_refcount(handle);
    }
    Ok(())
  }

  /// Copy geometry bytes into the slot of `handle`.
  ///
  /// Fails with `UploadFailure` if the handle was released concurrently.
  pub fn upload(&self, handle: GpuHandle, bytes: &[u8], version: u64) -> Result<(), StorageError> {
    let mut slot = self
      .lock_slot(handle.slot())
      .ok_or(StorageError::UploadFailure(handle))?;
    if !slot.holds(handle) || slot.ref_count == 0 {
      return Err(StorageError::UploadFailure(handle));
    }
    if let Some(class) = slot.size_class {
      if bytes.len() > class.bytes() {
        return Err(StorageError::SizeClassTooLarge {
          requested: SizeClass::for_bytes(bytes.len()),
          max: class,
        });
      }
    }

    self.device.write_slot(handle.slot(), bytes)?;
    slot.uploaded = true;
    slot.version = version;
    Ok(())
  }

  /// Refresh the header record of a live patch handle without touching its
  /// geometry.
  pub fn write_header(&self, handle: GpuHandle, header: &PatchHeader) -> Result<(), StorageError> {
    let slot = self.lock_slot(handle.slot()).ok_or(StorageError::StaleHandle(handle))?;
    if !slot.holds(handle) || slot.ref_count == 0 {
      return Err(StorageError::StaleHandle(handle));
    }
    self.device.write_header(handle.slot(), header)?;
    Ok(())
  }

  /// Current count, or `None` once the slot no longer holds this handle.
  pub fn ref_count(&self, handle: GpuHandle) -> Option<u32> {
    let slot = self.lock_slot(handle.slot())?;
    slot.holds(handle).then_some(slot.ref_count)
  }

  /// True if the slot still belongs to `handle` (possibly awaiting reclaim).
  pub fn is_live(&self, handle: GpuHandle) -> bool {
    self.lock_slot(handle.slot()).is_some_and(|slot| slot.holds(handle))
  }

  /// True if the handle is live, referenced and has received its upload.
  pub fn is_uploaded(&self, handle: GpuHandle) -> bool {
    self
      .lock_slot(handle.slot())
      .is_some_and(|slot| slot.holds(handle) && slot.ref_count > 0 && slot.uploaded)
  }

  /// Version written by the last upload.
  pub fn uploaded_version(&self, handle: GpuHandle) -> Option<u64> {
    let slot = self.lock_slot(handle.slot())?;
    (slot.holds(handle) && slot.uploaded).then_some(slot.version)
  }

  /// Reclaim the slots the collector hands back. Returns the number freed.
  pub fn collect_garbage(&self) -> usize {
    self
      .collector
      .drain()
      .into_iter()
      .filter(|handle| self.reclaim(*handle))
      .count()
  }

  /// Scan every slot and reclaim those with a zero count, regardless of the
  /// collector's batching. Used under allocation pressure.
  pub fn reclaim_unreferenced(&self) -> usize {
    let mut reclaimed = 0;
    for index in 0..self.slots.len() as u32 {
      let handle = {
        let Some(slot) = self.lock_slot(index) else {
          continue;
        };
        if !slot.live || slot.ref_count != 0 {
          continue;
        }
        match slot.kind {
          Some(kind) => GpuHandle::new(index, slot.generation, kind),
          None => continue,
        }
      };
      if self.reclaim(handle) {
        reclaimed += 1;
      }
    }
    reclaimed
  }

  fn reclaim(&self, handle: GpuHandle) -> bool {
    {
      let Some(mut slot) = self.lock_slot(handle.slot()) else {
        return false;
      };
      // Re-check: the slot may have been reclaimed by an earlier pass
      if !slot.holds(handle) || slot.ref_count != 0 {
        return false;
      }
      slot.live = false;
      slot.kind = None;
      slot.size_class = None;
      slot.uploaded = false;
      self.device.free_slot(handle.slot());
    }

    self.push_free(handle.slot());
    self.resident.fetch_sub(1, Ordering::Relaxed);
    self.reclaims.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(?handle, "reclaimed slot");
    true
  }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod storage_test;
