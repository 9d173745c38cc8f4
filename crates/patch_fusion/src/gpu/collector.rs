//! Garbage collector contract.
//!
//! Storage notifies the collector whenever a handle's reference count drops
//! to zero; the collector decides when those slots are actually reclaimed.
//! One collector belongs to one reconstruction session and is handed to the
//! storage at construction.

use crossbeam_channel::{self as channel, Receiver, Sender};

use super::GpuHandle;

/// Receives zero-refcount notifications and hands them back in batches.
pub trait GarbageCollector: Send + Sync {
  /// Called by storage (outside any slot lock) when `handle` reached zero.
  fn notify_zero_refcount(&self, handle: GpuHandle);

  /// Handles the collector wants reclaimed now. Storage re-checks each one
  /// before freeing, so stale entries are harmless.
  fn drain(&self) -> Vec<GpuHandle>;

  /// Number of notifications not yet drained.
  fn pending(&self) -> usize;
}

/// Queues notifications and releases them once `min_batch` have gathered.
pub struct DeferredCollector {
  sender: Sender<GpuHandle>,
  receiver: Receiver<GpuHandle>,
  min_batch: usize,
}

impl DeferredCollector {
  /// Reclaim on every collection pass.
  pub fn new() -> Self {
    Self::with_min_batch(1)
  }

  /// Hold notifications until at least `min_batch` are queued.
  pub fn with_min_batch(min_batch: usize) -> Self {
    let (sender, receiver) = channel::unbounded();
    Self {
      sender,
      receiver,
      min_batch: min_batch.max(1),
    }
  }
}

impl Default for DeferredCollector {
  fn default() -> Self {
    Self::new()
  }
}

impl GarbageCollector for DeferredCollector {
  fn notify_zero_refcount(&self, handle: GpuHandle) {
    // Receiver lives as long as self, so send cannot fail
    let _ = self.sender.send(handle);
  }

  fn drain(&self) -> Vec<GpuHandle> {
    if self.receiver.len() < self.min_batch {
      return Vec::new();
    }
    self.receiver.try_iter().collect()
  }

  fn pending(&self) -> usize {
    self.receiver.len()
  }
}
