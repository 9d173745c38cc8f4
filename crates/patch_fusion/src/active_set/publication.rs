//! Latest-published active set, shared between producer and consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::ActiveSet;

/// Holder of the most recently published active set.
///
/// The producer swaps in a new set; consumers clone the `Arc` and keep using
/// their copy for as long as they like. A consumer never waits on producer
/// work beyond the pointer swap itself.
#[derive(Default)]
pub struct Publication {
  current: RwLock<Option<Arc<ActiveSet>>>,
  published: AtomicU64,
}

impl Publication {
  pub fn new() -> Self {
    Self::default()
  }

  /// Publish `set`, superseding the previous one.
  ///
  /// Publication order follows build order; a set older than the current one
  /// is returned to the caller but not published.
  pub fn publish(&self, set: ActiveSet) -> Arc<ActiveSet> {
    let set = Arc::new(set);
    let superseded = {
      let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
      if current.as_ref().is_some_and(|existing| existing.id() >= set.id()) {
        tracing::warn!(sequence = set.sequence(), "refusing to publish an older active set");
        return set;
      }
      current.replace(set.clone())
    };
    self.published.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
      sequence = set.sequence(),
      name = set.name(),
      patches = set.len(),
      "active set published"
    );
    // The superseded set is released here unless a consumer still holds it
    drop(superseded);
    set
  }

  pub fn latest(&self) -> Option<Arc<ActiveSet>> {
    self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Sequence of the current set (0 before the first publication).
  pub fn sequence(&self) -> u64 {
    self.latest().map_or(0, |set| set.sequence())
  }

  pub fn published_count(&self) -> u64 {
    self.published.load(Ordering::Relaxed)
  }

  /// Drop the current set.
  pub fn clear(&self) {
    let previous = self.current.write().unwrap_or_else(PoisonError::into_inner).take();
    drop(previous);
  }
}
