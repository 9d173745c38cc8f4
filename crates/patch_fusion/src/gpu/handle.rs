//! GPU handle value types.

/// What a slot holds. Used for bookkeeping and draw dispatch only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
  /// Vertex + index buffer of one patch.
  Patch,
  /// Triangle list bridging two patches.
  DoubleStitch,
  /// Triangle list bridging three patches at a corner.
  TripleStitch,
  /// All triple stitches of one active set in a single buffer.
  CoalescedTriples,
}

/// Reference to a resident slot in `GpuGeomStorage`.
///
/// A handle is a plain value: copying it does not keep the slot alive.
/// Lifetime is governed solely by the storage reference count
/// (`retain` / `release`). The generation guards against a handle
/// outliving its slot's reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuHandle {
  slot: u32,
  generation: u32,
  kind: HandleKind,
}

impl GpuHandle {
  pub(crate) fn new(slot: u32, generation: u32, kind: HandleKind) -> Self {
    Self {
      slot,
      generation,
      kind,
    }
  }

  #[inline]
  pub fn slot(&self) -> u32 {
    self.slot
  }

  #[inline]
  pub fn generation(&self) -> u32 {
    self.generation
  }

  #[inline]
  pub fn kind(&self) -> HandleKind {
    self.kind
  }
}

/// Power-of-two byte bucket a slot is allocated for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
  /// Smallest bucket: 256 bytes.
  pub const MIN: Self = Self(8);

  pub const fn from_log2(log2: u8) -> Self {
    Self(log2)
  }

  /// Smallest bucket able to hold `bytes`.
  pub fn for_bytes(bytes: usize) -> Self {
    let log2 = bytes.max(1).next_power_of_two().trailing_zeros() as u8;
    Self(log2.max(Self::MIN.0))
  }

  pub fn log2(&self) -> u8 {
    self.0
  }

  /// Capacity of the bucket in bytes.
  pub fn bytes(&self) -> usize {
    1usize << self.0
  }
}
