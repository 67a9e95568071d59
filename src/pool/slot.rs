//! Handles to sample slots

/// Reference to one slot at one generation.
///
/// A handle whose generation no longer matches the slot metadata is stale:
/// the slot was reclaimed and possibly reused since the handle was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub index: u32,
    pub generation: u32,
}

impl SlotRef {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Pack into the 64-bit value stored in queue cells
    pub fn pack(&self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    pub fn unpack(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}
