//! Addresses and half-open address ranges.
//!
//! Addresses, offsets and sizes all share `u64`. Range arithmetic is checked:
//! a range whose end would overflow is rejected rather than wrapped.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A virtual address (or size/offset) in the target's address space.
pub type Address = u64;

/// Half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    /// Build a range from a start and a size; `None` on overflow.
    pub fn new(start: Address, size: u64) -> Option<Self> {
        let end = start.checked_add(size)?;
        Some(Self { start, end })
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Intersection of two ranges, `None` when disjoint.
    pub fn intersect(&self, other: &AddressRange) -> Option<AddressRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(AddressRange { start, end })
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end)
    }
}
