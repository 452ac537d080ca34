//! Sparse memory maps.
//!
//! `Mem` is the read interface used by the function table decoder (which
//! follows absolute pointers out of its own blob) and by callers browsing raw
//! bytes. Reads are total: unbacked addresses yield an empty slice.

use std::collections::BTreeMap;

use crate::core::address::{Address, AddressRange};

/// A read-only sparse memory map.
pub trait Mem {
    /// Return up to `max` bytes at `addr`.
    ///
    /// The result is shorter than `max` when the backing region ends first,
    /// and empty when `addr` is not backed at all.
    fn data(&self, addr: Address, max: u64) -> &[u8];

    /// Read exactly `len` bytes, or `None` if fewer are backed.
    fn read_exact(&self, addr: Address, len: usize) -> Option<&[u8]> {
        let b = self.data(addr, len as u64);
        (b.len() == len).then_some(b)
    }

    /// Read a little-endian unsigned integer of `size` (1..=8) bytes.
    fn read_uint_le(&self, addr: Address, size: usize) -> Option<u64> {
        let b = self.read_exact(addr, size)?;
        Some(
            b.iter()
                .rev()
                .fold(0u64, |acc, &byte| (acc << 8) | byte as u64),
        )
    }
}

/// A backed region of a memory map: `range` maps to `bytes[offset..]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    pub range: AddressRange,
    pub offset: usize,
}

/// Look up `addr` in regions sorted by start address and slice `backing`.
pub(crate) fn read_regions<'a>(
    regions: &[Region],
    backing: &'a [u8],
    addr: Address,
    max: u64,
) -> &'a [u8] {
    let idx = regions.partition_point(|r| r.range.start <= addr);
    if idx == 0 {
        return &[];
    }
    let r = &regions[idx - 1];
    if !r.range.contains(addr) {
        return &[];
    }
    let avail = r.range.end - addr;
    let take = avail.min(max);
    let start = match usize::try_from(addr - r.range.start)
        .ok()
        .and_then(|d| r.offset.checked_add(d))
    {
        Some(s) => s,
        None => return &[],
    };
    let end = match usize::try_from(take).ok().and_then(|t| start.checked_add(t)) {
        Some(e) => e.min(backing.len()),
        None => backing.len(),
    };
    backing.get(start..end).unwrap_or(&[])
}

/// An owned sparse memory map, built from explicit chunks.
///
/// Used for synthetic objects and tests; overlapping chunks are resolved in
/// favor of the one inserted last.
#[derive(Debug, Clone, Default)]
pub struct SparseMem {
    chunks: BTreeMap<Address, Vec<u8>>,
}

impl SparseMem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `addr`.
    pub fn insert(&mut self, addr: Address, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        let end = addr.saturating_add(bytes.len() as u64);
        // Trim chunks that the new one overlaps.
        let overlapping: Vec<Address> = self
            .chunks
            .range(..end)
            .filter(|(start, b)| start.saturating_add(b.len() as u64) > addr)
            .map(|(start, _)| *start)
            .collect();
        for start in overlapping {
            if let Some(old) = self.chunks.remove(&start) {
                if start < addr {
                    self.chunks
                        .insert(start, old[..(addr - start) as usize].to_vec());
                }
                let old_end = start + old.len() as u64;
                if old_end > end {
                    self.chunks
                        .insert(end, old[(end - start) as usize..].to_vec());
                }
            }
        }
        self.chunks.insert(addr, bytes);
    }
}

impl Mem for SparseMem {
    fn data(&self, addr: Address, max: u64) -> &[u8] {
        let Some((start, bytes)) = self.chunks.range(..=addr).next_back() else {
            return &[];
        };
        let off = addr - start;
        if off >= bytes.len() as u64 {
            return &[];
        }
        let off = off as usize;
        let take = (bytes.len() - off).min(usize::try_from(max).unwrap_or(usize::MAX));
        &bytes[off..off + take]
    }
}

impl<M: Mem + ?Sized> Mem for &M {
    fn data(&self, addr: Address, max: u64) -> &[u8] {
        (**self).data(addr, max)
    }
}
