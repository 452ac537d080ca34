//! PC-value tables.
//!
//! A table maps pc ranges of one function to an `i32` (SP delta, stack map
//! index, ...). Encoded as pairs of uvarints: a zig-zag value delta followed
//! by a pc delta in units of the pc quantum. The value starts at -1 and the pc
//! at the function entry; a zero value delta after the first pair ends the
//! table.

use serde::Serialize;

use crate::core::address::Address;
use crate::error::{ObjlensError, Result};

/// `[start, end)` has `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PcValueRange {
    pub start: Address,
    pub end: Address,
    pub value: i32,
}

/// A decoded pc-value table, ranges ascending and contiguous.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PcValueTable {
    ranges: Vec<PcValueRange>,
}

/// Read an unsigned LEB128 varint at `*pos`, advancing it.
pub(crate) fn read_uvarint(data: &[u8], pos: &mut usize) -> Result<u32> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    loop {
        let b = *data
            .get(*pos)
            .ok_or_else(|| ObjlensError::MalformedFunctionTable(format!("truncated varint at {:#x}", *pos)))?;
        *pos += 1;
        if shift >= 32 {
            return Err(ObjlensError::MalformedFunctionTable(format!(
                "varint overflow at {:#x}",
                *pos
            )));
        }
        value |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn zigzag(u: u32) -> i32 {
    if u & 1 != 0 {
        -((u >> 1) as i32) - 1
    } else {
        (u >> 1) as i32
    }
}

impl PcValueTable {
    /// Decode the table at `off` within `blob` for a function starting at `entry`.
    pub fn decode(blob: &[u8], off: usize, entry: Address, quantum: u8) -> Result<Self> {
        let mut pos = off;
        let mut pc = entry;
        let mut value: i32 = -1;
        let mut ranges = Vec::new();
        loop {
            let uvdelta = read_uvarint(blob, &mut pos)?;
            if uvdelta == 0 && !ranges.is_empty() {
                break;
            }
            let pcdelta = read_uvarint(blob, &mut pos)?;
            value = value.wrapping_add(zigzag(uvdelta));
            let end = pc
                .checked_add(u64::from(pcdelta) * u64::from(quantum))
                .ok_or_else(|| ObjlensError::MalformedFunctionTable(format!("pc overflow in table at {:#x}", off)))?;
            ranges.push(PcValueRange {
                start: pc,
                end,
                value,
            });
            pc = end;
        }
        Ok(Self { ranges })
    }

    /// Table from already-decoded ranges (ascending, non-overlapping).
    pub fn from_ranges(ranges: Vec<PcValueRange>) -> Self {
        Self { ranges }
    }

    /// Value in effect at `pc`, if the table covers it.
    pub fn lookup(&self, pc: Address) -> Option<i32> {
        let i = self.ranges.partition_point(|r| r.end <= pc);
        self.ranges
            .get(i)
            .filter(|r| r.start <= pc)
            .map(|r| r.value)
    }

    pub fn ranges(&self) -> &[PcValueRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag_decoding() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(1), -1);
        assert_eq!(zigzag(2), 1);
        assert_eq!(zigzag(3), -2);
        assert_eq!(zigzag(16), 8);
    }

    #[test]
    fn test_uvarint_multi_byte() {
        let mut pos = 0;
        assert_eq!(read_uvarint(&[0xac, 0x02], &mut pos).unwrap(), 300);
        assert_eq!(pos, 2);
        let mut pos = 0;
        assert!(read_uvarint(&[0x80], &mut pos).is_err());
    }

    #[test]
    fn test_decode_sp_deltas() {
        // -1 -> 0 for 4 bytes, +8 for 10 bytes, -8 for 1 byte, end.
        let blob = [0x02, 0x04, 0x10, 0x0a, 0x0f, 0x01, 0x00];
        let t = PcValueTable::decode(&blob, 0, 0x1000, 1).unwrap();
        assert_eq!(t.ranges().len(), 3);
        assert_eq!(t.lookup(0x1000), Some(0));
        assert_eq!(t.lookup(0x1003), Some(0));
        assert_eq!(t.lookup(0x1004), Some(8));
        assert_eq!(t.lookup(0x100d), Some(8));
        assert_eq!(t.lookup(0x100e), Some(0));
        assert_eq!(t.lookup(0x100f), None);
        assert_eq!(t.lookup(0xfff), None);
    }

    #[test]
    fn test_quantum_scales_pc() {
        let blob = [0x02, 0x02, 0x00];
        let t = PcValueTable::decode(&blob, 0, 0x40, 4).unwrap();
        assert_eq!(t.ranges()[0].end, 0x48);
    }

    #[test]
    fn test_truncated_table() {
        assert!(matches!(
            PcValueTable::decode(&[0x02], 0, 0, 1),
            Err(ObjlensError::MalformedFunctionTable(_))
        ));
    }
}
