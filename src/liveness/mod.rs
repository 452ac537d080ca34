//! Stack liveness overlay.
//!
//! A function's funcdata points at two stack maps (locals and args), each a
//! run of equally sized bitmaps:
//!
//! ```text
//! n i32 | nbit i32 | n x ceil(nbit/8) bytes
//! ```
//!
//! The stack map index pcdata table selects the bitmap in effect at each pc.
//! Bitmaps are decoded once per distinct index and referenced from the
//! instructions that use them. Slot ranges are reported relative to SP at the
//! instruction, from its SP delta and the frame layout.

pub mod bitmap;

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::core::address::Address;
use crate::core::arch::FrameLayout;
use crate::core::instruction::Instruction;
use crate::core::mem::Mem;
use crate::error::{ObjlensError, Result};
use crate::functab::{
    FunctionDescriptor, FUNCDATA_ARGS_POINTER_MAPS, FUNCDATA_LOCALS_POINTER_MAPS,
    PCDATA_STACK_MAP_INDEX,
};

pub use bitmap::LivenessBitmap;

/// One stack map blob, read from the object's memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMap {
    pub addr: Address,
    pub n: usize,
    pub nbit: usize,
    data: Vec<u8>,
}

impl StackMap {
    pub fn read<M: Mem + ?Sized>(mem: &M, addr: Address) -> Result<Self> {
        let header = mem
            .read_exact(addr, 8)
            .ok_or_else(|| ObjlensError::MalformedBitmap(format!("stack map at {:#x} not mapped", addr)))?;
        let n = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let nbit = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let (n, nbit) = match (usize::try_from(n), usize::try_from(nbit)) {
            (Ok(n), Ok(nbit)) => (n, nbit),
            _ => {
                return Err(ObjlensError::MalformedBitmap(format!(
                    "stack map at {:#x} has negative size ({}, {})",
                    addr, n, nbit
                )))
            }
        };
        let len = n
            .checked_mul(nbit.div_ceil(8))
            .ok_or_else(|| ObjlensError::MalformedBitmap(format!("stack map at {:#x} too large", addr)))?;
        let data = mem
            .read_exact(addr + 8, len)
            .ok_or_else(|| ObjlensError::MalformedBitmap(format!("stack map at {:#x} truncated", addr)))?
            .to_vec();
        trace!(addr = format_args!("{:#x}", addr), n, nbit, "stack map");
        Ok(Self { addr, n, nbit, data })
    }

    /// Decode bitmap `index`.
    pub fn get(&self, index: usize) -> Result<LivenessBitmap> {
        if index >= self.n {
            return Err(ObjlensError::IndexOutOfRange {
                index,
                len: self.n,
            });
        }
        let size = self.nbit.div_ceil(8);
        let start = index * size;
        LivenessBitmap::new(self.nbit, self.data[start..start + size].to_vec())
    }
}

/// `[start, end)` in bytes relative to SP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotRange {
    pub start: i64,
    pub end: i64,
}

impl SlotRange {
    pub fn contains(&self, off: i64) -> bool {
        self.start <= off && off < self.end
    }
}

/// Regions covered by the locals and args bitmaps at one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameRanges {
    pub locals: SlotRange,
    pub args: SlotRange,
}

/// Place the bitmaps in the frame for an SP delta of `sp_delta`.
///
/// `None` when the delta is unknown or there is no frame (`<= 0`).
pub fn align(
    sp_delta: Option<i32>,
    frame: &FrameLayout,
    ptr_size: u8,
    locals_nbit: usize,
    args_nbit: usize,
) -> Option<FrameRanges> {
    let s = i64::from(sp_delta.filter(|&s| s > 0)?);
    let ptr = i64::from(ptr_size);
    let varp = s + frame.varp_delta;
    let argp = s + frame.argp_delta;
    Some(FrameRanges {
        locals: SlotRange {
            start: varp - locals_nbit as i64 * ptr,
            end: varp,
        },
        args: SlotRange {
            start: argp,
            end: argp + args_nbit as i64 * ptr,
        },
    })
}

/// Bitmaps selected by one stack map index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedBitmaps {
    pub index: usize,
    pub locals: Option<LivenessBitmap>,
    pub args: Option<LivenessBitmap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstLiveness {
    pub pc: Address,
    pub sp_delta: Option<i32>,
    /// Position in `Liveness::bitmaps`.
    pub bitmaps: Option<usize>,
    /// Absent when the instruction has no frame or no bitmaps.
    pub ranges: Option<FrameRanges>,
}

/// Which region a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotRegion {
    Locals,
    Args,
}

/// One pointer slot: SP-relative offset and whether it is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub region: SlotRegion,
    pub offset: i64,
    pub live: bool,
}

/// Per-instruction liveness of one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Liveness {
    pub ptr_size: u8,
    pub frame: FrameLayout,
    pub bitmaps: Vec<IndexedBitmaps>,
    pub insts: Vec<InstLiveness>,
}

impl Liveness {
    /// Overlay `func`'s stack maps on `insts`.
    pub fn compute<M: Mem + ?Sized>(
        func: &FunctionDescriptor,
        insts: &[Instruction],
        mem: &M,
        ptr_size: u8,
    ) -> Result<Self> {
        let locals = func
            .funcdata(FUNCDATA_LOCALS_POINTER_MAPS)
            .map(|a| StackMap::read(mem, a))
            .transpose()?;
        let args = func
            .funcdata(FUNCDATA_ARGS_POINTER_MAPS)
            .map(|a| StackMap::read(mem, a))
            .transpose()?;

        let lookup = |map: &Option<StackMap>, index: usize| -> Result<Option<LivenessBitmap>> {
            match map {
                Some(m) => m.get(index).map(Some).map_err(|e| match e {
                    ObjlensError::IndexOutOfRange { index, len } => ObjlensError::MalformedBitmap(
                        format!("stack map index {} past {} bitmaps at {:#x}", index, len, m.addr),
                    ),
                    other => other,
                }),
                None => Ok(None),
            }
        };

        let mut bitmaps = Vec::new();
        let mut seen: HashMap<usize, usize> = HashMap::new();
        let mut out = Vec::with_capacity(insts.len());
        for inst in insts {
            let pc = inst.pc;
            if !func.contains(pc) {
                out.push(InstLiveness {
                    pc,
                    sp_delta: None,
                    bitmaps: None,
                    ranges: None,
                });
                continue;
            }
            let sp_delta = func.sp_delta(pc);
            let index = func
                .pcdata_value(PCDATA_STACK_MAP_INDEX, pc)
                .and_then(|i| usize::try_from(i).ok());
            let pos = match index {
                Some(i) => match seen.get(&i) {
                    Some(&p) => Some(p),
                    None => {
                        bitmaps.push(IndexedBitmaps {
                            index: i,
                            locals: lookup(&locals, i)?,
                            args: lookup(&args, i)?,
                        });
                        seen.insert(i, bitmaps.len() - 1);
                        Some(bitmaps.len() - 1)
                    }
                },
                None => None,
            };
            let ranges = pos.and_then(|p| {
                let b = &bitmaps[p];
                align(
                    sp_delta,
                    &func.frame,
                    ptr_size,
                    b.locals.as_ref().map_or(0, |m| m.len()),
                    b.args.as_ref().map_or(0, |m| m.len()),
                )
            });
            out.push(InstLiveness {
                pc,
                sp_delta,
                bitmaps: pos,
                ranges,
            });
        }
        debug!(
            func = %func.name,
            insts = out.len(),
            bitmaps = bitmaps.len(),
            "liveness decoded"
        );
        Ok(Self {
            ptr_size,
            frame: func.frame,
            bitmaps,
            insts: out,
        })
    }

    /// Address-to-live-flag table for instruction `i`; empty without data.
    pub fn slots(&self, i: usize) -> Result<Vec<Slot>> {
        let inst = self.insts.get(i).ok_or(ObjlensError::IndexOutOfRange {
            index: i,
            len: self.insts.len(),
        })?;
        let (Some(ranges), Some(pos)) = (inst.ranges, inst.bitmaps) else {
            return Ok(Vec::new());
        };
        let b = &self.bitmaps[pos];
        let ptr = i64::from(self.ptr_size);
        let mut out = Vec::new();
        for (region, bitmap, base) in [
            (SlotRegion::Locals, &b.locals, ranges.locals.start),
            (SlotRegion::Args, &b.args, ranges.args.start),
        ] {
            if let Some(bitmap) = bitmap {
                out.extend(bitmap.iter().enumerate().map(|(k, live)| Slot {
                    region,
                    offset: base + k as i64 * ptr,
                    live,
                }));
            }
        }
        Ok(out)
    }

    /// Instructions that have a liveness range.
    pub fn covered(&self) -> usize {
        self.insts.iter().filter(|i| i.ranges.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arch::AMD64;
    use crate::core::instruction::Control;
    use crate::core::mem::SparseMem;
    use crate::functab::{PcValueRange, PcValueTable};

    fn stack_map(n: i32, nbit: i32, bits: &[u8]) -> Vec<u8> {
        let mut v = n.to_le_bytes().to_vec();
        v.extend_from_slice(&nbit.to_le_bytes());
        v.extend_from_slice(bits);
        v
    }

    fn table(ranges: &[(u64, u64, i32)]) -> PcValueTable {
        PcValueTable::from_ranges(
            ranges
                .iter()
                .map(|&(start, end, value)| PcValueRange { start, end, value })
                .collect(),
        )
    }

    fn nop(pc: Address) -> Instruction {
        Instruction {
            pc,
            len: 4,
            bytes: vec![0; 4],
            op: "nop".into(),
            args: vec![],
            operands: vec![],
            control: Control::NONE,
            effects: Default::default(),
        }
    }

    /// Function at 0x1000..0x1010: SP delta 0 then 24; stack map index -1,
    /// then 0, then 1.
    fn func() -> FunctionDescriptor {
        FunctionDescriptor {
            entry: 0x1000,
            end: 0x1010,
            name: "main.f".into(),
            args: 16,
            frame_size: 16,
            pcsp: table(&[(0x1000, 0x1004, 0), (0x1004, 0x1010, 24)]),
            pcdata: vec![Some(table(&[
                (0x1000, 0x1004, -1),
                (0x1004, 0x100c, 0),
                (0x100c, 0x1010, 1),
            ]))],
            funcdata: vec![Some(0x2000), Some(0x3000)],
            frame: AMD64.frame_layout(),
        }
    }

    fn mem() -> SparseMem {
        let mut m = SparseMem::new();
        // args: 2 bitmaps of 2 bits
        m.insert(0x2000, stack_map(2, 2, &[0b01, 0b11]));
        // locals: 2 bitmaps of 2 bits
        m.insert(0x3000, stack_map(2, 2, &[0b10, 0b00]));
        m
    }

    #[test]
    fn test_alignment_model() {
        let frame = AMD64.frame_layout();
        assert_eq!(align(None, &frame, 8, 2, 2), None);
        assert_eq!(align(Some(0), &frame, 8, 2, 2), None);
        assert_eq!(align(Some(-8), &frame, 8, 2, 2), None);
        let r = align(Some(24), &frame, 8, 2, 1).unwrap();
        assert_eq!(r.locals, SlotRange { start: 0, end: 16 });
        assert_eq!(r.args, SlotRange { start: 32, end: 40 });
        assert!(r.args.contains(32));
        assert!(!r.locals.contains(16));
    }

    #[test]
    fn test_stack_map_reads() {
        let m = StackMap::read(&mem(), 0x2000).unwrap();
        assert_eq!((m.n, m.nbit), (2, 2));
        assert_eq!(m.get(1).unwrap().to_string(), "2:03");
        assert!(matches!(
            m.get(2),
            Err(ObjlensError::IndexOutOfRange { index: 2, len: 2 })
        ));
        assert!(matches!(
            StackMap::read(&mem(), 0x4000),
            Err(ObjlensError::MalformedBitmap(_))
        ));
        let mut short = SparseMem::new();
        short.insert(0x10, stack_map(4, 8, &[0xff]));
        assert!(StackMap::read(&short, 0x10).is_err());
        let mut negative = SparseMem::new();
        negative.insert(0x10, stack_map(-1, 8, &[]));
        assert!(StackMap::read(&negative, 0x10).is_err());
    }

    #[test]
    fn test_overlay_per_instruction() {
        let insts: Vec<Instruction> = (0..5).map(|i| nop(0x1000 + 4 * i)).collect();
        let l = Liveness::compute(&func(), &insts, &mem(), 8).unwrap();
        assert_eq!(l.insts.len(), 5);
        // Entry: no frame, no index.
        assert_eq!(l.insts[0].ranges, None);
        assert_eq!(l.insts[0].bitmaps, None);
        // Two instructions share index 0; decoded once.
        assert_eq!(l.insts[1].bitmaps, Some(0));
        assert_eq!(l.insts[2].bitmaps, Some(0));
        assert_eq!(l.insts[3].bitmaps, Some(1));
        assert_eq!(l.bitmaps.len(), 2);
        assert_eq!(l.bitmaps[1].index, 1);
        // Past the function end.
        assert_eq!(l.insts[4].sp_delta, None);
        assert_eq!(l.covered(), 3);

        let slots = l.slots(1).unwrap();
        assert_eq!(
            slots,
            vec![
                Slot { region: SlotRegion::Locals, offset: 0, live: false },
                Slot { region: SlotRegion::Locals, offset: 8, live: true },
                Slot { region: SlotRegion::Args, offset: 32, live: true },
                Slot { region: SlotRegion::Args, offset: 40, live: false },
            ]
        );
        assert!(l.slots(0).unwrap().is_empty());
        assert!(matches!(l.slots(9), Err(ObjlensError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_bad_index_is_malformed() {
        let mut f = func();
        f.pcdata = vec![Some(table(&[(0x1000, 0x1010, 7)]))];
        let insts = vec![nop(0x1000)];
        assert!(matches!(
            Liveness::compute(&f, &insts, &mem(), 8),
            Err(ObjlensError::MalformedBitmap(_))
        ));
    }
}
