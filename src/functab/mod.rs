//! Go runtime function table (`pclntab`) decoder.
//!
//! Pinned to the layout identified by the version tag `0xfffffffb`:
//!
//! ```text
//! header   magic u32 | pad u16 (0) | pcquantum u8 | ptrsize u8
//!          nftab uintptr
//! ftab     (nftab + 1) x { entry uintptr, funcoff uintptr }
//! _func    entry uintptr, nameoff i32, args i32, frame i32, pcsp i32,
//!          pcfile i32, pcln i32, npcdata i32, nfuncdata i32,
//!          pcdata [npcdata]u32, (align 8) funcdata [nfuncdata]uintptr
//! ```
//!
//! Offsets are relative to the start of the table. Funcdata entries are
//! absolute addresses of blobs elsewhere in the object and are checked
//! against its memory map. Any other version tag is refused with
//! `UnsupportedVersion`.

pub mod pcvalue;

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::AnalysisConfig;
use crate::core::address::Address;
use crate::core::arch::{Arch, FrameLayout};
use crate::core::mem::Mem;
use crate::error::{ObjlensError, Result};
use crate::formats::Object;
use crate::symbols::SymbolTable;

pub use pcvalue::{PcValueRange, PcValueTable};

/// Version tag of the supported table layout.
pub const PCLNTAB_MAGIC: u32 = 0xffff_fffb;

pub const PCDATA_STACK_MAP_INDEX: usize = 0;
pub const FUNCDATA_ARGS_POINTER_MAPS: usize = 0;
pub const FUNCDATA_LOCALS_POINTER_MAPS: usize = 1;

const HEADER_SIZE: usize = 8;
/// The eight 32-bit fields following `entry` in a `_func`.
const FUNC_FIELDS_SIZE: usize = 8 * 4;

/// One function's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionDescriptor {
    pub entry: Address,
    /// First pc past the function (next table entry).
    pub end: Address,
    pub name: String,
    /// Size of the argument area in bytes.
    pub args: i32,
    /// Declared frame size in bytes.
    pub frame_size: i32,
    /// SP delta at each pc.
    pub pcsp: PcValueTable,
    /// Indexed by `PCDATA_*`; `None` when the table is absent.
    pub pcdata: Vec<Option<PcValueTable>>,
    /// Indexed by `FUNCDATA_*`; absolute addresses, `None` when absent.
    pub funcdata: Vec<Option<Address>>,
    pub frame: FrameLayout,
}

impl FunctionDescriptor {
    pub fn contains(&self, pc: Address) -> bool {
        self.entry <= pc && pc < self.end
    }

    /// Bytes pushed since entry at `pc`, if known.
    pub fn sp_delta(&self, pc: Address) -> Option<i32> {
        self.pcsp.lookup(pc)
    }

    /// Value of pcdata table `table` at `pc`.
    pub fn pcdata_value(&self, table: usize, pc: Address) -> Option<i32> {
        self.pcdata.get(table)?.as_ref()?.lookup(pc)
    }

    pub fn funcdata(&self, index: usize) -> Option<Address> {
        self.funcdata.get(index).copied().flatten()
    }
}

/// Decoded function table, indexed by entry address.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FuncTab {
    pub pc_quantum: u8,
    pub ptr_size: u8,
    funcs: Vec<FunctionDescriptor>,
    #[serde(skip)]
    by_entry: HashMap<Address, usize>,
}

fn malformed(msg: impl Into<String>) -> ObjlensError {
    ObjlensError::MalformedFunctionTable(msg.into())
}

/// Bounds-checked little-endian reads over the table blob.
struct Reader<'a> {
    blob: &'a [u8],
    ptr_size: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&self, off: usize, len: usize) -> Result<&'a [u8]> {
        off.checked_add(len)
            .and_then(|end| self.blob.get(off..end))
            .ok_or_else(|| malformed(format!("read of {} bytes at {:#x} past end of table", len, off)))
    }

    fn u32(&self, off: usize) -> Result<u32> {
        let b = self.bytes(off, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&self, off: usize) -> Result<i32> {
        Ok(self.u32(off)? as i32)
    }

    fn uintptr(&self, off: usize) -> Result<u64> {
        let b = self.bytes(off, self.ptr_size)?;
        let mut buf = [0u8; 8];
        buf[..b.len()].copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn offset(&self, value: u64) -> Result<usize> {
        usize::try_from(value)
            .ok()
            .filter(|&v| v < self.blob.len())
            .ok_or_else(|| malformed(format!("offset {:#x} outside table", value)))
    }

    /// Non-negative `i32` table offset; 0 means absent.
    fn table_offset(&self, value: i32) -> Result<Option<usize>> {
        match value {
            0 => Ok(None),
            v if v < 0 => Err(malformed(format!("negative table offset {}", v))),
            v => self.offset(v as u64).map(Some),
        }
    }

    fn cstring(&self, off: usize) -> Result<String> {
        let rest = self.blob.get(off..).unwrap_or(&[]);
        let len = memchr::memchr(0, rest)
            .ok_or_else(|| malformed(format!("unterminated name at {:#x}", off)))?;
        Ok(String::from_utf8_lossy(&rest[..len]).into_owned())
    }
}

impl FuncTab {
    /// Decode `blob` for `arch`, checking funcdata addresses against `mem`.
    pub fn decode<M: Mem + ?Sized>(blob: &[u8], mem: &M, arch: &Arch) -> Result<Self> {
        if blob.len() < HEADER_SIZE {
            return Err(malformed("table shorter than header"));
        }
        let magic = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        if magic != PCLNTAB_MAGIC {
            return Err(ObjlensError::UnsupportedVersion { found: magic });
        }
        if blob[4] != 0 || blob[5] != 0 {
            return Err(malformed("nonzero header padding"));
        }
        let pc_quantum = blob[6];
        let ptr_size = blob[7];
        if !matches!(pc_quantum, 1 | 2 | 4) || !matches!(ptr_size, 4 | 8) {
            return Err(malformed(format!(
                "bad header quantum {} ptrsize {}",
                pc_quantum, ptr_size
            )));
        }
        if ptr_size != arch.ptr_size || pc_quantum != arch.min_inst_len {
            return Err(malformed(format!(
                "header (quantum {}, ptrsize {}) does not match {}",
                pc_quantum, ptr_size, arch
            )));
        }

        let r = Reader {
            blob,
            ptr_size: ptr_size as usize,
        };
        let ptr = r.ptr_size;
        let nftab = r.uintptr(HEADER_SIZE)?;
        let ftab = HEADER_SIZE + ptr;
        // Each entry takes 2*ptr bytes, so a count larger than the blob is bogus.
        let nftab = usize::try_from(nftab)
            .ok()
            .filter(|&n| n < blob.len() / (2 * ptr))
            .ok_or_else(|| malformed(format!("function count {} exceeds table", nftab)))?;
        r.bytes(ftab, (nftab + 1) * 2 * ptr)?;

        let mut funcs = Vec::with_capacity(nftab);
        let mut by_entry = HashMap::with_capacity(nftab);
        for i in 0..nftab {
            let slot = ftab + i * 2 * ptr;
            let entry = r.uintptr(slot)?;
            let funcoff = r.offset(r.uintptr(slot + ptr)?)?;
            let end = r.uintptr(slot + 2 * ptr)?;
            if end < entry {
                return Err(malformed(format!("function table not sorted at {:#x}", entry)));
            }
            let f = Self::decode_func(&r, funcoff, entry, end, pc_quantum, mem, arch)?;
            trace!(name = %f.name, entry = format_args!("{:#x}", f.entry), "function");
            by_entry.entry(entry).or_insert(funcs.len());
            funcs.push(f);
        }
        debug!(count = funcs.len(), quantum = pc_quantum, ptr_size, "function table decoded");
        Ok(Self {
            pc_quantum,
            ptr_size,
            funcs,
            by_entry,
        })
    }

    fn decode_func<M: Mem + ?Sized>(
        r: &Reader<'_>,
        off: usize,
        entry: Address,
        end: Address,
        quantum: u8,
        mem: &M,
        arch: &Arch,
    ) -> Result<FunctionDescriptor> {
        let ptr = r.ptr_size;
        let func_entry = r.uintptr(off)?;
        if func_entry != entry {
            return Err(malformed(format!(
                "_func at {:#x} has entry {:#x}, table says {:#x}",
                off, func_entry, entry
            )));
        }
        let fields = off + ptr;
        let nameoff = r.i32(fields)?;
        let args = r.i32(fields + 4)?;
        let frame_size = r.i32(fields + 8)?;
        let pcsp = r.i32(fields + 12)?;
        let npcdata = r.i32(fields + 24)?;
        let nfuncdata = r.i32(fields + 28)?;
        if npcdata < 0 || nfuncdata < 0 {
            return Err(malformed(format!("negative pcdata/funcdata count at {:#x}", off)));
        }

        let name = match r.table_offset(nameoff)? {
            Some(o) => r.cstring(o)?,
            None => String::new(),
        };
        let pcsp = match r.table_offset(pcsp)? {
            Some(o) => PcValueTable::decode(r.blob, o, entry, quantum)?,
            None => PcValueTable::default(),
        };

        let pcdata_off = fields + FUNC_FIELDS_SIZE;
        let npcdata = npcdata as usize;
        r.bytes(pcdata_off, npcdata.saturating_mul(4))?;
        let mut pcdata = Vec::with_capacity(npcdata);
        for i in 0..npcdata {
            let table = match r.table_offset(r.i32(pcdata_off + 4 * i)?)? {
                Some(o) => Some(PcValueTable::decode(r.blob, o, entry, quantum)?),
                None => None,
            };
            pcdata.push(table);
        }

        let mut funcdata_off = pcdata_off + 4 * npcdata;
        if ptr == 8 && funcdata_off & 4 != 0 {
            funcdata_off += 4;
        }
        let nfuncdata = nfuncdata as usize;
        r.bytes(funcdata_off, nfuncdata.saturating_mul(ptr))?;
        let mut funcdata = Vec::with_capacity(nfuncdata);
        for i in 0..nfuncdata {
            let addr = r.uintptr(funcdata_off + ptr * i)?;
            if addr == 0 {
                funcdata.push(None);
                continue;
            }
            if mem.data(addr, 1).is_empty() {
                return Err(malformed(format!(
                    "funcdata {} of {} at unmapped address {:#x}",
                    i, name, addr
                )));
            }
            funcdata.push(Some(addr));
        }

        Ok(FunctionDescriptor {
            entry,
            end,
            name,
            args,
            frame_size,
            pcsp,
            pcdata,
            funcdata,
            frame: arch.frame_layout(),
        })
    }

    /// Locate and decode the function table of `obj`.
    ///
    /// The table is found through the first of `config.functab_symbols`
    /// present in `symtab`, then the first of `config.functab_sections`.
    /// Returns `NotPresent` when neither exists.
    pub fn load(obj: &Object, symtab: &SymbolTable, config: &AnalysisConfig) -> Result<Self> {
        let arch = obj
            .info()
            .arch
            .ok_or_else(|| ObjlensError::UnsupportedArchitecture(obj.info().machine.clone()))?;
        let by_symbol = config
            .functab_symbols
            .iter()
            .find_map(|name| symtab.by_name(name));
        let blob = match by_symbol {
            Some(sym) => obj.symbol_data(sym)?,
            None => {
                let section = config
                    .functab_sections
                    .iter()
                    .find_map(|name| obj.section_by_name(name))
                    .ok_or(ObjlensError::NotPresent("function table"))?;
                obj.section_data(section)?
            }
        };
        Self::decode(&blob, obj, arch)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Functions in table (ascending entry) order.
    pub fn funcs(&self) -> &[FunctionDescriptor] {
        &self.funcs
    }

    /// Function starting exactly at `entry`.
    pub fn by_entry(&self, entry: Address) -> Option<&FunctionDescriptor> {
        self.by_entry.get(&entry).map(|&i| &self.funcs[i])
    }

    /// Function whose `[entry, end)` contains `pc`.
    pub fn lookup(&self, pc: Address) -> Option<&FunctionDescriptor> {
        let i = self.funcs.partition_point(|f| f.entry <= pc);
        let f = self.funcs.get(i.checked_sub(1)?)?;
        f.contains(pc).then_some(f)
    }
}
