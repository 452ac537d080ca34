//! Synthetic fixtures shared by the integration tests.
//!
//! Minimal ELF64 (x86-64) and PE32+ writers plus a builder for the Go
//! function table, so tests never depend on sample binaries.

#![allow(dead_code)]

use std::io::Write;

use tempfile::NamedTempFile;

/// `cmp rdi, rsi; jne +4; mov rax, rdi; ret; mov rax, rsi; ret`
pub const FOO_CODE: [u8; 13] = [
    0x48, 0x39, 0xf7, 0x75, 0x04, 0x48, 0x89, 0xf8, 0xc3, 0x48, 0x89, 0xf0, 0xc3,
];

/// `sub rsp, 0x18; nop; add rsp, 0x18; ret`
pub const BAR_CODE: [u8; 10] = [0x48, 0x83, 0xec, 0x18, 0x90, 0x48, 0x83, 0xc4, 0x18, 0xc3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Data,
    ReadOnly,
    /// Zero-initialised, of the given size.
    Bss(u64),
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub data: Vec<u8>,
    pub kind: SectionKind,
}

impl Section {
    pub fn new(name: &str, addr: u64, kind: SectionKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            addr,
            data: data.into(),
            kind,
        }
    }

    fn mem_size(&self) -> u64 {
        match self.kind {
            SectionKind::Bss(n) => n,
            _ => self.data.len() as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sym {
    pub name: String,
    pub value: u64,
    pub size: u64,
    /// Index into the section list (0-based).
    pub section: usize,
    pub local: bool,
}

impl Sym {
    pub fn new(name: &str, value: u64, size: u64, section: usize) -> Self {
        Self {
            name: name.to_string(),
            value,
            size,
            section,
            local: false,
        }
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }
}

fn align(v: &mut Vec<u8>, to: usize) {
    while v.len() % to != 0 {
        v.push(0);
    }
}

fn put16(v: &mut Vec<u8>, x: u16) {
    v.extend_from_slice(&x.to_le_bytes());
}

fn put32(v: &mut Vec<u8>, x: u32) {
    v.extend_from_slice(&x.to_le_bytes());
}

fn put64(v: &mut Vec<u8>, x: u64) {
    v.extend_from_slice(&x.to_le_bytes());
}

/// String table with a leading NUL; returns offsets of `names`.
fn strtab(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut tab = vec![0u8];
    let mut offs = Vec::new();
    for n in names {
        offs.push(tab.len() as u32);
        tab.extend_from_slice(n.as_bytes());
        tab.push(0);
    }
    (tab, offs)
}

/// A little-endian ELF64 x86-64 executable with one `PT_LOAD` per
/// allocated, file-backed section and a `.symtab`.
pub fn elf64(sections: &[Section], syms: &[Sym], entry: u64) -> Vec<u8> {
    elf64_image(sections, syms, entry, false)
}

/// Like [`elf64`] but stripped: symbols live in `.dynsym`/`.dynstr` and
/// there is no `.symtab`.
pub fn elf64_dynamic(sections: &[Section], syms: &[Sym], entry: u64) -> Vec<u8> {
    elf64_image(sections, syms, entry, true)
}

fn elf64_image(sections: &[Section], syms: &[Sym], entry: u64, dynamic: bool) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    const SHDR: usize = 64;
    let loads: Vec<usize> = (0..sections.len())
        .filter(|&i| !matches!(sections[i].kind, SectionKind::Bss(_)))
        .collect();

    let mut out = vec![0u8; EHDR + PHDR * loads.len()];
    let mut offsets = Vec::new();
    for s in sections {
        align(&mut out, 16);
        offsets.push(out.len() as u64);
        if !matches!(s.kind, SectionKind::Bss(_)) {
            out.extend_from_slice(&s.data);
        }
    }

    // Locals first, as ELF requires.
    let mut ordered: Vec<&Sym> = syms.iter().filter(|s| s.local).collect();
    let nlocal = ordered.len();
    ordered.extend(syms.iter().filter(|s| !s.local));
    let (str_data, str_offs) = strtab(&ordered.iter().map(|s| s.name.as_str()).collect::<Vec<_>>());
    align(&mut out, 8);
    let symtab_off = out.len() as u64;
    out.extend_from_slice(&[0u8; 24]);
    for (s, &name) in ordered.iter().zip(&str_offs) {
        let bind: u8 = if s.local { 0 } else { 1 };
        let typ: u8 = match sections[s.section].kind {
            SectionKind::Text => 2,
            _ => 1,
        };
        put32(&mut out, name);
        out.push(bind << 4 | typ);
        out.push(0);
        put16(&mut out, (s.section + 1) as u16);
        put64(&mut out, s.value);
        put64(&mut out, s.size);
    }
    let symtab_size = out.len() as u64 - symtab_off;
    let strtab_off = out.len() as u64;
    out.extend_from_slice(&str_data);

    let mut shnames: Vec<&str> = sections.iter().map(|s| s.name.as_str()).collect();
    if dynamic {
        shnames.extend([".dynsym", ".dynstr", ".shstrtab"]);
    } else {
        shnames.extend([".symtab", ".strtab", ".shstrtab"]);
    }
    let (shstr, shstr_offs) = strtab(&shnames);
    let shstr_off = out.len() as u64;
    out.extend_from_slice(&shstr);

    align(&mut out, 8);
    let shoff = out.len() as u64;
    let shnum = sections.len() + 4;
    out.extend_from_slice(&[0u8; SHDR]);
    let shdr = |out: &mut Vec<u8>, name: u32, typ: u32, flags: u64, addr: u64, off: u64, size: u64, link: u32, info: u32, entsize: u64| {
        put32(out, name);
        put32(out, typ);
        put64(out, flags);
        put64(out, addr);
        put64(out, off);
        put64(out, size);
        put32(out, link);
        put32(out, info);
        put64(out, 1);
        put64(out, entsize);
    };
    for (i, s) in sections.iter().enumerate() {
        let (typ, flags) = match s.kind {
            SectionKind::Text => (1, 2 | 4),
            SectionKind::Data => (1, 1 | 2),
            SectionKind::ReadOnly => (1, 2),
            SectionKind::Bss(_) => (8, 1 | 2),
        };
        shdr(&mut out, shstr_offs[i], typ, flags, s.addr, offsets[i], s.mem_size(), 0, 0, 0);
    }
    let n = sections.len();
    let strtab_index = (n + 2) as u32;
    // SHT_DYNSYM or SHT_SYMTAB.
    let symtab_type = if dynamic { 11 } else { 2 };
    shdr(&mut out, shstr_offs[n], symtab_type, 0, 0, symtab_off, symtab_size, strtab_index, (nlocal + 1) as u32, 24);
    shdr(&mut out, shstr_offs[n + 1], 3, 0, 0, strtab_off, str_data.len() as u64, 0, 0, 0);
    shdr(&mut out, shstr_offs[n + 2], 3, 0, 0, shstr_off, shstr.len() as u64, 0, 0, 0);

    // Program headers.
    let mut ph = Vec::new();
    for &i in &loads {
        let s = &sections[i];
        let flags: u32 = match s.kind {
            SectionKind::Text => 4 | 1,
            SectionKind::Data => 4 | 2,
            _ => 4,
        };
        put32(&mut ph, 1);
        put32(&mut ph, flags);
        put64(&mut ph, offsets[i]);
        put64(&mut ph, s.addr);
        put64(&mut ph, s.addr);
        put64(&mut ph, s.data.len() as u64);
        put64(&mut ph, s.data.len() as u64);
        put64(&mut ph, 1);
    }
    out[EHDR..EHDR + ph.len()].copy_from_slice(&ph);

    let mut eh = Vec::with_capacity(EHDR);
    eh.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    eh.extend_from_slice(&[0u8; 8]);
    put16(&mut eh, 2); // ET_EXEC
    put16(&mut eh, 62); // EM_X86_64
    put32(&mut eh, 1);
    put64(&mut eh, entry);
    put64(&mut eh, if loads.is_empty() { 0 } else { EHDR as u64 });
    put64(&mut eh, shoff);
    put32(&mut eh, 0);
    put16(&mut eh, EHDR as u16);
    put16(&mut eh, PHDR as u16);
    put16(&mut eh, loads.len() as u16);
    put16(&mut eh, SHDR as u16);
    put16(&mut eh, shnum as u16);
    put16(&mut eh, (shnum - 1) as u16);
    out[..EHDR].copy_from_slice(&eh);
    out
}

/// A PE32+ (x86-64) image with a COFF symbol table.
///
/// Section `addr`s are RVAs; the image base is `image_base`.
pub fn pe64(sections: &[Section], syms: &[Sym], image_base: u64) -> Vec<u8> {
    pe64_image(sections, syms, image_base, None)
}

/// A PE32+ image without COFF symbols that exports `(name, rva)` pairs.
///
/// The export directory goes in an `.edata` section placed on the page
/// after the last of `sections`.
pub fn pe64_exports(sections: &[Section], exports: &[(&str, u32)], image_base: u64) -> Vec<u8> {
    let end = sections.iter().map(|s| s.addr + s.mem_size()).max().unwrap_or(0x1000);
    let rva = (end.div_ceil(0x1000) * 0x1000) as u32;

    let mut sorted = exports.to_vec();
    sorted.sort_by_key(|&(name, _)| name);
    let n = sorted.len() as u32;
    let eat = rva + 40;
    let names = eat + 4 * n;
    let ordinals = names + 4 * n;
    let strings = ordinals + 2 * n;

    let mut tail = b"fixture.dll\0".to_vec();
    let mut name_rvas = Vec::new();
    for (name, _) in &sorted {
        name_rvas.push(strings + tail.len() as u32);
        tail.extend_from_slice(name.as_bytes());
        tail.push(0);
    }

    let mut dir = Vec::new();
    put32(&mut dir, 0); // characteristics
    put32(&mut dir, 0); // timestamp
    put32(&mut dir, 0); // version
    put32(&mut dir, strings);
    put32(&mut dir, 1); // ordinal base
    put32(&mut dir, n);
    put32(&mut dir, n);
    put32(&mut dir, eat);
    put32(&mut dir, names);
    put32(&mut dir, ordinals);
    for &(_, addr) in &sorted {
        put32(&mut dir, addr);
    }
    for &r in &name_rvas {
        put32(&mut dir, r);
    }
    for i in 0..n {
        put16(&mut dir, i as u16);
    }
    dir.extend_from_slice(&tail);

    let size = dir.len() as u32;
    let mut all = sections.to_vec();
    all.push(Section::new(".edata", rva as u64, SectionKind::ReadOnly, dir));
    pe64_image(&all, &[], image_base, Some((rva, size)))
}

fn pe64_image(sections: &[Section], syms: &[Sym], image_base: u64, export_dir: Option<(u32, u32)>) -> Vec<u8> {
    const FILE_ALIGN: usize = 0x200;
    let nt = 0x40usize;
    let headers_end = nt + 4 + 20 + 240 + 40 * sections.len();
    let size_of_headers = headers_end.div_ceil(FILE_ALIGN) * FILE_ALIGN;

    let mut out = vec![0u8; size_of_headers];
    let mut raw = Vec::new();
    for s in sections {
        let off = out.len();
        if !matches!(s.kind, SectionKind::Bss(_)) {
            out.extend_from_slice(&s.data);
            align(&mut out, FILE_ALIGN);
        }
        raw.push((off as u32, (out.len() - off) as u32));
    }

    // COFF symbols and their string table.
    let symtab_off = if syms.is_empty() { 0 } else { out.len() as u32 };
    let mut strings = Vec::new();
    for s in syms {
        let name = s.name.as_bytes();
        if name.len() <= 8 {
            let mut short = [0u8; 8];
            short[..name.len()].copy_from_slice(name);
            out.extend_from_slice(&short);
        } else {
            put32(&mut out, 0);
            put32(&mut out, 4 + strings.len() as u32);
            strings.extend_from_slice(name);
            strings.push(0);
        }
        put32(&mut out, (s.value - sections[s.section].addr) as u32);
        put16(&mut out, (s.section + 1) as u16);
        let func = matches!(sections[s.section].kind, SectionKind::Text);
        put16(&mut out, if func { 0x20 } else { 0 });
        out.push(if s.local { 3 } else { 2 });
        out.push(0);
    }
    if !syms.is_empty() {
        put32(&mut out, 4 + strings.len() as u32);
        out.extend_from_slice(&strings);
    }

    let mut h = Vec::new();
    h.extend_from_slice(b"MZ");
    h.resize(0x3c, 0);
    put32(&mut h, nt as u32);
    h.extend_from_slice(b"PE\0\0");
    put16(&mut h, 0x8664);
    put16(&mut h, sections.len() as u16);
    put32(&mut h, 0);
    put32(&mut h, symtab_off);
    put32(&mut h, syms.len() as u32);
    put16(&mut h, 240);
    put16(&mut h, 0x22);

    let image_end = sections
        .iter()
        .map(|s| s.addr + s.mem_size())
        .max()
        .unwrap_or(0x1000);
    let size_of_image = (image_end as usize).div_ceil(0x1000) * 0x1000;
    let entry = sections
        .iter()
        .find(|s| s.kind == SectionKind::Text)
        .map_or(0, |s| s.addr as u32);
    put16(&mut h, 0x20b);
    h.extend_from_slice(&[14, 0]);
    for _ in 0..3 {
        put32(&mut h, 0);
    }
    put32(&mut h, entry);
    put32(&mut h, entry);
    put64(&mut h, image_base);
    put32(&mut h, 0x1000);
    put32(&mut h, FILE_ALIGN as u32);
    for v in [6u16, 0, 0, 0, 6, 0] {
        put16(&mut h, v);
    }
    put32(&mut h, 0);
    put32(&mut h, size_of_image as u32);
    put32(&mut h, size_of_headers as u32);
    put32(&mut h, 0);
    put16(&mut h, 3); // console
    put16(&mut h, 0);
    for v in [0x10_0000u64, 0x1000, 0x10_0000, 0x1000] {
        put64(&mut h, v);
    }
    put32(&mut h, 0);
    put32(&mut h, 16);
    let (export_rva, export_size) = export_dir.unwrap_or((0, 0));
    put32(&mut h, export_rva);
    put32(&mut h, export_size);
    h.extend_from_slice(&[0u8; 15 * 8]);

    for (s, &(off, size)) in sections.iter().zip(&raw) {
        let mut name = [0u8; 8];
        let n = s.name.len().min(8);
        name[..n].copy_from_slice(&s.name.as_bytes()[..n]);
        h.extend_from_slice(&name);
        put32(&mut h, s.mem_size() as u32);
        put32(&mut h, s.addr as u32);
        let (off, size) = if matches!(s.kind, SectionKind::Bss(_)) { (0, 0) } else { (off, size) };
        put32(&mut h, size);
        put32(&mut h, off);
        put32(&mut h, 0);
        put32(&mut h, 0);
        put16(&mut h, 0);
        put16(&mut h, 0);
        let ch: u32 = match s.kind {
            SectionKind::Text => 0x20 | 0x2000_0000 | 0x4000_0000,
            SectionKind::Data => 0x40 | 0x4000_0000 | 0x8000_0000,
            SectionKind::ReadOnly => 0x40 | 0x4000_0000,
            SectionKind::Bss(_) => 0x80 | 0x4000_0000 | 0x8000_0000,
        };
        put32(&mut h, ch);
    }
    assert_eq!(h.len(), headers_end);
    out[..h.len()].copy_from_slice(&h);
    out
}

/// One function for `pclntab`.
#[derive(Debug, Clone, Default)]
pub struct PclnFunc {
    pub name: String,
    pub entry: u64,
    pub end: u64,
    pub args: i32,
    pub frame: i32,
    /// `(sp delta, length in bytes)`; consecutive values must differ.
    pub pcsp: Vec<(i32, u64)>,
    /// `(stack map index, length in bytes)`; consecutive values must differ.
    pub stack_map_index: Vec<(i32, u64)>,
    pub args_map: Option<u64>,
    pub locals_map: Option<u64>,
}

fn uvarint(out: &mut Vec<u8>, mut v: u32) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn pcvalue(pairs: &[(i32, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = -1i32;
    for &(value, len) in pairs {
        let delta = value - prev;
        let zz = if delta < 0 {
            (((-delta - 1) as u32) << 1) | 1
        } else {
            (delta as u32) << 1
        };
        uvarint(&mut out, zz);
        uvarint(&mut out, len as u32);
        prev = value;
    }
    out.push(0);
    out
}

/// A version `0xfffffffb` table for amd64 (pc quantum 1, 8-byte pointers).
pub fn pclntab(funcs: &[PclnFunc]) -> Vec<u8> {
    const FUNC_SIZE: usize = 8 + 32 + 4 + 4 + 16;
    let n = funcs.len();
    let ftab_end = 16 + (n + 1) * 16;
    let funcs_start = ftab_end;
    let mut tail = Vec::new();
    let tail_start = funcs_start + n * FUNC_SIZE;
    let mut records = Vec::new();
    for f in funcs {
        let nameoff = (tail_start + tail.len()) as i32;
        tail.extend_from_slice(f.name.as_bytes());
        tail.push(0);
        let mut table_at = |pairs: &[(i32, u64)]| -> i32 {
            if pairs.is_empty() {
                return 0;
            }
            let off = (tail_start + tail.len()) as i32;
            tail.extend_from_slice(&pcvalue(pairs));
            off
        };
        let pcsp = table_at(&f.pcsp);
        let stack_map = table_at(&f.stack_map_index);
        records.push((nameoff, pcsp, stack_map));
    }

    let mut b = vec![0xfb, 0xff, 0xff, 0xff, 0, 0, 1, 8];
    put64(&mut b, n as u64);
    for (i, f) in funcs.iter().enumerate() {
        put64(&mut b, f.entry);
        put64(&mut b, (funcs_start + i * FUNC_SIZE) as u64);
    }
    put64(&mut b, funcs.last().map_or(0, |f| f.end));
    put64(&mut b, 0);
    assert_eq!(b.len(), funcs_start);
    for (f, &(nameoff, pcsp, stack_map)) in funcs.iter().zip(&records) {
        put64(&mut b, f.entry);
        for field in [nameoff, f.args, f.frame, pcsp, 0, 0, 1, 2] {
            put32(&mut b, field as u32);
        }
        put32(&mut b, stack_map as u32);
        put32(&mut b, 0);
        put64(&mut b, f.args_map.unwrap_or(0));
        put64(&mut b, f.locals_map.unwrap_or(0));
    }
    assert_eq!(b.len(), tail_start);
    b.extend_from_slice(&tail);
    b
}

/// Runtime stack map blob: `n`, `nbit`, then the packed bitmaps.
pub fn stack_map(nbit: i32, bitmaps: &[&[u8]]) -> Vec<u8> {
    let mut v = Vec::new();
    put32(&mut v, bitmaps.len() as u32);
    put32(&mut v, nbit as u32);
    for b in bitmaps {
        v.extend_from_slice(b);
    }
    v
}

pub const TEXT: u64 = 0x1000;
pub const FUNCDATA: u64 = 0x3000;
pub const PCLNTAB: u64 = 0x4000;

/// The Go-flavoured test program: `foo` (frameless), `bar` (24-byte frame
/// with stack maps), a data symbol and the function table.
pub fn go_program() -> Vec<u8> {
    let mut text = FOO_CODE.to_vec();
    text.resize(0x10, 0xcc);
    text.extend_from_slice(&BAR_CODE);

    let mut rodata = stack_map(1, &[&[0x01]]);
    rodata.resize(0x10, 0);
    rodata.extend_from_slice(&stack_map(2, &[&[0x02]]));

    let funcs = [
        PclnFunc {
            name: "main.foo".into(),
            entry: TEXT,
            end: TEXT + 0x10,
            pcsp: vec![(0, 13)],
            ..Default::default()
        },
        PclnFunc {
            name: "main.bar".into(),
            entry: TEXT + 0x10,
            end: TEXT + 0x1a,
            args: 8,
            frame: 24,
            pcsp: vec![(0, 4), (24, 5), (0, 1)],
            stack_map_index: vec![(-1, 4), (0, 5), (-1, 1)],
            args_map: Some(FUNCDATA),
            locals_map: Some(FUNCDATA + 0x10),
        },
    ];
    let sections = [
        Section::new(".text", TEXT, SectionKind::Text, text),
        Section::new(".rodata", FUNCDATA, SectionKind::ReadOnly, rodata),
        Section::new(".gopclntab", PCLNTAB, SectionKind::ReadOnly, pclntab(&funcs)),
        Section::new(".noptrdata", 0x5000, SectionKind::Data, vec![1, 2, 3, 4, 5, 6, 7, 8]),
        Section::new(".bss", 0x6000, SectionKind::Bss(0x40), Vec::new()),
    ];
    let syms = [
        Sym::new("main.foo", TEXT, 13, 0),
        Sym::new("main.bar", TEXT + 0x10, 10, 0),
        Sym::new("main.table", 0x5000, 8, 3),
        Sym::new("main.buf", 0x6000, 0x40, 4),
    ];
    elf64(&sections, &syms, TEXT)
}

/// One text symbol `foo` at 0x1000 holding `FOO_CODE`.
pub fn foo_elf() -> Vec<u8> {
    let sections = [Section::new(".text", TEXT, SectionKind::Text, FOO_CODE.to_vec())];
    elf64(&sections, &[Sym::new("foo", TEXT, FOO_CODE.len() as u64, 0)], TEXT)
}

pub fn write_temp(bytes: &[u8]) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
    f
}
