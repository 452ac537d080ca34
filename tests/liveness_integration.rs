//! Function table decoding and stack liveness on a synthetic Go binary.

mod common;

use common::{elf64, pclntab, PclnFunc, Section, SectionKind, Sym, BAR_CODE, PCLNTAB, TEXT};
use objlens::liveness::SlotRegion;
use objlens::{symbols, AnalysisConfig, FuncTab, ObjlensError, Session};

fn go_session() -> Session {
    Session::new(objlens::open(common::go_program()).unwrap(), AnalysisConfig::default()).unwrap()
}

#[test]
fn function_table_is_found_by_section() {
    let session = go_session();
    let ft = session.functab().unwrap();
    assert_eq!(ft.len(), 2);
    assert_eq!(ft.pc_quantum, 1);
    assert_eq!(ft.ptr_size, 8);

    let bar = ft.by_entry(TEXT + 0x10).unwrap();
    assert_eq!(bar.name, "main.bar");
    assert_eq!(bar.end, TEXT + 0x1a);
    assert_eq!(bar.frame_size, 24);
    assert_eq!(bar.args, 8);
    assert_eq!(bar.sp_delta(TEXT + 0x10), Some(0));
    assert_eq!(bar.sp_delta(TEXT + 0x14), Some(24));
    assert_eq!(bar.sp_delta(TEXT + 0x19), Some(0));
    assert_eq!(bar.sp_delta(TEXT + 0x1a), None);
    assert_eq!(ft.lookup(TEXT + 0x15).map(|f| f.name.as_str()), Some("main.bar"));
    assert_eq!(ft.lookup(TEXT + 0x0c).map(|f| f.name.as_str()), Some("main.foo"));
    assert!(ft.lookup(TEXT + 0x40).is_none());
}

#[test]
fn frame_slots_at_each_instruction() {
    let session = go_session();
    let a = session.analyze_symbol("main.bar", &session.budget()).unwrap();
    let live = a.liveness.as_ref().unwrap();
    assert_eq!(live.insts.len(), 4);

    // Entry: no frame yet, and the stack map index is -1.
    assert_eq!(live.insts[0].pc, TEXT + 0x10);
    assert!(live.insts[0].ranges.is_none());
    assert!(live.slots(0).unwrap().is_empty());

    // The nop runs with a 24-byte frame.
    let nop = &live.insts[1];
    assert_eq!(nop.pc, TEXT + 0x14);
    assert_eq!(nop.sp_delta, Some(24));
    let ranges = nop.ranges.unwrap();
    assert_eq!((ranges.locals.start, ranges.locals.end), (0, 16));
    assert_eq!((ranges.args.start, ranges.args.end), (32, 40));

    let slots: Vec<(SlotRegion, i64, bool)> = live
        .slots(1)
        .unwrap()
        .into_iter()
        .map(|s| (s.region, s.offset, s.live))
        .collect();
    assert_eq!(
        slots,
        [
            (SlotRegion::Locals, 0, false),
            (SlotRegion::Locals, 8, true),
            (SlotRegion::Args, 32, true),
        ]
    );

    // After the frame is popped there is nothing to report.
    assert!(live.insts[3].ranges.is_none());
    assert_eq!(live.covered(), 2);
    assert_eq!(live.bitmaps.len(), 1);
    assert_eq!(live.bitmaps[0].locals.as_ref().unwrap().to_string(), "2:02");
    assert!(matches!(
        live.slots(9),
        Err(ObjlensError::IndexOutOfRange { index: 9, len: 4 })
    ));
}

#[test]
fn frameless_function_has_empty_overlay() {
    let session = go_session();
    let a = session.analyze_symbol("main.foo", &session.budget()).unwrap();
    let live = a.liveness.as_ref().unwrap();
    assert_eq!(live.insts.len(), a.insts.len());
    assert_eq!(live.covered(), 0);
    assert!(a.warnings.is_empty());
}

#[test]
fn liveness_serializes_bitmaps_as_records() {
    let session = go_session();
    let a = session.analyze_symbol("main.bar", &session.budget()).unwrap();
    let json = serde_json::to_value(a.liveness.as_ref().unwrap()).unwrap();
    assert_eq!(json["bitmaps"][0]["locals"], "2:02");
    assert_eq!(json["bitmaps"][0]["args"], "1:01");
}

fn with_table(table: Vec<u8>, extra: Vec<u8>) -> objlens::Object {
    let mut text = vec![0xcc; 0x10];
    text.extend_from_slice(&BAR_CODE);
    objlens::open(elf64(
        &[
            Section::new(".text", TEXT, SectionKind::Text, text),
            Section::new(".rodata", common::FUNCDATA, SectionKind::ReadOnly, extra),
            Section::new(".gopclntab", PCLNTAB, SectionKind::ReadOnly, table),
        ],
        &[Sym::new("main.bar", TEXT + 0x10, 10, 0)],
        TEXT,
    ))
    .unwrap()
}

fn bar_func() -> PclnFunc {
    PclnFunc {
        name: "main.bar".into(),
        entry: TEXT + 0x10,
        end: TEXT + 0x1a,
        frame: 24,
        pcsp: vec![(0, 4), (24, 5), (0, 1)],
        stack_map_index: vec![(-1, 4), (3, 5), (-1, 1)],
        locals_map: Some(common::FUNCDATA),
        ..Default::default()
    }
}

#[test]
fn unsupported_version_is_a_warning() {
    let mut table = pclntab(&[bar_func()]);
    table[0] = 0xf0;
    let session = Session::new(with_table(table, common::stack_map(2, &[&[0x02]])), AnalysisConfig::default()).unwrap();
    assert!(session.functab().is_none());

    let obj = session.object();
    let symtab = symbols::load(obj).unwrap();
    assert!(matches!(
        FuncTab::load(obj, &symtab, session.config()),
        Err(ObjlensError::UnsupportedVersion { found: 0xfffffff0 })
    ));

    let a = session.analyze_symbol("main.bar", &session.budget()).unwrap();
    assert!(a.liveness.is_none());
    assert!(a.ssa.is_some());
    assert!(a.warnings.iter().any(|w| w.contains("unsupported function table version")));
}

#[test]
fn stack_map_index_past_the_blob_is_malformed() {
    // Index 3 but the locals map only holds one bitmap.
    let session = Session::new(
        with_table(pclntab(&[bar_func()]), common::stack_map(2, &[&[0x02]])),
        AnalysisConfig::default(),
    )
    .unwrap();
    assert!(session.functab().is_some());
    let a = session.analyze_symbol("main.bar", &session.budget()).unwrap();
    assert!(a.liveness.is_none());
    assert!(a.warnings.iter().any(|w| w.contains("malformed liveness bitmap")));
}

#[test]
fn stray_bits_in_a_stack_map_are_malformed() {
    let func = PclnFunc {
        stack_map_index: vec![(-1, 4), (0, 5), (-1, 1)],
        ..bar_func()
    };
    // nbit 2 but bit 3 is set.
    let session = Session::new(
        with_table(pclntab(&[func]), common::stack_map(2, &[&[0x0a]])),
        AnalysisConfig::default(),
    )
    .unwrap();
    let a = session.analyze_symbol("main.bar", &session.budget()).unwrap();
    assert!(a.liveness.is_none());
    assert!(a.warnings.iter().any(|w| w.contains("bits set past bit 2")));
}

#[test]
fn funcdata_must_point_into_the_object() {
    let func = PclnFunc {
        locals_map: Some(0xdead_0000),
        ..bar_func()
    };
    let obj = with_table(pclntab(&[func]), Vec::new());
    let symtab = symbols::load(&obj).unwrap();
    assert!(matches!(
        FuncTab::load(&obj, &symtab, &AnalysisConfig::default()),
        Err(ObjlensError::MalformedFunctionTable(_))
    ));
}

#[test]
fn missing_table_is_silent() {
    let session = Session::new(objlens::open(common::foo_elf()).unwrap(), AnalysisConfig::default()).unwrap();
    assert!(session.functab().is_none());
    let a = session.analyze_symbol("foo", &session.budget()).unwrap();
    assert!(a.liveness.is_none());
    assert!(a.warnings.is_empty());
}

#[test]
fn liveness_can_be_disabled() {
    let config = AnalysisConfig {
        liveness: false,
        ..Default::default()
    };
    let session = Session::new(objlens::open(common::go_program()).unwrap(), config).unwrap();
    let a = session.analyze_symbol("main.bar", &session.budget()).unwrap();
    assert!(a.liveness.is_none());
}
