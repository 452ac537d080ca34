//! objlens: object file inspection.
//!
//! Opens ELF and PE objects, indexes their symbols, disassembles code
//! symbols, and builds per-function control-flow graphs, SSA form and a
//! stack liveness overlay from the Go runtime function table.
//!
//! ```no_run
//! use objlens::{AnalysisConfig, Session};
//!
//! let session = Session::open("a.out", AnalysisConfig::default())?;
//! let analysis = session.analyze_symbol("main.main", &session.budget())?;
//! println!("{} blocks", analysis.cfg.len());
//! # Ok::<(), objlens::ObjlensError>(())
//! ```

/// Core data types module
pub mod core;

pub mod analysis;
pub mod budget;
pub mod config;
pub mod demangle;
pub mod disasm;
pub mod error;
pub mod formats;
pub mod functab;
pub mod liveness;
pub mod logging;
pub mod symbols;
pub mod timeout;

pub use analysis::cfg::{basic_blocks, BasicBlock, Cfg, Edge, EdgeKind};
pub use analysis::pipeline::{Disasm, Session, SymbolAnalysis};
pub use analysis::ssa::SsaFunction;
pub use budget::Budget;
pub use config::{AnalysisConfig, DecodePolicy, UnresolvedPolicy};
pub use error::{ObjlensError, Result};
pub use formats::{open, open_path, Format, Object};
pub use functab::{FuncTab, FunctionDescriptor};
pub use liveness::{Liveness, LivenessBitmap};
pub use symbols::SymbolTable;
