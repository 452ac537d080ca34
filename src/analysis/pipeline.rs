//! Request-scoped symbol analysis.
//!
//! A `Session` holds the read-only state built when an object is opened
//! (object, symbol table, function table, disassembler). Each
//! `analyze_symbol` call runs disassembly, CFG, SSA and liveness for one
//! symbol under its own `Budget` and shares nothing mutable with other
//! requests.

use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, debug_span, warn};

use super::cfg::Cfg;
use super::ssa::SsaFunction;
use crate::budget::Budget;
use crate::config::{AnalysisConfig, UnresolvedPolicy};
use crate::core::address::Address;
use crate::core::instruction::{ControlKind, Instruction};
use crate::core::symbol::Symbol;
use crate::disasm::registry::{for_arch, for_arch_with_symbols};
use crate::disasm::{Backend, DecodeError, Disassembler};
use crate::error::{ObjlensError, Result};
use crate::formats::{self, Object};
use crate::functab::FuncTab;
use crate::liveness::Liveness;
use crate::symbols::{self, SymbolTable};

/// One row of the instruction listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disasm {
    pub pc: Address,
    pub op: String,
    pub args: Vec<String>,
    pub control: ControlKind,
    pub target: Option<Address>,
}

impl From<&Instruction> for Disasm {
    fn from(inst: &Instruction) -> Self {
        Self {
            pc: inst.pc,
            op: inst.op.clone(),
            args: inst.args.clone(),
            control: inst.control.kind,
            target: inst.control.target,
        }
    }
}

/// Everything derived for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolAnalysis {
    pub symbol: Symbol,
    pub insts: Vec<Disasm>,
    pub decode_errors: Vec<DecodeError>,
    pub cfg: Cfg,
    pub ssa: Option<SsaFunction>,
    pub liveness: Option<Liveness>,
    /// Non-fatal problems (unresolved branches, missing or broken liveness).
    pub warnings: Vec<String>,
    /// Decoded instructions, with operands and effects.
    #[serde(skip)]
    pub instructions: Vec<Instruction>,
}

impl SymbolAnalysis {
    /// Graphviz rendering of the CFG.
    pub fn to_dot(&self) -> String {
        self.cfg.to_dot(&self.symbol.name, &self.instructions)
    }
}

/// Read-only per-object state shared by analysis requests.
pub struct Session {
    object: Object,
    symtab: Arc<SymbolTable>,
    functab: Option<FuncTab>,
    /// Why the function table could not be used, when it exists but failed.
    functab_error: Option<String>,
    disasm: Option<Backend>,
    config: AnalysisConfig,
}

impl Session {
    /// Open the file at `path` and build a session over it.
    pub fn open<P: AsRef<Path>>(path: P, config: AnalysisConfig) -> Result<Self> {
        Self::new(formats::open_path(path)?, config)
    }

    pub fn new(object: Object, config: AnalysisConfig) -> Result<Self> {
        let symtab = Arc::new(symbols::load(&object)?);
        let (functab, functab_error) = match FuncTab::load(&object, &symtab, &config) {
            Ok(t) => {
                debug!(funcs = t.len(), "function table decoded");
                (Some(t), None)
            }
            Err(ObjlensError::NotPresent(what)) => {
                debug!(what, "no function table");
                (None, None)
            }
            Err(e) => {
                warn!(error = %e, "function table present but unusable");
                (None, Some(e.to_string()))
            }
        };
        let disasm = match object.info().arch {
            Some(arch) if config.symbolize_operands => {
                Some(for_arch_with_symbols(arch, Arc::clone(&symtab))?)
            }
            Some(arch) => Some(for_arch(arch)?),
            None => None,
        };
        debug!(
            format = ?object.format(),
            arch = object.info().arch.map_or("unknown", |a| a.name),
            symbols = symtab.len(),
            "session ready"
        );
        Ok(Self {
            object,
            symtab,
            functab,
            functab_error,
            disasm,
            config,
        })
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn symtab(&self) -> &SymbolTable {
        &self.symtab
    }

    pub fn functab(&self) -> Option<&FuncTab> {
        self.functab.as_ref()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// A fresh budget with the configured instruction limit.
    pub fn budget(&self) -> Budget {
        Budget::new(self.config.max_instructions)
    }

    /// Analyze the symbol called `name`.
    pub fn analyze_symbol(&self, name: &str, budget: &Budget) -> Result<SymbolAnalysis> {
        let span = debug_span!("analyze_symbol", symbol = name);
        let _enter = span.enter();
        let sym = self.symtab.by_name(name).ok_or_else(|| {
            let close = self.symtab.suggest(name, 3);
            if close.is_empty() {
                ObjlensError::SymbolNotFound(name.to_string())
            } else {
                ObjlensError::SymbolNotFound(format!("{} (did you mean {}?)", name, close.join(", ")))
            }
        })?;
        self.analyze(sym, budget)
    }

    /// Analyze `sym`, which must belong to this session's object.
    pub fn analyze(&self, sym: &Symbol, budget: &Budget) -> Result<SymbolAnalysis> {
        let disasm = self
            .disasm
            .as_ref()
            .ok_or_else(|| ObjlensError::UnsupportedArchitecture(self.object.info().machine.clone()))?;
        let data = self.object.symbol_data(sym)?;
        let seq = disasm.decode(&data, sym.value, self.config.decode_policy, budget)?;

        let mut warnings = Vec::new();
        for e in &seq.errors {
            warnings.push(format!("undecodable bytes at {:#x}", e.pc));
        }

        let cfg = Cfg::build(&seq.insts, budget)?;
        if let Some(&pc) = cfg.unresolved.first() {
            if self.config.unresolved_policy == UnresolvedPolicy::Fail {
                return Err(ObjlensError::UnresolvedControlFlow { pc });
            }
            for pc in &cfg.unresolved {
                warnings.push(format!("unresolved control flow at {:#x}", pc));
            }
        }

        let ssa = if self.config.build_ssa {
            Some(SsaFunction::build(&cfg, &seq.insts, budget)?)
        } else {
            None
        };

        let liveness = if self.config.liveness {
            self.liveness(sym, &seq.insts, &mut warnings)
        } else {
            None
        };

        debug!(
            insts = seq.insts.len(),
            blocks = cfg.len(),
            values = ssa.as_ref().map_or(0, |s| s.values.len()),
            liveness = liveness.is_some(),
            "symbol analyzed"
        );
        Ok(SymbolAnalysis {
            symbol: sym.clone(),
            insts: seq.insts.iter().map(Disasm::from).collect(),
            decode_errors: seq.errors,
            cfg,
            ssa,
            liveness,
            warnings,
            instructions: seq.insts,
        })
    }

    /// Liveness failures downgrade to warnings.
    fn liveness(&self, sym: &Symbol, insts: &[Instruction], warnings: &mut Vec<String>) -> Option<Liveness> {
        let Some(ft) = &self.functab else {
            if let Some(e) = &self.functab_error {
                warnings.push(format!("no liveness: {}", e));
            }
            return None;
        };
        let func = ft.by_entry(sym.value)?;
        match Liveness::compute(func, insts, &self.object, ft.ptr_size) {
            Ok(l) => Some(l),
            Err(e) => {
                warn!(symbol = %sym.name, error = %e, "liveness unavailable");
                warnings.push(format!("no liveness: {}", e));
                None
            }
        }
    }

    /// Analyze every text symbol (optionally filtered by name) in parallel.
    ///
    /// Each symbol gets its own budget; results are in address order.
    pub fn analyze_all(&self, filter: Option<&Regex>) -> Vec<(String, Result<SymbolAnalysis>)> {
        let syms: Vec<&Symbol> = self
            .symtab
            .syms()
            .iter()
            .filter(|s| s.is_text() && s.has_addr && s.size > 0)
            .filter(|s| filter.map_or(true, |re| re.is_match(&s.name)))
            .collect();
        syms.par_iter()
            .map(|s| (s.name.clone(), self.analyze(s, &self.budget())))
            .collect()
    }
}
