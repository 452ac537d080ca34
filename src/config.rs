//! Configuration for the analysis pipeline.
//!
//! Every field has a default, so a JSON file only needs the keys it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What the disassembler does with bytes it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Fail the whole sequence with `UndecodableInstruction`.
    Abort,
    /// Emit a one-byte `(bad)` instruction and resume at the next byte.
    Skip,
}

/// What the pipeline does with indirect jumps when building the CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Keep the best-effort graph; the block becomes an exit block.
    TreatAsExit,
    /// Fail the analysis with `UnresolvedControlFlow`.
    Fail,
}

/// Master configuration for per-symbol analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub decode_policy: DecodePolicy,
    pub unresolved_policy: UnresolvedPolicy,
    /// Symbols that may hold the function table, tried in order.
    pub functab_symbols: Vec<String>,
    /// Sections tried when no symbol names the function table.
    pub functab_sections: Vec<String>,
    /// Per-request instruction budget.
    pub max_instructions: Option<usize>,
    pub build_ssa: bool,
    /// Overlay stack liveness when a function table is available.
    pub liveness: bool,
    /// Render operand addresses as `symbol+off`.
    pub symbolize_operands: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            decode_policy: DecodePolicy::Skip,
            unresolved_policy: UnresolvedPolicy::TreatAsExit,
            functab_symbols: vec!["runtime.pclntab".to_string()],
            functab_sections: vec![".gopclntab".to_string()],
            max_instructions: Some(1_000_000),
            build_ssa: true,
            liveness: true,
            symbolize_operands: true,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
