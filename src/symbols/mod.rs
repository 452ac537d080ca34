//! # Symbols Module
//!
//! Indexed access to an object's symbols. The table is built once from
//! `Object::symbols()` and is read-only afterwards, so it can be shared by
//! every in-flight analysis request.

pub mod table;

pub use table::SymbolTable;

use tracing::debug;

use crate::error::Result;
use crate::formats::Object;

/// Parse the symbols of `obj` and index them.
pub fn load(obj: &Object) -> Result<SymbolTable> {
    let syms = obj.symbols()?;
    let table = SymbolTable::new(syms);
    debug!(count = table.len(), "symbol table built");
    Ok(table)
}
