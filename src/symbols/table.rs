//! Indexed, immutable view over an object's symbols.

use std::collections::HashMap;

use regex::Regex;

use crate::core::address::Address;
use crate::core::symbol::{Symbol, SymbolKind};
use crate::demangle;

/// Minimum Jaro-Winkler similarity accepted by [`SymbolTable::suggest`].
const SUGGEST_THRESHOLD: f64 = 0.8;

/// Symbol table with name and address indices.
///
/// Symbols are kept sorted by (address, name). Duplicate names resolve to the
/// first symbol in that order, i.e. the lowest address.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    syms: Vec<Symbol>,
    by_name: HashMap<String, usize>,
    /// Indices of symbols with addresses, sorted by address.
    addr_index: Vec<usize>,
    /// `enclosing[i]` is the last position `j < i` in `addr_index` whose
    /// symbol ends past the end of symbol `i`.
    enclosing: Vec<Option<usize>>,
}

impl SymbolTable {
    pub fn new(mut syms: Vec<Symbol>) -> Self {
        syms.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.name.cmp(&b.name)));

        let mut by_name = HashMap::with_capacity(syms.len());
        for (i, s) in syms.iter().enumerate() {
            by_name.entry(s.name.clone()).or_insert(i);
        }

        let addr_index: Vec<usize> = syms
            .iter()
            .enumerate()
            .filter(|(_, s)| s.has_addr && s.kind != SymbolKind::Undef)
            .map(|(i, _)| i)
            .collect();
        let end = |i: usize| syms[i].value.saturating_add(syms[i].size);
        // Previous-greater-end links, built with a monotonic stack.
        let mut enclosing = Vec::with_capacity(addr_index.len());
        let mut stack: Vec<usize> = Vec::new();
        for (pos, &i) in addr_index.iter().enumerate() {
            while stack.last().is_some_and(|&top| end(addr_index[top]) <= end(i)) {
                stack.pop();
            }
            enclosing.push(stack.last().copied());
            stack.push(pos);
        }

        Self {
            syms,
            by_name,
            addr_index,
            enclosing,
        }
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// All symbols, ordered by address then name.
    pub fn syms(&self) -> &[Symbol] {
        &self.syms
    }

    pub fn by_name(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.syms[i])
    }

    /// Symbol whose `[value, value+size)` contains `addr`.
    ///
    /// Zero-sized symbols match only their exact address. When ranges
    /// overlap the symbol with the highest start address wins, ties going to
    /// the one ordered last by name.
    pub fn containing(&self, addr: Address) -> Option<&Symbol> {
        let count = self
            .addr_index
            .partition_point(|&i| self.syms[i].value <= addr);
        // Positions skipped by an `enclosing` hop all end no later than the
        // symbol hopped from, so none of them reach `addr` either.
        let mut pos = count.checked_sub(1);
        while let Some(p) = pos {
            let s = &self.syms[self.addr_index[p]];
            if addr < s.value.saturating_add(s.size) {
                return Some(s);
            }
            pos = self.enclosing[p];
        }
        // Zero-sized symbols exactly at `addr`.
        let start = self
            .addr_index
            .partition_point(|&i| self.syms[i].value < addr);
        self.addr_index[start..]
            .iter()
            .map(|&i| &self.syms[i])
            .take_while(|s| s.value == addr)
            .find(|s| s.size == 0)
    }

    /// Name and base address for symbolising an operand address.
    pub fn sym_name(&self, addr: Address) -> Option<(&str, Address)> {
        self.containing(addr).map(|s| (s.name.as_str(), s.value))
    }

    /// Render `addr` as `name` or `name+0xoff`.
    pub fn symbolize(&self, addr: Address) -> Option<String> {
        let (name, base) = self.sym_name(addr)?;
        Some(if addr == base {
            name.to_string()
        } else {
            format!("{}+{:#x}", name, addr - base)
        })
    }

    /// Symbols of `kind` (if given) whose name matches `pattern` (if given).
    pub fn filter<'a>(
        &'a self,
        kind: Option<SymbolKind>,
        pattern: Option<&'a Regex>,
    ) -> impl Iterator<Item = &'a Symbol> + 'a {
        self.syms.iter().filter(move |s| {
            kind.map_or(true, |k| s.kind == k) && pattern.map_or(true, |re| re.is_match(&s.name))
        })
    }

    /// One page of `syms()`, for paginated listings.
    pub fn page(&self, offset: usize, limit: usize) -> &[Symbol] {
        let start = offset.min(self.syms.len());
        let end = start.saturating_add(limit).min(self.syms.len());
        &self.syms[start..end]
    }

    /// Names close to `name`, best first, for "did you mean" hints.
    pub fn suggest(&self, name: &str, max: usize) -> Vec<&str> {
        let mut scored: Vec<(f64, &str)> = self
            .by_name
            .keys()
            .map(|k| (strsim::jaro_winkler(name, k), k.as_str()))
            .filter(|(score, _)| *score >= SUGGEST_THRESHOLD)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().take(max).map(|(_, k)| k).collect()
    }

    /// Human-friendly name: demangled when the name is mangled.
    pub fn display_name(sym: &Symbol) -> String {
        demangle::demangle_one(&sym.name)
            .map(|d| d.demangled)
            .unwrap_or_else(|| sym.name.clone())
    }
}
