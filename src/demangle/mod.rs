//! Demangler helpers for Rust, C++ (Itanium) and MSVC symbols.
//!
//! Used only for display names; lookups always use the raw symbol name.

use once_cell::sync::Lazy;
use regex::Regex;

/// Itanium (GCC/Clang) ABI: `_Z...`
static RE_ITA_MANGLED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_{1,2}Z[a-zA-Z0-9_.$]+$").expect("valid itanium mangled regex"));

/// MSVC: `?name@@...` or `??0...`
static RE_MSVC_MANGLED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\?\??[A-Za-z0-9_@\$\?]+@@[A-Za-z0-9_@\$\?]*$").expect("valid msvc mangled regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolFlavor {
    Rust,
    Itanium,
    Msvc,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemangleResult {
    pub original: String,
    pub demangled: String,
    pub flavor: SymbolFlavor,
}

pub fn detect_flavor(s: &str) -> SymbolFlavor {
    if rustc_demangle::try_demangle(s).is_ok() {
        return SymbolFlavor::Rust;
    }
    if RE_ITA_MANGLED.is_match(s) {
        return SymbolFlavor::Itanium;
    }
    if RE_MSVC_MANGLED.is_match(s) {
        return SymbolFlavor::Msvc;
    }
    SymbolFlavor::Unknown
}

/// Attempt to demangle a single symbol. Returns None when not recognized.
pub fn demangle_one(s: &str) -> Option<DemangleResult> {
    let result = |demangled: String, flavor| DemangleResult {
        original: s.to_string(),
        demangled,
        flavor,
    };
    if let Ok(dm) = rustc_demangle::try_demangle(s) {
        // `{:#}` drops the trailing hash.
        return Some(result(format!("{:#}", dm), SymbolFlavor::Rust));
    }
    if RE_ITA_MANGLED.is_match(s) {
        if let Ok(sym) = cpp_demangle::Symbol::new(s) {
            return Some(result(sym.to_string(), SymbolFlavor::Itanium));
        }
    }
    if RE_MSVC_MANGLED.is_match(s) {
        if let Ok(out) = msvc_demangler::demangle(s, msvc_demangler::DemangleFlags::COMPLETE) {
            return Some(result(out, SymbolFlavor::Msvc));
        }
    }
    None
}
