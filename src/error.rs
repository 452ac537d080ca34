//! Error types for the objlens analysis core.
//!
//! Every failure is scoped to the object, symbol or instruction it concerns
//! and is returned as a typed value; nothing in the core aborts the process.

use thiserror::Error;

/// Main error type for objlens operations.
#[derive(Debug, Error)]
pub enum ObjlensError {
    /// No format backend accepted the input.
    #[error("unrecognized object file format")]
    UnrecognizedFormat,

    /// The container was recognized but its symbol table is structurally invalid.
    #[error("malformed symbol table: {0}")]
    MalformedSymbolTable(String),

    /// The function metadata table is structurally invalid.
    #[error("malformed function table: {0}")]
    MalformedFunctionTable(String),

    /// A liveness bitmap record could not be decoded.
    #[error("malformed liveness bitmap: {0}")]
    MalformedBitmap(String),

    /// Caller supplied an address range that the object does not back.
    #[error("address range {start:#x}..{end:#x} out of range")]
    OutOfRange { start: u64, end: u64 },

    /// Caller supplied a bit index outside a bitmap.
    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Opcode bytes the disassembler cannot interpret.
    #[error("undecodable instruction at offset {offset:#x} (pc {pc:#x})")]
    UndecodableInstruction { offset: usize, pc: u64 },

    /// An indirect branch prevents a fully connected CFG.
    #[error("unresolved control flow at {pc:#x}")]
    UnresolvedControlFlow { pc: u64 },

    /// Function table version tag is not the pinned one.
    #[error("unsupported function table version {found:#x}")]
    UnsupportedVersion { found: u32 },

    /// Optional data (debug info, function table) is absent.
    #[error("{0} not present")]
    NotPresent(&'static str),

    /// Symbol resolution errors
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// Architecture not supported
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// The request's cancel flag was raised.
    #[error("analysis cancelled")]
    Cancelled,

    /// Analysis timeout
    #[error("analysis timeout after {seconds}s")]
    Timeout { seconds: u64 },

    /// A worker running an analysis panicked or was aborted.
    #[error("analysis worker failed: {0}")]
    Worker(String),

    /// Resource limit exceeded
    #[error("budget exceeded: {resource} ({used}/{limit})")]
    BudgetExceeded {
        resource: &'static str,
        used: usize,
        limit: usize,
    },

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ObjlensError {
    /// True if the error invalidates the whole object rather than one
    /// symbol or instruction.
    pub fn is_terminal_for_object(&self) -> bool {
        matches!(
            self,
            ObjlensError::UnrecognizedFormat
                | ObjlensError::MalformedSymbolTable(_)
                | ObjlensError::Io(_)
        )
    }
}

impl From<serde_json::Error> for ObjlensError {
    fn from(err: serde_json::Error) -> Self {
        ObjlensError::Serialization(err.to_string())
    }
}

/// Result type alias for objlens operations
pub type Result<T> = std::result::Result<T, ObjlensError>;
