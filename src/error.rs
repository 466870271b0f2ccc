//! Crate-level error types. Two taxonomies are kept strictly separate:
//! load-time failures (`ParseError`, `ValidationError`, `LinkError`, folded
//! into `LoadError`) and execution traps (`Trap`), which always unwind to the
//! nearest `invoke`.

use thiserror::Error;

/// Failure while decoding a binary module.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Binary(#[from] crate::binary::BinaryReadError),
}

/// Structural validation failure detected between decode and instantiation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("function type index out of range")]
    FuncTypeIndexOutOfRange,

    #[error("limits maximum is below minimum")]
    LimitsMaxBelowMin,

    #[error("duplicate export name: {0}")]
    DuplicateExport(String),

    #[error("{0} export index out of range")]
    ExportIndexOutOfRange(&'static str),

    #[error("start function index out of range")]
    StartIndexOutOfRange,

    #[error("start function must have type [] -> []")]
    StartSignature,

    #[error("element segment table index out of range")]
    ElementTableOutOfRange,

    #[error("element segment function index out of range")]
    ElementFuncOutOfRange,

    #[error("data segment memory index out of range")]
    DataMemoryOutOfRange,

    #[error("function and code section length mismatch")]
    FunctionCodeMismatch,

    #[error("function body missing terminating end")]
    MissingBodyEnd,
}

/// Instantiation failure: unresolved or mismatched imports, bad constant
/// initializers, or a guest-caused trap while applying active segments or
/// running the start function.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unresolved import: {module}.{name}")]
    UnresolvedImport { module: String, name: String },

    #[error("import type mismatch for {module}.{name}: {reason}")]
    ImportTypeMismatch {
        module: String,
        name: String,
        reason: &'static str,
    },

    #[error("imported function references invalid type index")]
    InvalidImportTypeIndex,

    #[error("invalid constant expression: {0}")]
    InvalidConstExpr(&'static str),

    #[error("constant expression references a mutable global")]
    MutableGlobalInConstExpr,

    #[error("global initializer type mismatch")]
    GlobalInitTypeMismatch,

    #[error("element segment references missing table")]
    MissingTable,

    #[error("data segment references missing memory")]
    MissingMemory,

    #[error("element segment cannot initialize non-funcref table")]
    NonFuncRefElementTarget,

    #[error("element segment function index out of range")]
    ElementFuncOutOfRange,

    #[error("element segment initialization out of bounds")]
    ElementSegmentOutOfBounds,

    #[error("data segment initialization out of bounds")]
    DataSegmentOutOfBounds,

    #[error("start function index out of range")]
    StartIndexOutOfRange,

    #[error("trap while running start function")]
    StartTrap(#[source] Trap),
}

/// Umbrella error for `Interpreter::load`. No partial instance is exposed on
/// failure.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Host-API misuse, surfaced synchronously at registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate host registration: {module}.{name}")]
    Duplicate { module: String, name: String },

    #[error("host global value does not match its declared type: {module}.{name}")]
    GlobalValueType { module: String, name: String },
}

/// An unrecoverable guest-execution fault. Traps unwind to the current
/// `invoke` and are reported with a diagnostic message; they are not a
/// general exception mechanism.
#[derive(Debug, Error)]
pub enum Trap {
    #[error("unreachable executed")]
    Unreachable,

    #[error("reached end of code")]
    EndOfCode,

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("expected {0} on stack")]
    OperandType(&'static str),

    #[error("integer divide by zero")]
    DivideByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid conversion of NaN to integer")]
    NanConversion,

    #[error("integer overflow during truncation")]
    TruncOverflow,

    #[error("memory access out of bounds")]
    MemoryOutOfBounds,

    #[error("table access out of bounds")]
    TableOutOfBounds,

    #[error("call_indirect index out of bounds")]
    IndirectCallOutOfBounds,

    #[error("call_indirect to a null table element")]
    NullFunction,

    #[error("call_indirect signature mismatch")]
    IndirectSignatureMismatch,

    #[error("call_indirect on a non-funcref table")]
    NonFuncRefTable,

    #[error("table element type mismatch")]
    TableTypeMismatch,

    #[error("branch depth exceeds control stack")]
    BranchDepth,

    #[error("attempt to modify immutable global")]
    ImmutableGlobal,

    #[error("memory.init on dropped data segment")]
    DroppedDataSegment,

    #[error("{0} index out of range")]
    IndexOutOfRange(&'static str),

    #[error("{0} must be non-negative")]
    NegativeOperand(&'static str),

    #[error("malformed code: {0}")]
    MalformedCode(&'static str),

    #[error("unsupported opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),

    #[error("unsupported 0xfc-prefixed opcode {0}")]
    UnsupportedPrefixedOpcode(u32),

    #[error("call stack exhausted")]
    CallStackExhausted,

    #[error("no module loaded")]
    NoModule,

    #[error("export not found: {0}")]
    ExportNotFound(String),

    #[error("export is not a function: {0}")]
    NotAFunction(String),

    #[error("expected {expected} arguments, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },

    #[error("argument {index} has wrong type: expected {expected}")]
    ArgumentType { index: usize, expected: &'static str },

    #[error("{0}")]
    Host(String),
}

impl Trap {
    /// Convenience constructor for host callbacks reporting a trap message.
    pub fn host(message: impl Into<String>) -> Self {
        Trap::Host(message.into())
    }
}
