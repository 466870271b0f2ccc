//! Public model/IR surface.

pub mod module;
pub mod types;

pub use module::{
    CodeBody, ConstExpr, DataMode, DataSegment, ElementSegment, Global, LocalDecl, Module,
};
pub use types::{
    Export, ExportDesc, FuncIdx, FuncType, GlobalIdx, GlobalType, Import, ImportDesc, Limits,
    MemIdx, MemoryType, RefType, TableIdx, TableType, TypeIdx, ValType, Value,
};
