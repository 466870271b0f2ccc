//! wasmite: an embeddable interpreter for WebAssembly 1.0 (MVP) extended
//! with sign-extension, non-trapping float-to-int saturation, bulk memory,
//! reference types, and multi-value results.
//!
//! A module is decoded from its binary form, structurally validated,
//! instantiated against host-registered imports, and executed by directly
//! interpreting the code section's bytes:
//!
//! ```no_run
//! use wasmite::{Interpreter, Value};
//!
//! let bytes = std::fs::read("module.wasm").unwrap();
//! let mut interp = Interpreter::new();
//! interp.load(&bytes).unwrap();
//! let results = interp.invoke("add", &[Value::I32(10), Value::I32(5)]).unwrap();
//! assert_eq!(results, vec![Value::I32(15)]);
//! ```

pub mod binary;
pub mod error;
pub mod host;
pub mod model;
pub mod runtime;
pub mod validate;
pub mod vm;

use std::sync::Arc;

use log::{debug, trace};

use host::HostRegistry;
use model::{ConstExpr, DataMode, Import, ImportDesc};
use runtime::{
    DataInstance, FuncInstance, GlobalInstance, Instance, MemoryInstance, TableInstance, PAGE_SIZE,
};

pub use error::{LinkError, LoadError, ParseError, RegistryError, Trap, ValidationError};
pub use host::HostFunc;
pub use model::{
    ExportDesc, FuncType, GlobalType, Limits, MemoryType, Module, RefType, TableType, ValType,
    Value,
};

/// Default bound on guest recursion depth; exceeding it traps with
/// "call stack exhausted" instead of overflowing the native stack.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

/// Decode a binary module without instantiating it.
pub fn parse(bytes: &[u8]) -> Result<Module, ParseError> {
    Ok(binary::sections::parse_module_from_bytes(bytes)?)
}

/// Structurally validate a decoded module.
pub fn validate(module: &Module) -> Result<(), ValidationError> {
    validate::validate_module(module)
}

/// The embedding entry point: owns the host-import registry, the decoded
/// module, and its runtime instance. Single-threaded and non-reentrant; one
/// invocation runs to completion before another may begin.
pub struct Interpreter {
    host: HostRegistry,
    module: Option<Module>,
    instance: Option<Instance>,
    max_call_depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            host: HostRegistry::default(),
            module: None,
            instance: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    /// Bound the guest call depth. Calls past the bound trap with
    /// "call stack exhausted".
    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth;
    }

    /// Register a host function importable as `module.name`. The callback
    /// receives arguments matching `params` and returns values matching
    /// `results`, or a trap that unwinds as if raised at the call site.
    pub fn register_host_function<F>(
        &mut self,
        module: &str,
        name: &str,
        params: Vec<ValType>,
        results: Vec<ValType>,
        callback: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, Trap> + Send + Sync + 'static,
    {
        let ty = FuncType { params, results };
        self.host
            .register_function(module, name, ty, Arc::new(callback))
    }

    /// Register a host memory with optional initial contents, which must be a
    /// whole-page multiple within the declared limits.
    pub fn register_host_memory(
        &mut self,
        module: &str,
        name: &str,
        ty: MemoryType,
        data: Vec<u8>,
    ) -> Result<(), RegistryError> {
        self.host.register_memory(module, name, ty, data)
    }

    /// Register a host table with optional initial elements.
    pub fn register_host_table(
        &mut self,
        module: &str,
        name: &str,
        ty: TableType,
        elements: Vec<Value>,
    ) -> Result<(), RegistryError> {
        self.host.register_table(module, name, ty, elements)
    }

    /// Register a host global. The value must match the declared type.
    pub fn register_host_global(
        &mut self,
        module: &str,
        name: &str,
        ty: GlobalType,
        value: Value,
    ) -> Result<(), RegistryError> {
        self.host.register_global(module, name, ty, value)
    }

    /// Decode, validate, and instantiate a binary module. On failure no
    /// partial instance is exposed; a previously loaded instance stays
    /// untouched.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        let module = parse(bytes)?;
        validate::validate_module(&module)?;
        debug!(
            "loaded module: {} types, {} functions ({} imported), {} exports",
            module.types.len(),
            module.total_funcs(),
            module.imported_funcs,
            module.exports.len()
        );
        let instance = instantiate(&module, &self.host, self.max_call_depth)?;
        self.module = Some(module);
        self.instance = Some(instance);
        Ok(())
    }

    /// Invoke an exported function. Argument count and types must equal the
    /// export's signature or the call traps before entering the loop.
    pub fn invoke(&mut self, export_name: &str, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let module = self.module.as_ref().ok_or(Trap::NoModule)?;
        let instance = self.instance.as_mut().ok_or(Trap::NoModule)?;
        let desc = instance
            .export(export_name)
            .ok_or_else(|| Trap::ExportNotFound(export_name.to_owned()))?;
        let func_index = match desc {
            ExportDesc::Func(index) => index,
            _ => return Err(Trap::NotAFunction(export_name.to_owned())),
        };
        {
            let ty = instance
                .funcs
                .get(func_index as usize)
                .ok_or(Trap::IndexOutOfRange("function"))?
                .signature(module)
                .ok_or(Trap::IndexOutOfRange("type"))?;
            if ty.params.len() != args.len() {
                return Err(Trap::ArgumentCount {
                    expected: ty.params.len(),
                    actual: args.len(),
                });
            }
            for (index, (arg, param)) in args.iter().zip(&ty.params).enumerate() {
                if arg.ty() != *param {
                    return Err(Trap::ArgumentType {
                        index,
                        expected: param.name(),
                    });
                }
            }
        }
        trace!("invoke {export_name}/{}", args.len());
        vm::execute_function(module, instance, func_index, args, 0, self.max_call_depth)
    }

    /// Borrowed view over memory 0, if the instance has one. Invalidated by
    /// any operation that may grow memory.
    pub fn memory(&self) -> Option<&[u8]> {
        self.instance
            .as_ref()
            .and_then(|inst| inst.memories.first())
            .map(MemoryInstance::data)
    }

    /// Mutable view over memory 0, if the instance has one.
    pub fn memory_mut(&mut self) -> Option<&mut [u8]> {
        self.instance
            .as_mut()
            .and_then(|inst| inst.memories.first_mut())
            .map(MemoryInstance::data_mut)
    }

    /// Borrowed reference to the decoded module for introspection.
    pub fn module(&self) -> Option<&Module> {
        self.module.as_ref()
    }
}

/* ---------- Instantiation ---------- */

fn unresolved(import: &Import) -> LinkError {
    LinkError::UnresolvedImport {
        module: import.module.clone(),
        name: import.name.clone(),
    }
}

fn mismatch(import: &Import, reason: &'static str) -> LinkError {
    LinkError::ImportTypeMismatch {
        module: import.module.clone(),
        name: import.name.clone(),
        reason,
    }
}

/// Evaluate a constant initializer against the already-instantiated globals.
fn eval_const_expr(
    expr: &ConstExpr,
    globals: &[GlobalInstance],
    func_count: usize,
) -> Result<Value, LinkError> {
    match *expr {
        ConstExpr::I32Const(v) => Ok(Value::I32(v)),
        ConstExpr::I64Const(v) => Ok(Value::I64(v)),
        ConstExpr::F32Const(bits) => Ok(Value::F32(bits)),
        ConstExpr::F64Const(bits) => Ok(Value::F64(bits)),
        ConstExpr::GlobalGet(index) => {
            let global = globals
                .get(index as usize)
                .ok_or(LinkError::InvalidConstExpr("global index out of bounds"))?;
            if global.ty().mutable {
                return Err(LinkError::MutableGlobalInConstExpr);
            }
            Ok(global.get())
        }
        ConstExpr::RefNull(ty) => Ok(Value::zero(ty)),
        ConstExpr::RefFunc(index) => {
            if index as usize >= func_count {
                return Err(LinkError::InvalidConstExpr("function index out of bounds"));
            }
            Ok(Value::FuncRef(Some(index)))
        }
    }
}

/// Materialize a runtime instance: resolve imports in source order, append
/// defined items, evaluate initializers, apply segments, build exports, and
/// run the start function. The first failure aborts instantiation; active
/// segment overflow is a guest-caused trap surfaced as a link error.
fn instantiate(
    module: &Module,
    host: &HostRegistry,
    max_call_depth: usize,
) -> Result<Instance, LinkError> {
    let mut inst = Instance::default();

    for import in &module.imports {
        trace!("resolving import {}.{}", import.module, import.name);
        match &import.desc {
            ImportDesc::Func(type_idx) => {
                let expected = module
                    .types
                    .get(*type_idx as usize)
                    .ok_or(LinkError::InvalidImportTypeIndex)?;
                let record = host
                    .function(&import.module, &import.name)
                    .ok_or_else(|| unresolved(import))?;
                if record.ty != *expected {
                    return Err(mismatch(import, "function signature"));
                }
                inst.funcs.push(FuncInstance::Host {
                    ty: record.ty.clone(),
                    func: Arc::clone(&record.func),
                });
            }
            ImportDesc::Memory(mt) => {
                let record = host
                    .memory(&import.module, &import.name)
                    .ok_or_else(|| unresolved(import))?;
                if record.ty.limits != mt.limits {
                    return Err(mismatch(import, "memory limits"));
                }
                let mut memory = MemoryInstance::new(mt);
                if !record.data.is_empty() {
                    if record.data.len() % PAGE_SIZE != 0 {
                        return Err(mismatch(import, "memory size not a page multiple"));
                    }
                    let pages = (record.data.len() / PAGE_SIZE) as u32;
                    if pages < mt.limits.min {
                        return Err(mismatch(import, "memory below declared minimum"));
                    }
                    if let Some(max) = mt.limits.max {
                        if pages > max {
                            return Err(mismatch(import, "memory exceeds declared maximum"));
                        }
                    }
                    memory.replace_data(record.data.clone());
                }
                inst.memories.push(memory);
            }
            ImportDesc::Table(tt) => {
                let record = host
                    .table(&import.module, &import.name)
                    .ok_or_else(|| unresolved(import))?;
                if record.ty != *tt {
                    return Err(mismatch(import, "table type"));
                }
                let mut table = TableInstance::new(tt);
                if !record.elements.is_empty() {
                    if (record.elements.len() as u64) < tt.limits.min as u64 {
                        return Err(mismatch(import, "table below declared minimum"));
                    }
                    if let Some(max) = tt.limits.max {
                        if record.elements.len() as u64 > max as u64 {
                            return Err(mismatch(import, "table exceeds declared maximum"));
                        }
                    }
                    let elem_ty = tt.elem.value_type();
                    if record.elements.iter().any(|e| e.ty() != elem_ty) {
                        return Err(mismatch(import, "table element type"));
                    }
                    table.replace_elements(record.elements.clone());
                }
                inst.tables.push(table);
            }
            ImportDesc::Global(gt) => {
                let record = host
                    .global(&import.module, &import.name)
                    .ok_or_else(|| unresolved(import))?;
                if record.ty != *gt {
                    return Err(mismatch(import, "global type"));
                }
                inst.globals
                    .push(GlobalInstance::new(gt.clone(), record.value));
            }
        }
    }

    for (code_index, &type_idx) in module.functions.iter().enumerate() {
        inst.funcs.push(FuncInstance::Guest {
            type_idx,
            code_index,
        });
    }
    for tt in &module.tables {
        inst.tables.push(TableInstance::new(tt));
    }
    for mt in &module.memories {
        inst.memories.push(MemoryInstance::new(mt));
    }

    let func_count = module.total_funcs() as usize;
    for global in &module.globals {
        let value = eval_const_expr(&global.init, &inst.globals, func_count)?;
        if value.ty() != global.ty.val_type {
            return Err(LinkError::GlobalInitTypeMismatch);
        }
        inst.globals.push(GlobalInstance::new(global.ty.clone(), value));
    }

    for segment in &module.data {
        inst.data
            .push(DataInstance::new(segment.bytes.clone(), segment.is_passive()));
    }

    for segment in &module.data {
        if let DataMode::Active { memory, offset } = &segment.mode {
            let offset_val = eval_const_expr(offset, &inst.globals, func_count)?;
            let base = match offset_val {
                Value::I32(v) => v as u32,
                _ => return Err(LinkError::InvalidConstExpr("data segment offset must be i32")),
            };
            let mem = inst
                .memories
                .get_mut(*memory as usize)
                .ok_or(LinkError::MissingMemory)?;
            mem.init_from(base, &segment.bytes)
                .map_err(|_| LinkError::DataSegmentOutOfBounds)?;
        }
    }

    let total_funcs = inst.funcs.len();
    for segment in &module.elements {
        let offset_val = eval_const_expr(&segment.offset, &inst.globals, func_count)?;
        let base = match offset_val {
            Value::I32(v) => v as u32,
            _ => {
                return Err(LinkError::InvalidConstExpr(
                    "element segment offset must be i32",
                ))
            }
        };
        let table = inst
            .tables
            .get_mut(segment.table as usize)
            .ok_or(LinkError::MissingTable)?;
        if table.elem_type() != ValType::FuncRef {
            return Err(LinkError::NonFuncRefElementTarget);
        }
        if base as u64 + segment.funcs.len() as u64 > table.size() as u64 {
            return Err(LinkError::ElementSegmentOutOfBounds);
        }
        for (i, &func_idx) in segment.funcs.iter().enumerate() {
            if func_idx as usize >= total_funcs {
                return Err(LinkError::ElementFuncOutOfRange);
            }
            table
                .set(base + i as u32, Value::FuncRef(Some(func_idx)))
                .map_err(|_| LinkError::ElementSegmentOutOfBounds)?;
        }
    }

    for export in &module.exports {
        inst.exports.insert(export.name.clone(), export.desc);
    }

    if let Some(start_idx) = module.start {
        if start_idx as usize >= inst.funcs.len() {
            return Err(LinkError::StartIndexOutOfRange);
        }
        debug!("running start function {start_idx}");
        vm::execute_function(module, &mut inst, start_idx, &[], 0, max_call_depth)
            .map_err(LinkError::StartTrap)?;
    }

    Ok(inst)
}
