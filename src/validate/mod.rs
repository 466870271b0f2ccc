//! Structural validator run by `load` between decode and instantiation.
//! Checks index-space and shape invariants only; instruction typing is out of
//! scope, and type mismatches at use-sites trap during execution instead.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::model::{ExportDesc, FuncIdx, FuncType, ImportDesc, Limits, Module, TypeIdx};

type VResult<T> = Result<T, ValidationError>;

struct TypeEnv<'a> {
    m: &'a Module,
    /// Type indices of imported functions, in import order.
    func_import_types: Vec<TypeIdx>,
}

impl<'a> TypeEnv<'a> {
    fn new(m: &'a Module) -> Self {
        let func_import_types = m
            .imports
            .iter()
            .filter_map(|imp| match imp.desc {
                ImportDesc::Func(tidx) => Some(tidx),
                _ => None,
            })
            .collect();
        Self {
            m,
            func_import_types,
        }
    }

    /// Resolve an absolute function index to its declared type index.
    fn func_type_idx(&self, fidx: FuncIdx) -> VResult<TypeIdx> {
        if fidx < self.m.imported_funcs {
            self.func_import_types
                .get(fidx as usize)
                .copied()
                .ok_or(ValidationError::FuncTypeIndexOutOfRange)
        } else {
            self.m
                .functions
                .get((fidx - self.m.imported_funcs) as usize)
                .copied()
                .ok_or(ValidationError::FuncTypeIndexOutOfRange)
        }
    }

    fn func_type(&self, fidx: FuncIdx) -> VResult<&'a FuncType> {
        let tidx = self.func_type_idx(fidx)?;
        self.m
            .types
            .get(tidx as usize)
            .ok_or(ValidationError::FuncTypeIndexOutOfRange)
    }
}

fn check_limits(limits: &Limits) -> VResult<()> {
    if let Some(max) = limits.max {
        if max < limits.min {
            return Err(ValidationError::LimitsMaxBelowMin);
        }
    }
    Ok(())
}

pub fn validate_module(m: &Module) -> VResult<()> {
    let env = TypeEnv::new(m);

    for &tidx in &m.functions {
        if tidx as usize >= m.types.len() {
            return Err(ValidationError::FuncTypeIndexOutOfRange);
        }
    }

    for tt in &m.tables {
        check_limits(&tt.limits)?;
    }
    for mt in &m.memories {
        check_limits(&mt.limits)?;
    }

    let mut export_names = HashSet::new();
    for ex in &m.exports {
        if !export_names.insert(ex.name.as_str()) {
            return Err(ValidationError::DuplicateExport(ex.name.clone()));
        }
        match ex.desc {
            ExportDesc::Func(f) => {
                if f >= m.total_funcs() {
                    return Err(ValidationError::ExportIndexOutOfRange("function"));
                }
            }
            ExportDesc::Table(t) => {
                if t >= m.total_tables() {
                    return Err(ValidationError::ExportIndexOutOfRange("table"));
                }
            }
            ExportDesc::Memory(mem) => {
                if mem >= m.total_memories() {
                    return Err(ValidationError::ExportIndexOutOfRange("memory"));
                }
            }
            ExportDesc::Global(g) => {
                if g >= m.total_globals() {
                    return Err(ValidationError::ExportIndexOutOfRange("global"));
                }
            }
        }
    }

    if let Some(start_idx) = m.start {
        if start_idx >= m.total_funcs() {
            return Err(ValidationError::StartIndexOutOfRange);
        }
        let fty = env.func_type(start_idx)?;
        if !fty.params.is_empty() || !fty.results.is_empty() {
            return Err(ValidationError::StartSignature);
        }
    }

    for seg in &m.elements {
        if seg.table >= m.total_tables() {
            return Err(ValidationError::ElementTableOutOfRange);
        }
        for &func_idx in &seg.funcs {
            if func_idx >= m.total_funcs() {
                return Err(ValidationError::ElementFuncOutOfRange);
            }
        }
    }

    for seg in &m.data {
        if let crate::model::DataMode::Active { memory, .. } = seg.mode {
            if memory >= m.total_memories() {
                return Err(ValidationError::DataMemoryOutOfRange);
            }
        }
    }

    if m.functions.len() != m.codes.len() {
        return Err(ValidationError::FunctionCodeMismatch);
    }
    for code in &m.codes {
        if code.body.last() != Some(&0x0B) {
            return Err(ValidationError::MissingBodyEnd);
        }
    }

    Ok(())
}
