//! Function instances and the per-instantiation `Instance` record.

use std::collections::HashMap;
use std::sync::Arc;

use crate::host::HostFunc;
use crate::model::{ExportDesc, FuncType, Module, TypeIdx};

use super::{DataInstance, GlobalInstance, MemoryInstance, TableInstance};

/// A function instance: either defined by the module (its type index and an
/// index into the code section) or provided by the host.
#[derive(Clone)]
pub enum FuncInstance {
    Guest {
        type_idx: TypeIdx,
        /// Index into `Module::codes` (definition order, imports excluded).
        code_index: usize,
    },
    Host {
        ty: FuncType,
        func: Arc<HostFunc>,
    },
}

impl std::fmt::Debug for FuncInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FuncInstance::Guest {
                type_idx,
                code_index,
            } => f
                .debug_struct("Guest")
                .field("type_idx", type_idx)
                .field("code_index", code_index)
                .finish(),
            FuncInstance::Host { ty, .. } => f.debug_struct("Host").field("ty", ty).finish(),
        }
    }
}

impl FuncInstance {
    /// Resolve the function's signature against the owning module.
    pub fn signature<'a>(&'a self, module: &'a Module) -> Option<&'a FuncType> {
        match self {
            FuncInstance::Guest { type_idx, .. } => module.types.get(*type_idx as usize),
            FuncInstance::Host { ty, .. } => Some(ty),
        }
    }
}

/// Runtime state for one instantiated module. The vectors hold imported items
/// at their front, preserving the index-space discipline of the binary
/// format.
#[derive(Debug, Default)]
pub struct Instance {
    pub funcs: Vec<FuncInstance>,
    pub tables: Vec<TableInstance>,
    pub memories: Vec<MemoryInstance>,
    pub globals: Vec<GlobalInstance>,
    pub data: Vec<DataInstance>,
    pub exports: HashMap<String, ExportDesc>,
}

impl Instance {
    pub fn export(&self, name: &str) -> Option<ExportDesc> {
        self.exports.get(name).copied()
    }
}
