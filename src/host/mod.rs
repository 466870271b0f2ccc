//! Host-import registry: (module, name)-keyed functions, memories, tables,
//! and globals that imports resolve against at instantiation.

pub mod func;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::model::{FuncType, GlobalType, MemoryType, TableType, Value};

pub use func::HostFunc;

pub(crate) struct HostFunction {
    pub ty: FuncType,
    pub func: Arc<HostFunc>,
}

pub(crate) struct HostMemory {
    pub ty: MemoryType,
    pub data: Vec<u8>,
}

pub(crate) struct HostTable {
    pub ty: TableType,
    pub elements: Vec<Value>,
}

pub(crate) struct HostGlobal {
    pub ty: GlobalType,
    pub value: Value,
}

#[derive(Default)]
pub(crate) struct HostRegistry {
    functions: HashMap<(String, String), HostFunction>,
    memories: HashMap<(String, String), HostMemory>,
    tables: HashMap<(String, String), HostTable>,
    globals: HashMap<(String, String), HostGlobal>,
}

fn key(module: &str, name: &str) -> (String, String) {
    (module.to_owned(), name.to_owned())
}

fn duplicate(module: &str, name: &str) -> RegistryError {
    RegistryError::Duplicate {
        module: module.to_owned(),
        name: name.to_owned(),
    }
}

impl HostRegistry {
    pub fn register_function(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
        func: Arc<HostFunc>,
    ) -> Result<(), RegistryError> {
        if self.functions.contains_key(&key(module, name)) {
            return Err(duplicate(module, name));
        }
        self.functions
            .insert(key(module, name), HostFunction { ty, func });
        Ok(())
    }

    pub fn register_memory(
        &mut self,
        module: &str,
        name: &str,
        ty: MemoryType,
        data: Vec<u8>,
    ) -> Result<(), RegistryError> {
        if self.memories.contains_key(&key(module, name)) {
            return Err(duplicate(module, name));
        }
        self.memories
            .insert(key(module, name), HostMemory { ty, data });
        Ok(())
    }

    pub fn register_table(
        &mut self,
        module: &str,
        name: &str,
        ty: TableType,
        elements: Vec<Value>,
    ) -> Result<(), RegistryError> {
        if self.tables.contains_key(&key(module, name)) {
            return Err(duplicate(module, name));
        }
        self.tables
            .insert(key(module, name), HostTable { ty, elements });
        Ok(())
    }

    pub fn register_global(
        &mut self,
        module: &str,
        name: &str,
        ty: GlobalType,
        value: Value,
    ) -> Result<(), RegistryError> {
        if value.ty() != ty.val_type {
            return Err(RegistryError::GlobalValueType {
                module: module.to_owned(),
                name: name.to_owned(),
            });
        }
        if self.globals.contains_key(&key(module, name)) {
            return Err(duplicate(module, name));
        }
        self.globals
            .insert(key(module, name), HostGlobal { ty, value });
        Ok(())
    }

    pub fn function(&self, module: &str, name: &str) -> Option<&HostFunction> {
        self.functions.get(&key(module, name))
    }

    pub fn memory(&self, module: &str, name: &str) -> Option<&HostMemory> {
        self.memories.get(&key(module, name))
    }

    pub fn table(&self, module: &str, name: &str) -> Option<&HostTable> {
        self.tables.get(&key(module, name))
    }

    pub fn global(&self, module: &str, name: &str) -> Option<&HostGlobal> {
        self.globals.get(&key(module, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValType;

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = HostRegistry::default();
        let ty = FuncType::default();
        reg.register_function("env", "f", ty.clone(), Arc::new(|_| Ok(Vec::new())))
            .unwrap();
        assert!(matches!(
            reg.register_function("env", "f", ty, Arc::new(|_| Ok(Vec::new()))),
            Err(RegistryError::Duplicate { .. })
        ));
    }

    #[test]
    fn global_value_type_checked() {
        let mut reg = HostRegistry::default();
        let gt = GlobalType::new(ValType::I64, false);
        assert!(matches!(
            reg.register_global("env", "g", gt, Value::I32(1)),
            Err(RegistryError::GlobalValueType { .. })
        ));
    }
}
