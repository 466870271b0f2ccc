//! Global instance. Writes are checked here rather than by a validator:
//! an immutable global or a wrongly typed value traps at the use-site.

use crate::error::Trap;
use crate::model::{GlobalType, Value};

#[derive(Debug, Clone)]
pub struct GlobalInstance {
    ty: GlobalType,
    value: Value,
}

impl GlobalInstance {
    pub fn new(ty: GlobalType, init: Value) -> Self {
        Self { ty, value: init }
    }

    pub fn get(&self) -> Value {
        self.value
    }

    /// Replace the value. Traps on an immutable global or a value whose type
    /// differs from the declared one.
    pub fn set(&mut self, value: Value) -> Result<(), Trap> {
        if !self.ty.mutable {
            return Err(Trap::ImmutableGlobal);
        }
        if value.ty() != self.ty.val_type {
            return Err(Trap::OperandType(self.ty.val_type.name()));
        }
        self.value = value;
        Ok(())
    }

    pub fn ty(&self) -> &GlobalType {
        &self.ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValType;

    #[test]
    fn immutable_global_rejects_writes() {
        let mut g = GlobalInstance::new(GlobalType::new(ValType::I32, false), Value::I32(1));
        assert!(matches!(g.set(Value::I32(2)), Err(Trap::ImmutableGlobal)));
        assert_eq!(g.get(), Value::I32(1));
    }

    #[test]
    fn mutable_global_enforces_value_type() {
        let mut g = GlobalInstance::new(GlobalType::new(ValType::I64, true), Value::I64(0));
        assert!(matches!(
            g.set(Value::I32(1)),
            Err(Trap::OperandType("i64"))
        ));
        g.set(Value::I64(9)).unwrap();
        assert_eq!(g.get(), Value::I64(9));
    }
}
