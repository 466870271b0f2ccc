//! Operand stack. Every entry carries a provenance tag used only by the
//! store-operand heuristic and forwarded by `ref.is_null`; tags have no
//! effect on numeric results.

use crate::error::Trap;
use crate::model::{ValType, Value};

/// Where a stack entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueOrigin {
    #[default]
    Default,
    CallResult,
    LoadResult,
}

impl ValueOrigin {
    pub fn is_result(self) -> bool {
        matches!(self, ValueOrigin::CallResult | ValueOrigin::LoadResult)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StackValue {
    pub value: Value,
    pub origin: ValueOrigin,
}

#[derive(Debug, Default)]
pub struct OperandStack {
    entries: Vec<StackValue>,
}

impl OperandStack {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.push_tagged(value, ValueOrigin::Default);
    }

    #[inline]
    pub fn push_tagged(&mut self, value: Value, origin: ValueOrigin) {
        self.entries.push(StackValue { value, origin });
    }

    pub fn push_entry(&mut self, entry: StackValue) {
        self.entries.push(entry);
    }

    pub fn pop_entry(&mut self) -> Result<StackValue, Trap> {
        self.entries.pop().ok_or(Trap::StackUnderflow)
    }

    pub fn pop(&mut self) -> Result<Value, Trap> {
        Ok(self.pop_entry()?.value)
    }

    pub fn pop_i32(&mut self) -> Result<i32, Trap> {
        match self.pop()? {
            Value::I32(v) => Ok(v),
            _ => Err(Trap::OperandType("i32")),
        }
    }

    pub fn pop_i64(&mut self) -> Result<i64, Trap> {
        match self.pop()? {
            Value::I64(v) => Ok(v),
            _ => Err(Trap::OperandType("i64")),
        }
    }

    pub fn pop_f32(&mut self) -> Result<f32, Trap> {
        match self.pop()? {
            Value::F32(bits) => Ok(f32::from_bits(bits)),
            _ => Err(Trap::OperandType("f32")),
        }
    }

    pub fn pop_f64(&mut self) -> Result<f64, Trap> {
        match self.pop()? {
            Value::F64(bits) => Ok(f64::from_bits(bits)),
            _ => Err(Trap::OperandType("f64")),
        }
    }

    /// Pop a reference of the exact expected type.
    pub fn pop_ref(&mut self, expected: ValType) -> Result<Value, Trap> {
        let v = self.pop()?;
        if v.ty() != expected {
            return Err(Trap::OperandType(expected.name()));
        }
        Ok(v)
    }

    /// Pop a reference of either kind, keeping its provenance.
    pub fn pop_any_ref_entry(&mut self) -> Result<StackValue, Trap> {
        let entry = self.pop_entry()?;
        if !entry.value.ty().is_ref() {
            return Err(Trap::OperandType("reference"));
        }
        Ok(entry)
    }

    /// Pop `n` entries, returned bottom-to-top.
    pub fn pop_many(&mut self, n: usize) -> Result<Vec<StackValue>, Trap> {
        if self.entries.len() < n {
            return Err(Trap::StackUnderflow);
        }
        Ok(self.entries.split_off(self.entries.len() - n))
    }

    pub fn push_entries(&mut self, entries: Vec<StackValue>) {
        self.entries.extend(entries);
    }

    pub fn truncate(&mut self, height: usize) {
        self.entries.truncate(height);
    }

    fn top(&self, depth: usize) -> Option<&StackValue> {
        self.entries.get(self.entries.len().checked_sub(1 + depth)?)
    }

    /// The store-operand heuristic: some producers push the value beneath the
    /// address. When the second-from-top entry is a call or load result and
    /// the top is not, a store pops address first and value second.
    pub fn store_operands_reversed(&self) -> bool {
        match (self.top(0), self.top(1)) {
            (Some(top), Some(second)) => second.origin.is_result() && !top.origin.is_result(),
            _ => false,
        }
    }
}
