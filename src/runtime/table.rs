//! Table instance: a bounded vector of reference values.

use crate::model::{TableType, ValType, Value};

#[derive(Debug, Clone)]
pub struct TableInstance {
    elems: Vec<Value>,
    elem_ty: ValType,
    max: Option<u32>,
}

impl TableInstance {
    pub fn new(ty: &TableType) -> Self {
        let elem_ty = ty.elem.value_type();
        Self {
            elems: vec![Value::zero(elem_ty); ty.limits.min as usize],
            elem_ty,
            max: ty.limits.max,
        }
    }

    /// Replace the element vector with host-provided contents. The caller has
    /// already checked limits and element types.
    pub(crate) fn replace_elements(&mut self, elems: Vec<Value>) {
        self.elems = elems;
    }

    pub fn elem_type(&self) -> ValType {
        self.elem_ty
    }

    pub fn size(&self) -> u32 {
        self.elems.len() as u32
    }

    pub fn get(&self, idx: u32) -> Option<Value> {
        self.elems.get(idx as usize).copied()
    }

    pub fn set(&mut self, idx: u32, val: Value) -> Result<(), ()> {
        match self.elems.get_mut(idx as usize) {
            Some(slot) => {
                *slot = val;
                Ok(())
            }
            None => Err(()),
        }
    }

    /// Grow by `delta` elements initialized to `init`. Returns the previous
    /// size, or None past the declared maximum or on allocation failure.
    pub fn grow(&mut self, delta: u32, init: Value) -> Option<u32> {
        let prev = self.size();
        let new = prev.checked_add(delta)?;
        if let Some(max) = self.max {
            if new > max {
                return None;
            }
        }
        if self.elems.try_reserve_exact(delta as usize).is_err() {
            return None;
        }
        self.elems.resize(new as usize, init);
        Some(prev)
    }

    /// Fill `count` slots starting at `offset` with `val`.
    pub fn fill(&mut self, offset: u32, val: Value, count: u32) -> Result<(), ()> {
        if offset as u64 + count as u64 > self.elems.len() as u64 {
            return Err(());
        }
        let start = offset as usize;
        self.elems[start..start + count as usize].fill(val);
        Ok(())
    }

    /// Copy `count` slots from `src` to `dest` within this table; overlap is
    /// handled as if through a temporary.
    pub fn copy_within(&mut self, dest: u32, src: u32, count: u32) -> Result<(), ()> {
        let total = self.elems.len() as u64;
        if src as u64 + count as u64 > total || dest as u64 + count as u64 > total {
            return Err(());
        }
        let src = src as usize;
        self.elems
            .copy_within(src..src + count as usize, dest as usize);
        Ok(())
    }
}
