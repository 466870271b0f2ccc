//! Hand-rolled binary encoder used by the integration suites to assemble
//! .wasm modules without an external toolchain.

#![allow(dead_code)]

pub const I32: u8 = 0x7F;
pub const I64: u8 = 0x7E;
pub const F32: u8 = 0x7D;
pub const F64: u8 = 0x7C;
pub const FUNCREF: u8 = 0x70;
pub const EXTERNREF: u8 = 0x6F;

pub fn uleb(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn sleb(mut v: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn name(s: &str) -> Vec<u8> {
    let mut out = uleb(s.len() as u64);
    out.extend_from_slice(s.as_bytes());
    out
}

fn limits(min: u32, max: Option<u32>) -> Vec<u8> {
    let mut out = Vec::new();
    match max {
        None => {
            out.push(0x00);
            out.extend(uleb(min as u64));
        }
        Some(max) => {
            out.push(0x01);
            out.extend(uleb(min as u64));
            out.extend(uleb(max as u64));
        }
    }
    out
}

fn section(id: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = vec![id];
    out.extend(uleb(payload.len() as u64));
    out.extend(payload);
    out
}

fn vector(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut out = uleb(entries.len() as u64);
    for entry in entries {
        out.extend_from_slice(entry);
    }
    out
}

/* ---- Instruction shorthands ---- */

pub fn i32_const(v: i32) -> Vec<u8> {
    let mut out = vec![0x41];
    out.extend(sleb(v as i64));
    out
}

pub fn i64_const(v: i64) -> Vec<u8> {
    let mut out = vec![0x42];
    out.extend(sleb(v));
    out
}

pub fn f32_const(v: f32) -> Vec<u8> {
    let mut out = vec![0x43];
    out.extend_from_slice(&v.to_bits().to_le_bytes());
    out
}

pub fn f64_const(v: f64) -> Vec<u8> {
    let mut out = vec![0x44];
    out.extend_from_slice(&v.to_bits().to_le_bytes());
    out
}

pub fn local_get(i: u32) -> Vec<u8> {
    let mut out = vec![0x20];
    out.extend(uleb(i as u64));
    out
}

pub fn local_set(i: u32) -> Vec<u8> {
    let mut out = vec![0x21];
    out.extend(uleb(i as u64));
    out
}

pub fn call(i: u32) -> Vec<u8> {
    let mut out = vec![0x10];
    out.extend(uleb(i as u64));
    out
}

/// memarg with alignment 0 and the given offset.
pub fn memarg(offset: u32) -> Vec<u8> {
    let mut out = vec![0x00];
    out.extend(uleb(offset as u64));
    out
}

/// i32.store with alignment 0, offset 0.
pub fn i32_store() -> Vec<u8> {
    let mut out = vec![0x36];
    out.extend(memarg(0));
    out
}

/// i32.load with alignment 0, offset 0.
pub fn i32_load() -> Vec<u8> {
    let mut out = vec![0x28];
    out.extend(memarg(0));
    out
}

/// Concatenate instruction fragments into one body.
pub fn body(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

/* ---- Module builder ---- */

#[derive(Default)]
pub struct ModuleBuilder {
    types: Vec<Vec<u8>>,
    imports: Vec<Vec<u8>>,
    funcs: Vec<u32>,
    tables: Vec<Vec<u8>>,
    memories: Vec<Vec<u8>>,
    globals: Vec<Vec<u8>>,
    exports: Vec<Vec<u8>>,
    start: Option<u32>,
    elements: Vec<Vec<u8>>,
    codes: Vec<Vec<u8>>,
    data: Vec<Vec<u8>>,
    imported_funcs: u32,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function type; returns its type index.
    pub fn add_type(&mut self, params: &[u8], results: &[u8]) -> u32 {
        let mut entry = vec![0x60];
        entry.extend(uleb(params.len() as u64));
        entry.extend_from_slice(params);
        entry.extend(uleb(results.len() as u64));
        entry.extend_from_slice(results);
        self.types.push(entry);
        (self.types.len() - 1) as u32
    }

    /// Import a function; returns its function index. Must precede any
    /// `add_func` call to keep the index space in declaration order.
    pub fn import_func(&mut self, module: &str, item: &str, type_idx: u32) -> u32 {
        let mut entry = name(module);
        entry.extend(name(item));
        entry.push(0x00);
        entry.extend(uleb(type_idx as u64));
        self.imports.push(entry);
        self.imported_funcs += 1;
        self.imported_funcs - 1
    }

    pub fn import_memory(&mut self, module: &str, item: &str, min: u32, max: Option<u32>) {
        let mut entry = name(module);
        entry.extend(name(item));
        entry.push(0x02);
        entry.extend(limits(min, max));
        self.imports.push(entry);
    }

    pub fn import_table(&mut self, module: &str, item: &str, min: u32, max: Option<u32>) {
        let mut entry = name(module);
        entry.extend(name(item));
        entry.push(0x01);
        entry.push(FUNCREF);
        entry.extend(limits(min, max));
        self.imports.push(entry);
    }

    pub fn import_global(&mut self, module: &str, item: &str, val_type: u8, mutable: bool) {
        let mut entry = name(module);
        entry.extend(name(item));
        entry.push(0x03);
        entry.push(val_type);
        entry.push(mutable as u8);
        self.imports.push(entry);
    }

    /// Define a function with `locals` given as (count, valtype) groups and a
    /// body that the builder terminates with `end`. Returns the function
    /// index (import-adjusted).
    pub fn add_func(&mut self, type_idx: u32, locals: &[(u32, u8)], code: &[u8]) -> u32 {
        self.funcs.push(type_idx);
        let mut entry = uleb(locals.len() as u64);
        for &(count, ty) in locals {
            entry.extend(uleb(count as u64));
            entry.push(ty);
        }
        entry.extend_from_slice(code);
        entry.push(0x0B);
        let mut sized = uleb(entry.len() as u64);
        sized.extend(entry);
        self.codes.push(sized);
        self.imported_funcs + (self.funcs.len() - 1) as u32
    }

    pub fn add_table(&mut self, min: u32, max: Option<u32>) {
        let mut entry = vec![FUNCREF];
        entry.extend(limits(min, max));
        self.tables.push(entry);
    }

    pub fn add_externref_table(&mut self, min: u32, max: Option<u32>) {
        let mut entry = vec![EXTERNREF];
        entry.extend(limits(min, max));
        self.tables.push(entry);
    }

    pub fn add_memory(&mut self, min: u32, max: Option<u32>) {
        self.memories.push(limits(min, max));
    }

    /// Define a global with an initializer expression (without its `end`).
    pub fn add_global(&mut self, val_type: u8, mutable: bool, init: &[u8]) {
        let mut entry = vec![val_type, mutable as u8];
        entry.extend_from_slice(init);
        entry.push(0x0B);
        self.globals.push(entry);
    }

    pub fn export_func(&mut self, item: &str, index: u32) {
        let mut entry = name(item);
        entry.push(0x00);
        entry.extend(uleb(index as u64));
        self.exports.push(entry);
    }

    pub fn export_memory(&mut self, item: &str, index: u32) {
        let mut entry = name(item);
        entry.push(0x02);
        entry.extend(uleb(index as u64));
        self.exports.push(entry);
    }

    pub fn set_start(&mut self, index: u32) {
        self.start = Some(index);
    }

    /// Active element segment for table 0. The decoder treats a leading 0x01
    /// as an elem-kind byte, so callers use two or more entries.
    pub fn active_element(&mut self, offset: i32, func_indices: &[u32]) {
        let mut entry = vec![0x00];
        entry.extend(i32_const(offset));
        entry.push(0x0B);
        entry.extend(uleb(func_indices.len() as u64));
        for &idx in func_indices {
            entry.extend(uleb(idx as u64));
        }
        self.elements.push(entry);
    }

    pub fn active_data(&mut self, offset: i32, bytes: &[u8]) {
        let mut entry = vec![0x00];
        entry.extend(i32_const(offset));
        entry.push(0x0B);
        entry.extend(uleb(bytes.len() as u64));
        entry.extend_from_slice(bytes);
        self.data.push(entry);
    }

    /// Push a pre-encoded data-segment entry (for offsets that are not plain
    /// i32 constants).
    pub fn data_raw(&mut self, entry: Vec<u8>) {
        self.data.push(entry);
    }

    pub fn passive_data(&mut self, bytes: &[u8]) {
        let mut entry = vec![0x01];
        entry.extend(uleb(bytes.len() as u64));
        entry.extend_from_slice(bytes);
        self.data.push(entry);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        if !self.types.is_empty() {
            out.extend(section(1, vector(&self.types)));
        }
        if !self.imports.is_empty() {
            out.extend(section(2, vector(&self.imports)));
        }
        if !self.funcs.is_empty() {
            let entries: Vec<Vec<u8>> = self.funcs.iter().map(|&t| uleb(t as u64)).collect();
            out.extend(section(3, vector(&entries)));
        }
        if !self.tables.is_empty() {
            out.extend(section(4, vector(&self.tables)));
        }
        if !self.memories.is_empty() {
            out.extend(section(5, vector(&self.memories)));
        }
        if !self.globals.is_empty() {
            out.extend(section(6, vector(&self.globals)));
        }
        if !self.exports.is_empty() {
            out.extend(section(7, vector(&self.exports)));
        }
        if let Some(start) = self.start {
            out.extend(section(8, uleb(start as u64)));
        }
        if !self.elements.is_empty() {
            out.extend(section(9, vector(&self.elements)));
        }
        if !self.codes.is_empty() {
            out.extend(section(10, vector(&self.codes)));
        }
        if !self.data.is_empty() {
            out.extend(section(11, vector(&self.data)));
        }
        out
    }
}
