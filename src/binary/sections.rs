//! Section-level module decoder: header check, section walk, and payload
//! decoders for every standard section id (0..=12).

use super::{
    cursor::Cursor,
    leb128,
    reader::{read_len_prefixed_bytes, read_name, read_vec},
    BinaryReadError, Result,
};
use crate::model::{
    CodeBody, ConstExpr, DataMode, DataSegment, ElementSegment, Export, ExportDesc, FuncType,
    Global, GlobalType, Import, ImportDesc, Limits, LocalDecl, MemoryType, Module, RefType,
    TableType, ValType,
};

/// Standard section identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
    DataCount = 12,
}

impl SectionId {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => SectionId::Custom,
            1 => SectionId::Type,
            2 => SectionId::Import,
            3 => SectionId::Function,
            4 => SectionId::Table,
            5 => SectionId::Memory,
            6 => SectionId::Global,
            7 => SectionId::Export,
            8 => SectionId::Start,
            9 => SectionId::Element,
            10 => SectionId::Code,
            11 => SectionId::Data,
            12 => SectionId::DataCount,
            _ => return None,
        })
    }
}

/* ---------- Decoding helpers ---------- */

fn read_val_type(cur: &mut Cursor) -> Result<ValType> {
    let b = cur.read_u8()?;
    ValType::from_byte(b).ok_or(BinaryReadError::Malformed {
        offset: cur.offset(),
        msg: "invalid valtype",
    })
}

fn read_ref_type(cur: &mut Cursor) -> Result<RefType> {
    let b = cur.read_u8()?;
    match b {
        0x70 => Ok(RefType::FuncRef),
        0x6F => Ok(RefType::ExternRef),
        _ => Err(BinaryReadError::Malformed {
            offset: cur.offset(),
            msg: "invalid reftype",
        }),
    }
}

fn read_limits(cur: &mut Cursor) -> Result<Limits> {
    let tag = cur.read_u8()?;
    match tag {
        0x00 => {
            let min = leb128::read_uleb_u32(cur)?;
            Ok(Limits { min, max: None })
        }
        0x01 => {
            let min = leb128::read_uleb_u32(cur)?;
            let max = leb128::read_uleb_u32(cur)?;
            Ok(Limits {
                min,
                max: Some(max),
            })
        }
        _ => Err(BinaryReadError::Malformed {
            offset: cur.offset(),
            msg: "invalid limits tag",
        }),
    }
}

fn read_func_type(cur: &mut Cursor) -> Result<FuncType> {
    let form = cur.read_u8()?;
    if form != 0x60 {
        return Err(BinaryReadError::Malformed {
            offset: cur.offset(),
            msg: "expected functype (0x60)",
        });
    }
    let params = read_vec(cur, read_val_type)?;
    let results = read_vec(cur, read_val_type)?;
    Ok(FuncType { params, results })
}

fn read_table_type(cur: &mut Cursor) -> Result<TableType> {
    let elem = read_ref_type(cur)?;
    let limits = read_limits(cur)?;
    Ok(TableType { elem, limits })
}

fn read_memory_type(cur: &mut Cursor) -> Result<MemoryType> {
    let limits = read_limits(cur)?;
    Ok(MemoryType { limits })
}

fn read_global_type(cur: &mut Cursor) -> Result<GlobalType> {
    let val_type = read_val_type(cur)?;
    let mutable = match cur.read_u8()? {
        0x00 => false,
        0x01 => true,
        _ => {
            return Err(BinaryReadError::Malformed {
                offset: cur.offset(),
                msg: "invalid global mutability",
            })
        }
    };
    Ok(GlobalType { val_type, mutable })
}

/// Read a constant initializer expression terminated by `end` (0x0B).
fn read_const_expr(cur: &mut Cursor) -> Result<ConstExpr> {
    let op = cur.read_u8()?;
    let expr = match op {
        0x41 => ConstExpr::I32Const(leb128::read_sleb_i32(cur)?),
        0x42 => ConstExpr::I64Const(leb128::read_sleb_i64(cur)?),
        0x43 => ConstExpr::F32Const(cur.read_u32_le()?),
        0x44 => ConstExpr::F64Const(cur.read_u64_le()?),
        0x23 => ConstExpr::GlobalGet(leb128::read_uleb_u32(cur)?),
        0xD0 => {
            let heap_type = cur.read_u8()?;
            let ty = match heap_type {
                0x70 => ValType::FuncRef,
                0x6F => ValType::ExternRef,
                _ => {
                    return Err(BinaryReadError::Malformed {
                        offset: cur.offset(),
                        msg: "unsupported heap type for ref.null constant",
                    })
                }
            };
            ConstExpr::RefNull(ty)
        }
        0xD2 => ConstExpr::RefFunc(leb128::read_uleb_u32(cur)?),
        _ => {
            return Err(BinaryReadError::Malformed {
                offset: cur.offset(),
                msg: "unsupported constant expression opcode",
            })
        }
    };
    if cur.read_u8()? != 0x0B {
        return Err(BinaryReadError::Malformed {
            offset: cur.offset(),
            msg: "constant expression missing end opcode",
        });
    }
    Ok(expr)
}

/* ---------- Section readers ---------- */

fn read_type_section(cur: &mut Cursor) -> Result<Vec<FuncType>> {
    read_vec(cur, read_func_type)
}

fn read_import_section(cur: &mut Cursor) -> Result<(Vec<Import>, u32, u32, u32, u32)> {
    let mut funcs = 0u32;
    let mut tables = 0u32;
    let mut mems = 0u32;
    let mut globals = 0u32;

    let count = leb128::read_uleb_u32(cur)? as usize;
    let mut imports = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let module = read_name(cur)?;
        let name = read_name(cur)?;
        let kind = cur.read_u8()?;
        let desc = match kind {
            0x00 => {
                funcs += 1;
                ImportDesc::Func(leb128::read_uleb_u32(cur)?)
            }
            0x01 => {
                tables += 1;
                ImportDesc::Table(read_table_type(cur)?)
            }
            0x02 => {
                mems += 1;
                ImportDesc::Memory(read_memory_type(cur)?)
            }
            0x03 => {
                globals += 1;
                ImportDesc::Global(read_global_type(cur)?)
            }
            _ => {
                return Err(BinaryReadError::Malformed {
                    offset: cur.offset(),
                    msg: "invalid import kind",
                })
            }
        };
        imports.push(Import { module, name, desc });
    }
    Ok((imports, funcs, tables, mems, globals))
}

fn read_function_section(cur: &mut Cursor) -> Result<Vec<u32>> {
    read_vec(cur, leb128::read_uleb_u32)
}

fn read_table_section(cur: &mut Cursor) -> Result<Vec<TableType>> {
    read_vec(cur, read_table_type)
}

fn read_memory_section(cur: &mut Cursor) -> Result<Vec<MemoryType>> {
    read_vec(cur, read_memory_type)
}

fn read_global_section(cur: &mut Cursor) -> Result<Vec<Global>> {
    read_vec(cur, |c| {
        let ty = read_global_type(c)?;
        let init = read_const_expr(c)?;
        Ok(Global { ty, init })
    })
}

fn read_export_section(cur: &mut Cursor) -> Result<Vec<Export>> {
    read_vec(cur, |c| {
        let name = read_name(c)?;
        let kind = c.read_u8()?;
        let desc = match kind {
            0x00 => ExportDesc::Func(leb128::read_uleb_u32(c)?),
            0x01 => ExportDesc::Table(leb128::read_uleb_u32(c)?),
            0x02 => ExportDesc::Memory(leb128::read_uleb_u32(c)?),
            0x03 => ExportDesc::Global(leb128::read_uleb_u32(c)?),
            _ => {
                return Err(BinaryReadError::Malformed {
                    offset: c.offset(),
                    msg: "invalid export kind",
                })
            }
        };
        Ok(Export { name, desc })
    })
}

/// Element segments. The flags byte selects the mode: bit 0 marks
/// passive/declarative, bit 1 an explicit table index (active only), bit 2
/// element expressions (rejected). Only active non-declarative segments
/// produce an entry. Some encoders emit an elem-kind byte (0x00) before the
/// function vector; a value that is neither 0x00 nor 0x01 belongs to the
/// vector count itself.
fn read_element_section(cur: &mut Cursor) -> Result<Vec<ElementSegment>> {
    let count = leb128::read_uleb_u32(cur)? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let flags = leb128::read_uleb_u32(cur)?;
        let is_active = flags & 0x01 == 0;
        let has_table_index = is_active && flags & 0x02 != 0;
        let is_declarative = flags & 0x03 == 0x03;
        if flags & 0x04 != 0 {
            return Err(BinaryReadError::Malformed {
                offset: cur.offset(),
                msg: "element segments with expressions are not supported",
            });
        }

        let mut table = 0;
        let mut offset = ConstExpr::I32Const(0);
        if is_active {
            if has_table_index {
                table = leb128::read_uleb_u32(cur)?;
            }
            offset = read_const_expr(cur)?;
        }

        match cur.peek_u8()? {
            0x00 => {
                let _ = cur.read_u8()?;
            }
            0x01 => {
                return Err(BinaryReadError::Malformed {
                    offset: cur.offset(),
                    msg: "unsupported element kind",
                })
            }
            _ => {}
        }

        let funcs = read_vec(cur, leb128::read_uleb_u32)?;
        if is_active && !is_declarative {
            out.push(ElementSegment {
                table,
                offset,
                funcs,
            });
        }
    }
    Ok(out)
}

fn read_code_section(cur: &mut Cursor) -> Result<Vec<CodeBody>> {
    let count = leb128::read_uleb_u32(cur)? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let body_size = leb128::read_uleb_u32(cur)? as usize;
        let body_bytes = cur.read_bytes(body_size)?;
        let mut sub = Cursor::new(body_bytes);

        let local_groups = leb128::read_uleb_u32(&mut sub)? as usize;
        let mut locals = Vec::with_capacity(local_groups.min(1024));
        for _ in 0..local_groups {
            let count = leb128::read_uleb_u32(&mut sub)?;
            let val_type = read_val_type(&mut sub)?;
            locals.push(LocalDecl { count, val_type });
        }

        // Remaining bytes are the instruction stream ending with `end`.
        let body = sub.read_bytes(sub.remaining())?.to_vec();
        out.push(CodeBody { locals, body });
    }
    Ok(out)
}

/// Data segments. The leading varuint selects the mode: 0 is active against
/// memory 0, 1 is passive, 2 is active with an explicit memory index; any
/// larger value is the legacy encoding where the value itself is the memory
/// index.
fn read_data_section(cur: &mut Cursor) -> Result<Vec<DataSegment>> {
    let count = leb128::read_uleb_u32(cur)? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let mode_or_index = leb128::read_uleb_u32(cur)?;
        let mode = match mode_or_index {
            0 => DataMode::Active {
                memory: 0,
                offset: read_const_expr(cur)?,
            },
            1 => DataMode::Passive,
            2 => {
                let memory = leb128::read_uleb_u32(cur)?;
                DataMode::Active {
                    memory,
                    offset: read_const_expr(cur)?,
                }
            }
            legacy => DataMode::Active {
                memory: legacy,
                offset: read_const_expr(cur)?,
            },
        };
        let bytes = read_len_prefixed_bytes(cur)?;
        out.push(DataSegment { mode, bytes });
    }
    Ok(out)
}

/* ---------- Top-level module parser ---------- */

fn ensure_fully_consumed(cur: &Cursor) -> Result<()> {
    if cur.remaining() != 0 {
        return Err(BinaryReadError::Malformed {
            offset: cur.offset(),
            msg: "section payload not fully consumed",
        });
    }
    Ok(())
}

/// Parse a complete module from raw bytes into the decoded `Module`.
pub fn parse_module_from_bytes(bytes: &[u8]) -> Result<Module> {
    let mut cur = Cursor::new(bytes);

    // Magic "\0asm" and version 1.
    let magic = cur.read_u32_le()?;
    if magic != 0x6D73_6100 {
        return Err(BinaryReadError::Malformed {
            offset: 0,
            msg: "bad magic header",
        });
    }
    let version = cur.read_u32_le()?;
    if version != 0x0000_0001 {
        return Err(BinaryReadError::Malformed {
            offset: 4,
            msg: "unsupported version",
        });
    }

    let mut module = Module::default();
    let mut seen = [false; 13];
    let mut last_order_key: u8 = 0;

    while !cur.is_eof() {
        let id_byte = cur.read_u8()?;
        let id = SectionId::from_byte(id_byte).ok_or(BinaryReadError::Malformed {
            offset: cur.offset(),
            msg: "unknown section id",
        })?;
        let payload_len = leb128::read_uleb_u32(&mut cur)? as usize;
        let payload_offset = cur.offset();
        let payload = cur.read_bytes(payload_len)?;
        let mut pcur = Cursor::new(payload);

        if id == SectionId::Custom {
            // Custom sections are skipped wholesale.
            continue;
        }

        // Standard sections must be unique and appear in non-decreasing id
        // order. DataCount (12) sits between Element and Code in the binary
        // format despite its id, so it is exempt from the ordering key.
        let key = id_byte;
        if id != SectionId::DataCount {
            if key < last_order_key {
                return Err(BinaryReadError::Malformed {
                    offset: payload_offset,
                    msg: "section out of order",
                });
            }
            last_order_key = key;
        }
        if seen[key as usize] {
            return Err(BinaryReadError::Malformed {
                offset: payload_offset,
                msg: "duplicate section",
            });
        }
        seen[key as usize] = true;

        match id {
            SectionId::Custom => unreachable!(),
            SectionId::Type => module.types = read_type_section(&mut pcur)?,
            SectionId::Import => {
                let (imports, f, t, m, g) = read_import_section(&mut pcur)?;
                module.imports = imports;
                module.imported_funcs = f;
                module.imported_tables = t;
                module.imported_memories = m;
                module.imported_globals = g;
            }
            SectionId::Function => module.functions = read_function_section(&mut pcur)?,
            SectionId::Table => module.tables = read_table_section(&mut pcur)?,
            SectionId::Memory => module.memories = read_memory_section(&mut pcur)?,
            SectionId::Global => module.globals = read_global_section(&mut pcur)?,
            SectionId::Export => module.exports = read_export_section(&mut pcur)?,
            SectionId::Start => module.start = Some(leb128::read_uleb_u32(&mut pcur)?),
            SectionId::Element => module.elements = read_element_section(&mut pcur)?,
            SectionId::Code => module.codes = read_code_section(&mut pcur)?,
            SectionId::Data => module.data = read_data_section(&mut pcur)?,
            SectionId::DataCount => {
                // Accepted; the count is not used for execution.
                let _ = leb128::read_uleb_u32(&mut pcur)?;
            }
        }

        ensure_fully_consumed(&pcur)?;
    }

    if module.functions.len() != module.codes.len() {
        return Err(BinaryReadError::Malformed {
            offset: bytes.len(),
            msg: "function and code section length mismatch",
        });
    }

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataMode;

    fn uleb(mut v: u64) -> Vec<u8> {
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

    fn section(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![id];
        out.extend(uleb(payload.len() as u64));
        out.extend_from_slice(payload);
        out
    }

    fn with_header(sections: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        for s in sections {
            out.extend_from_slice(s);
        }
        out
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0x00, 0x61, 0x73, 0x6E, 0x01, 0x00, 0x00, 0x00];
        assert!(parse_module_from_bytes(&bytes).is_err());
    }

    #[test]
    fn empty_module_parses() {
        let m = parse_module_from_bytes(&with_header(&[])).unwrap();
        assert!(m.types.is_empty());
        assert!(m.codes.is_empty());
    }

    #[test]
    fn type_and_function_sections() {
        // (func (param i32 i32) (result i32)) with an empty body `end`.
        let types = section(1, &[0x01, 0x60, 0x02, 0x7F, 0x7F, 0x01, 0x7F]);
        let funcs = section(3, &[0x01, 0x00]);
        let code = section(10, &[0x01, 0x02, 0x00, 0x0B]);
        let m = parse_module_from_bytes(&with_header(&[types, funcs, code])).unwrap();
        assert_eq!(m.types.len(), 1);
        assert_eq!(m.types[0].params.len(), 2);
        assert_eq!(m.functions, vec![0]);
        assert_eq!(m.codes.len(), 1);
        assert_eq!(m.codes[0].body, vec![0x0B]);
    }

    #[test]
    fn function_code_count_mismatch_rejected() {
        let types = section(1, &[0x01, 0x60, 0x00, 0x00]);
        let funcs = section(3, &[0x01, 0x00]);
        let m = parse_module_from_bytes(&with_header(&[types, funcs]));
        assert!(m.is_err());
    }

    #[test]
    fn out_of_order_sections_rejected() {
        let funcs = section(3, &[0x00]);
        let types = section(1, &[0x00]);
        assert!(parse_module_from_bytes(&with_header(&[funcs, types])).is_err());
    }

    #[test]
    fn data_count_before_code_accepted() {
        let types = section(1, &[0x01, 0x60, 0x00, 0x00]);
        let funcs = section(3, &[0x01, 0x00]);
        let data_count = section(12, &[0x01]);
        let code = section(10, &[0x01, 0x02, 0x00, 0x0B]);
        let data = section(11, &[0x01, 0x01, 0x00]); // one passive empty segment
        let m =
            parse_module_from_bytes(&with_header(&[types, funcs, data_count, code, data])).unwrap();
        assert_eq!(m.data.len(), 1);
        assert!(m.data[0].is_passive());
    }

    #[test]
    fn passive_and_active_data_modes() {
        // active mem 0 at offset 4 with bytes [aa bb], then passive [cc].
        let payload = [
            0x02, // two segments
            0x00, 0x41, 0x04, 0x0B, 0x02, 0xAA, 0xBB, // active
            0x01, 0x01, 0xCC, // passive
        ];
        let mem = section(5, &[0x01, 0x00, 0x01]);
        let data = section(11, &payload);
        let m = parse_module_from_bytes(&with_header(&[mem, data])).unwrap();
        assert_eq!(m.data.len(), 2);
        assert!(matches!(
            m.data[0].mode,
            DataMode::Active {
                memory: 0,
                offset: ConstExpr::I32Const(4)
            }
        ));
        assert_eq!(m.data[0].bytes, vec![0xAA, 0xBB]);
        assert!(m.data[1].is_passive());
    }

    #[test]
    fn element_flags() {
        // Segment 0: active table 0, offset 0, funcs [0, 0].
        // Segment 1: declarative (flags 3), parsed but dropped.
        let types = section(1, &[0x01, 0x60, 0x00, 0x00]);
        let funcs = section(3, &[0x01, 0x00]);
        let table = section(4, &[0x01, 0x70, 0x00, 0x02]);
        let elems = section(
            9,
            &[
                0x02, // two segments
                0x00, 0x41, 0x00, 0x0B, 0x02, 0x00, 0x00, // active
                0x03, 0x00, 0x01, 0x00, // declarative, elemkind 0, one func
            ],
        );
        let code = section(10, &[0x01, 0x02, 0x00, 0x0B]);
        let m = parse_module_from_bytes(&with_header(&[types, funcs, table, elems, code])).unwrap();
        assert_eq!(m.elements.len(), 1);
        assert_eq!(m.elements[0].funcs, vec![0, 0]);
    }

    #[test]
    fn element_expressions_rejected() {
        let table = section(4, &[0x01, 0x70, 0x00, 0x01]);
        let elems = section(9, &[0x01, 0x04, 0x41, 0x00, 0x0B, 0x00]);
        assert!(parse_module_from_bytes(&with_header(&[table, elems])).is_err());
    }

    #[test]
    fn multiple_memories_accepted() {
        let mems = section(5, &[0x02, 0x00, 0x01, 0x00, 0x01]);
        let m = parse_module_from_bytes(&with_header(&[mems])).unwrap();
        assert_eq!(m.memories.len(), 2);
    }

    #[test]
    fn global_with_const_expr() {
        // (global i32 (i32.const -7)) mutable
        let globals = section(6, &[0x01, 0x7F, 0x01, 0x41, 0x79, 0x0B]);
        let m = parse_module_from_bytes(&with_header(&[globals])).unwrap();
        assert_eq!(m.globals.len(), 1);
        assert!(m.globals[0].ty.mutable);
        assert_eq!(m.globals[0].init, ConstExpr::I32Const(-7));
    }
}
