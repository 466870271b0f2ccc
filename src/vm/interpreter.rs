//! The dispatch loop: executes a function by walking its code bytes with a
//! cursor, maintaining an operand stack and a control-frame stack. Structured
//! control flow is resolved by a forward scan (`analyze_block`) whose results
//! are cached on the frame. Calls recurse into the same loop, so the guest
//! call stack is the native call stack, bounded by a configurable depth.

use std::sync::Arc;

use crate::binary::{cursor::Cursor, leb128};
use crate::error::Trap;
use crate::model::{Module, ValType, Value};
use crate::runtime::{FuncInstance, Instance, MemoryInstance};
use crate::vm::frames::{BlockSignature, ControlFrame, FrameKind};
use crate::vm::instructions::{fc, op};
use crate::vm::stack::{OperandStack, ValueOrigin};

/* ---------- Immediate readers (decode failures in code are traps) ---------- */

fn imm_u32(cur: &mut Cursor) -> Result<u32, Trap> {
    leb128::read_uleb_u32(cur).map_err(|_| Trap::MalformedCode("bad unsigned immediate"))
}

fn imm_i32(cur: &mut Cursor) -> Result<i32, Trap> {
    leb128::read_sleb_i32(cur).map_err(|_| Trap::MalformedCode("bad i32 immediate"))
}

fn imm_i64(cur: &mut Cursor) -> Result<i64, Trap> {
    leb128::read_sleb_i64(cur).map_err(|_| Trap::MalformedCode("bad i64 immediate"))
}

fn imm_f32_bits(cur: &mut Cursor) -> Result<u32, Trap> {
    cur.read_u32_le()
        .map_err(|_| Trap::MalformedCode("bad f32 immediate"))
}

fn imm_f64_bits(cur: &mut Cursor) -> Result<u64, Trap> {
    cur.read_u64_le()
        .map_err(|_| Trap::MalformedCode("bad f64 immediate"))
}

fn imm_byte(cur: &mut Cursor) -> Result<u8, Trap> {
    cur.read_u8().map_err(|_| Trap::MalformedCode("bad immediate"))
}

struct MemArg {
    offset: u32,
}

/// Alignment is a hint only; it is read and discarded.
fn read_memarg(cur: &mut Cursor) -> Result<MemArg, Trap> {
    let _align = imm_u32(cur)?;
    let offset = imm_u32(cur)?;
    Ok(MemArg { offset })
}

fn seek(cur: &mut Cursor, offset: usize) -> Result<(), Trap> {
    cur.set_offset(offset)
        .map_err(|_| Trap::MalformedCode("jump target out of bounds"))
}

/* ---------- Block types ---------- */

/// Decode the block-type immediate: 0x40 for no result, a single value type,
/// or a non-negative type index whose function type supplies both parameters
/// and results.
fn parse_block_signature(cur: &mut Cursor, module: &Module) -> Result<BlockSignature, Trap> {
    let first = imm_byte(cur)?;
    match first {
        0x40 => Ok(BlockSignature::default()),
        0x7F | 0x7E | 0x7D | 0x7C => {
            let ty = ValType::from_byte(first).ok_or(Trap::MalformedCode("bad block type"))?;
            Ok(BlockSignature {
                params: Vec::new(),
                results: vec![ty],
            })
        }
        _ => {
            let idx = finish_uleb_u32(cur, first)?;
            let fty = module
                .types
                .get(idx as usize)
                .ok_or(Trap::MalformedCode("block type index out of range"))?;
            Ok(BlockSignature {
                params: fty.params.clone(),
                results: fty.results.clone(),
            })
        }
    }
}

fn skip_block_type(cur: &mut Cursor) -> Result<(), Trap> {
    let first = imm_byte(cur)?;
    match first {
        0x40 | 0x7F | 0x7E | 0x7D | 0x7C => Ok(()),
        _ => {
            let _ = finish_uleb_u32(cur, first)?;
            Ok(())
        }
    }
}

/// Continue a ULEB128 whose first byte has already been consumed.
fn finish_uleb_u32(cur: &mut Cursor, first: u8) -> Result<u32, Trap> {
    let mut result = (first & 0x7F) as u32;
    if first & 0x80 == 0 {
        return Ok(result);
    }
    let mut shift = 7u32;
    loop {
        let byte = imm_byte(cur)?;
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 32 {
            return Err(Trap::MalformedCode("block type index too large"));
        }
    }
}

/* ---------- Block analysis ---------- */

/// Offsets discovered by scanning a block body for its matching `else`/`end`.
struct BlockInfo {
    end_pc: usize,
    end_next_pc: usize,
    else_pc: Option<usize>,
    else_body_pc: Option<usize>,
}

/// Skip one instruction's immediates during the scan.
fn skip_immediate(opcode: u8, cur: &mut Cursor) -> Result<(), Trap> {
    match opcode {
        op::BLOCK | op::LOOP | op::IF => skip_block_type(cur)?,
        op::BR | op::BR_IF | op::CALL | op::REF_FUNC => {
            let _ = imm_u32(cur)?;
        }
        op::LOCAL_GET | op::LOCAL_SET | op::LOCAL_TEE | op::GLOBAL_GET | op::GLOBAL_SET => {
            let _ = imm_u32(cur)?;
        }
        op::TABLE_GET | op::TABLE_SET => {
            let _ = imm_u32(cur)?;
        }
        op::BR_TABLE => {
            let count = imm_u32(cur)?;
            for _ in 0..count {
                let _ = imm_u32(cur)?;
            }
            let _ = imm_u32(cur)?;
        }
        op::CALL_INDIRECT => {
            let _ = imm_u32(cur)?;
            let _ = imm_u32(cur)?;
        }
        0x28..=0x3E => {
            let _ = read_memarg(cur)?;
        }
        op::MEMORY_SIZE | op::MEMORY_GROW => {
            let _ = imm_u32(cur)?;
        }
        op::I32_CONST => {
            let _ = imm_i32(cur)?;
        }
        op::I64_CONST => {
            let _ = imm_i64(cur)?;
        }
        op::F32_CONST => {
            let _ = imm_f32_bits(cur)?;
        }
        op::F64_CONST => {
            let _ = imm_f64_bits(cur)?;
        }
        op::REF_NULL => {
            let _ = imm_byte(cur)?;
        }
        op::PREFIX_FC => {
            let sub = imm_u32(cur)?;
            match sub {
                fc::MEMORY_INIT | fc::MEMORY_COPY | fc::TABLE_INIT | fc::TABLE_COPY => {
                    let _ = imm_u32(cur)?;
                    let _ = imm_u32(cur)?;
                }
                fc::DATA_DROP
                | fc::MEMORY_FILL
                | fc::ELEM_DROP
                | fc::TABLE_GROW
                | fc::TABLE_SIZE
                | fc::TABLE_FILL => {
                    let _ = imm_u32(cur)?;
                }
                // Saturating truncations carry no immediates.
                _ => {}
            }
        }
        _ => {}
    }
    Ok(())
}

/// Scan from `body_start` to locate the matching `end` (and `else`, if any)
/// of a block whose header was just consumed. Nesting is tracked by depth;
/// every skipped opcode's immediates are decoded so constants cannot be
/// mistaken for control bytes.
fn analyze_block(code: &[u8], body_start: usize) -> Result<BlockInfo, Trap> {
    let mut cur = Cursor::new(code);
    seek(&mut cur, body_start)?;
    let mut depth = 1usize;
    let mut else_pc = None;
    let mut else_body_pc = None;
    loop {
        if cur.is_eof() {
            return Err(Trap::MalformedCode("unexpected end of code while scanning block"));
        }
        let opcode_offset = cur.offset();
        let opcode = imm_byte(&mut cur)?;
        match opcode {
            op::BLOCK | op::LOOP | op::IF => {
                skip_block_type(&mut cur)?;
                depth += 1;
            }
            op::ELSE => {
                if depth == 1 {
                    else_pc = Some(opcode_offset);
                    else_body_pc = Some(cur.offset());
                }
            }
            op::END => {
                depth -= 1;
                if depth == 0 {
                    return Ok(BlockInfo {
                        end_pc: opcode_offset,
                        end_next_pc: cur.offset(),
                        else_pc,
                        else_body_pc,
                    });
                }
            }
            other => skip_immediate(other, &mut cur)?,
        }
    }
}

/* ---------- Numeric helpers ---------- */

fn wasm_fmin_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() || b.is_sign_negative() {
            -0.0
        } else {
            0.0
        };
    }
    if a < b {
        a
    } else {
        b
    }
}

fn wasm_fmax_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() && b.is_sign_negative() {
            -0.0
        } else {
            0.0
        };
    }
    if a > b {
        a
    } else {
        b
    }
}

fn wasm_fmin_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() || b.is_sign_negative() {
            -0.0
        } else {
            0.0
        };
    }
    if a < b {
        a
    } else {
        b
    }
}

fn wasm_fmax_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() && b.is_sign_negative() {
            -0.0
        } else {
            0.0
        };
    }
    if a > b {
        a
    } else {
        b
    }
}

/// Round to nearest, ties to even. NaN, infinities, and zeros pass through
/// with their bit patterns intact.
fn wasm_nearest_f32(v: f32) -> f32 {
    if v.is_nan() || v.is_infinite() || v == 0.0 {
        return v;
    }
    v.round_ties_even()
}

fn wasm_nearest_f64(v: f64) -> f64 {
    if v.is_nan() || v.is_infinite() || v == 0.0 {
        return v;
    }
    v.round_ties_even()
}

fn trunc_f64_to_i32(v: f64) -> Result<i32, Trap> {
    if v.is_nan() {
        return Err(Trap::NanConversion);
    }
    let t = v.trunc();
    if !(-2_147_483_648.0..=2_147_483_647.0).contains(&t) {
        return Err(Trap::TruncOverflow);
    }
    Ok(t as i32)
}

fn trunc_f64_to_u32(v: f64) -> Result<u32, Trap> {
    if v.is_nan() {
        return Err(Trap::NanConversion);
    }
    let t = v.trunc();
    if !(0.0..=4_294_967_295.0).contains(&t) {
        return Err(Trap::TruncOverflow);
    }
    Ok(t as u32)
}

fn trunc_f64_to_i64(v: f64) -> Result<i64, Trap> {
    if v.is_nan() {
        return Err(Trap::NanConversion);
    }
    let t = v.trunc();
    if t < -9_223_372_036_854_775_808.0 || t >= 9_223_372_036_854_775_808.0 {
        return Err(Trap::TruncOverflow);
    }
    Ok(t as i64)
}

fn trunc_f64_to_u64(v: f64) -> Result<u64, Trap> {
    if v.is_nan() {
        return Err(Trap::NanConversion);
    }
    let t = v.trunc();
    if t < 0.0 || t >= 18_446_744_073_709_551_616.0 {
        return Err(Trap::TruncOverflow);
    }
    Ok(t as u64)
}

fn non_negative(v: i32, what: &'static str) -> Result<u32, Trap> {
    u32::try_from(v).map_err(|_| Trap::NegativeOperand(what))
}

/* ---------- Operand helpers ---------- */

fn binop_i32<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(i32, i32) -> Result<i32, Trap>,
{
    let rhs = stack.pop_i32()?;
    let lhs = stack.pop_i32()?;
    stack.push(Value::I32(f(lhs, rhs)?));
    Ok(())
}

fn binop_i64<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(i64, i64) -> Result<i64, Trap>,
{
    let rhs = stack.pop_i64()?;
    let lhs = stack.pop_i64()?;
    stack.push(Value::I64(f(lhs, rhs)?));
    Ok(())
}

fn binop_f32<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(f32, f32) -> f32,
{
    let rhs = stack.pop_f32()?;
    let lhs = stack.pop_f32()?;
    stack.push(Value::from_f32(f(lhs, rhs)));
    Ok(())
}

fn binop_f64<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(f64, f64) -> f64,
{
    let rhs = stack.pop_f64()?;
    let lhs = stack.pop_f64()?;
    stack.push(Value::from_f64(f(lhs, rhs)));
    Ok(())
}

fn unop_f32<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(f32) -> f32,
{
    let v = stack.pop_f32()?;
    stack.push(Value::from_f32(f(v)));
    Ok(())
}

fn unop_f64<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(f64) -> f64,
{
    let v = stack.pop_f64()?;
    stack.push(Value::from_f64(f(v)));
    Ok(())
}

fn push_bool(stack: &mut OperandStack, b: bool) {
    stack.push(Value::I32(b as i32));
}

fn cmp_i32<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(i32, i32) -> bool,
{
    let rhs = stack.pop_i32()?;
    let lhs = stack.pop_i32()?;
    push_bool(stack, f(lhs, rhs));
    Ok(())
}

fn cmp_u32<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(u32, u32) -> bool,
{
    let rhs = stack.pop_i32()? as u32;
    let lhs = stack.pop_i32()? as u32;
    push_bool(stack, f(lhs, rhs));
    Ok(())
}

fn cmp_i64<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(i64, i64) -> bool,
{
    let rhs = stack.pop_i64()?;
    let lhs = stack.pop_i64()?;
    push_bool(stack, f(lhs, rhs));
    Ok(())
}

fn cmp_u64<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(u64, u64) -> bool,
{
    let rhs = stack.pop_i64()? as u64;
    let lhs = stack.pop_i64()? as u64;
    push_bool(stack, f(lhs, rhs));
    Ok(())
}

fn cmp_f32<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(f32, f32) -> bool,
{
    let rhs = stack.pop_f32()?;
    let lhs = stack.pop_f32()?;
    push_bool(stack, f(lhs, rhs));
    Ok(())
}

fn cmp_f64<F>(stack: &mut OperandStack, f: F) -> Result<(), Trap>
where
    F: FnOnce(f64, f64) -> bool,
{
    let rhs = stack.pop_f64()?;
    let lhs = stack.pop_f64()?;
    push_bool(stack, f(lhs, rhs));
    Ok(())
}

/// Pop (value, base address) for a store, honoring the provenance heuristic:
/// when the second-from-top entry is a call or load result and the top is
/// not, the address is popped first.
fn store_operands<T>(
    stack: &mut OperandStack,
    pop: fn(&mut OperandStack) -> Result<T, Trap>,
) -> Result<(T, u32), Trap> {
    if stack.store_operands_reversed() {
        let base = stack.pop_i32()? as u32;
        let value = pop(stack)?;
        Ok((value, base))
    } else {
        let value = pop(stack)?;
        let base = stack.pop_i32()? as u32;
        Ok((value, base))
    }
}

fn memory0(inst: &mut Instance) -> Result<&mut MemoryInstance, Trap> {
    inst.memories
        .first_mut()
        .ok_or(Trap::IndexOutOfRange("memory"))
}

/// Effective address for a load/store of `width` bytes.
fn effective_addr(base: u32, offset: u32, width: usize, mem: &MemoryInstance) -> Result<u32, Trap> {
    let addr = base as u64 + offset as u64;
    if addr + width as u64 > mem.len() as u64 {
        return Err(Trap::MemoryOutOfBounds);
    }
    Ok(addr as u32)
}

/// Disjoint mutable references into one vector (i != j).
fn split_two<T>(items: &mut [T], i: usize, j: usize) -> (&mut T, &mut T) {
    if i < j {
        let (a, b) = items.split_at_mut(j);
        (&mut a[i], &mut b[0])
    } else {
        let (a, b) = items.split_at_mut(i);
        (&mut b[0], &mut a[j])
    }
}

/* ---------- Branching ---------- */

/// Branch to the `depth`-th enclosing label: pop the label arity (a loop's
/// parameters, any other frame's results), truncate to the captured height,
/// push the arity back, and redirect the cursor. Returns true when the target
/// was the function frame and the caller should return.
fn branch(
    depth: u32,
    cur: &mut Cursor,
    stack: &mut OperandStack,
    frames: &mut Vec<ControlFrame>,
) -> Result<bool, Trap> {
    let depth = depth as usize;
    if depth >= frames.len() {
        return Err(Trap::BranchDepth);
    }
    let target_index = frames.len() - 1 - depth;
    let target = frames[target_index].clone();

    let arity = if target.kind == FrameKind::Loop {
        target.signature.params.len()
    } else {
        target.signature.results.len()
    };
    let results = stack.pop_many(arity)?;
    frames.truncate(target_index + 1);
    stack.truncate(target.stack_height);
    stack.push_entries(results);

    if target.kind == FrameKind::Loop {
        seek(cur, target.start_pc)?;
        return Ok(false);
    }
    frames.truncate(target_index);
    seek(cur, target.end_next_pc)?;
    Ok(target.kind == FrameKind::Function)
}

fn collect_results(stack: &mut OperandStack, arity: usize) -> Result<Vec<Value>, Trap> {
    Ok(stack
        .pop_many(arity)?
        .into_iter()
        .map(|entry| entry.value)
        .collect())
}

/* ---------- Calls ---------- */

/// Pop the callee's arguments in reverse, recurse, and push its results
/// tagged as call results.
fn call_function(
    module: &Module,
    inst: &mut Instance,
    stack: &mut OperandStack,
    func_index: u32,
    depth: usize,
    max_depth: usize,
) -> Result<(), Trap> {
    let nparams = {
        let func = inst
            .funcs
            .get(func_index as usize)
            .ok_or(Trap::IndexOutOfRange("function"))?;
        func.signature(module)
            .ok_or(Trap::IndexOutOfRange("type"))?
            .params
            .len()
    };
    let mut call_args = Vec::with_capacity(nparams);
    for _ in 0..nparams {
        call_args.push(stack.pop()?);
    }
    call_args.reverse();
    let results = execute_function(module, inst, func_index, &call_args, depth + 1, max_depth)?;
    for value in results {
        stack.push_tagged(value, ValueOrigin::CallResult);
    }
    Ok(())
}

/* ---------- The dispatch loop ---------- */

pub fn execute_function(
    module: &Module,
    inst: &mut Instance,
    func_index: u32,
    args: &[Value],
    depth: usize,
    max_depth: usize,
) -> Result<Vec<Value>, Trap> {
    if depth >= max_depth {
        return Err(Trap::CallStackExhausted);
    }

    let func = inst
        .funcs
        .get(func_index as usize)
        .ok_or(Trap::IndexOutOfRange("function"))?;
    let (type_idx, code_index) = match func {
        FuncInstance::Host { func, .. } => {
            let callback = Arc::clone(func);
            return (callback.as_ref())(args);
        }
        FuncInstance::Guest {
            type_idx,
            code_index,
        } => (*type_idx, *code_index),
    };

    let func_ty = module
        .types
        .get(type_idx as usize)
        .ok_or(Trap::IndexOutOfRange("type"))?;
    if func_ty.params.len() != args.len() {
        return Err(Trap::ArgumentCount {
            expected: func_ty.params.len(),
            actual: args.len(),
        });
    }
    let results_ty = func_ty.results.clone();
    let code = module
        .codes
        .get(code_index)
        .ok_or(Trap::IndexOutOfRange("code"))?;
    let body: &[u8] = &code.body;

    let mut locals: Vec<Value> = Vec::with_capacity(
        args.len()
            + code
                .locals
                .iter()
                .map(|d| d.count as usize)
                .sum::<usize>(),
    );
    locals.extend_from_slice(args);
    for decl in &code.locals {
        for _ in 0..decl.count {
            locals.push(Value::zero(decl.val_type));
        }
    }

    let mut cur = Cursor::new(body);
    let mut stack = OperandStack::new();
    let mut frames: Vec<ControlFrame> = vec![ControlFrame {
        kind: FrameKind::Function,
        signature: BlockSignature {
            params: Vec::new(),
            results: results_ty.clone(),
        },
        start_pc: 0,
        end_pc: body.len().saturating_sub(1),
        end_next_pc: body.len(),
        else_pc: None,
        else_body_pc: None,
        stack_height: 0,
        executing_else: false,
    }];

    loop {
        let opcode = cur.read_u8().map_err(|_| Trap::EndOfCode)?;
        match opcode {
            op::UNREACHABLE => return Err(Trap::Unreachable),
            op::NOP => {}

            op::BLOCK | op::LOOP | op::IF => {
                let signature = parse_block_signature(&mut cur, module)?;
                let body_start = cur.offset();
                let info = analyze_block(body, body_start)?;
                let kind = match opcode {
                    op::BLOCK => FrameKind::Block,
                    op::LOOP => FrameKind::Loop,
                    _ => FrameKind::If,
                };
                let mut frame = ControlFrame {
                    kind,
                    signature,
                    start_pc: body_start,
                    end_pc: info.end_pc,
                    end_next_pc: info.end_next_pc,
                    else_pc: info.else_pc,
                    else_body_pc: info.else_body_pc,
                    stack_height: 0,
                    executing_else: false,
                };
                if kind == FrameKind::If {
                    let cond = stack.pop_i32()?;
                    frame.stack_height = stack.len().saturating_sub(frame.signature.params.len());
                    if cond == 0 {
                        match frame.else_body_pc {
                            Some(pc) => {
                                seek(&mut cur, pc)?;
                                frame.executing_else = true;
                            }
                            None => seek(&mut cur, frame.end_pc)?,
                        }
                    }
                } else {
                    frame.stack_height = stack.len().saturating_sub(frame.signature.params.len());
                }
                frames.push(frame);
            }

            op::ELSE => {
                // Reached when the taken arm of an `if` completes; skip over
                // the else body to the frame's end.
                let top = frames
                    .last()
                    .ok_or(Trap::MalformedCode("else without enclosing if"))?;
                if top.kind != FrameKind::If {
                    return Err(Trap::MalformedCode("else without enclosing if"));
                }
                let end_pc = top.end_pc;
                seek(&mut cur, end_pc)?;
            }

            op::END => {
                let frame = frames
                    .pop()
                    .ok_or(Trap::MalformedCode("control stack underflow at end"))?;
                let arity = frame.signature.results.len();
                let results = stack.pop_many(arity)?;
                stack.truncate(frame.stack_height);
                stack.push_entries(results);
                if frame.kind == FrameKind::Function {
                    return collect_results(&mut stack, arity);
                }
                seek(&mut cur, frame.end_next_pc)?;
            }

            op::BR => {
                let label = imm_u32(&mut cur)?;
                if branch(label, &mut cur, &mut stack, &mut frames)? {
                    return collect_results(&mut stack, results_ty.len());
                }
            }
            op::BR_IF => {
                let label = imm_u32(&mut cur)?;
                let cond = stack.pop_i32()?;
                if cond != 0 && branch(label, &mut cur, &mut stack, &mut frames)? {
                    return collect_results(&mut stack, results_ty.len());
                }
            }
            op::BR_TABLE => {
                let count = imm_u32(&mut cur)?;
                let mut targets = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    targets.push(imm_u32(&mut cur)?);
                }
                let default = imm_u32(&mut cur)?;
                let index = stack.pop_i32()?;
                let label = usize::try_from(index)
                    .ok()
                    .and_then(|i| targets.get(i).copied())
                    .unwrap_or(default);
                if branch(label, &mut cur, &mut stack, &mut frames)? {
                    return collect_results(&mut stack, results_ty.len());
                }
            }
            op::RETURN => {
                let label = (frames.len() - 1) as u32;
                if branch(label, &mut cur, &mut stack, &mut frames)? {
                    return collect_results(&mut stack, results_ty.len());
                }
            }

            op::CALL => {
                let index = imm_u32(&mut cur)?;
                call_function(module, inst, &mut stack, index, depth, max_depth)?;
            }
            op::CALL_INDIRECT => {
                let type_idx = imm_u32(&mut cur)?;
                let table_idx = imm_u32(&mut cur)?;
                let entry = stack.pop_i32()?;
                let func_index = {
                    let table = inst
                        .tables
                        .get(table_idx as usize)
                        .ok_or(Trap::IndexOutOfRange("table"))?;
                    if table.elem_type() != ValType::FuncRef {
                        return Err(Trap::NonFuncRefTable);
                    }
                    let entry = non_negative(entry, "call_indirect table index")?;
                    match table.get(entry) {
                        None => return Err(Trap::IndirectCallOutOfBounds),
                        Some(Value::FuncRef(None)) => return Err(Trap::NullFunction),
                        Some(Value::FuncRef(Some(index))) => index,
                        Some(_) => return Err(Trap::NonFuncRefTable),
                    }
                };
                {
                    let expected = module
                        .types
                        .get(type_idx as usize)
                        .ok_or(Trap::IndexOutOfRange("type"))?;
                    let actual = inst
                        .funcs
                        .get(func_index as usize)
                        .ok_or(Trap::IndexOutOfRange("function"))?
                        .signature(module)
                        .ok_or(Trap::IndexOutOfRange("type"))?;
                    if expected != actual {
                        return Err(Trap::IndirectSignatureMismatch);
                    }
                }
                call_function(module, inst, &mut stack, func_index, depth, max_depth)?;
            }

            op::DROP => {
                let _ = stack.pop()?;
            }
            op::SELECT => {
                let cond = stack.pop_i32()?;
                let v2 = stack.pop()?;
                let v1 = stack.pop()?;
                stack.push(if cond != 0 { v1 } else { v2 });
            }
            op::SELECT_T => return Err(Trap::UnsupportedOpcode(op::SELECT_T)),

            op::LOCAL_GET => {
                let index = imm_u32(&mut cur)? as usize;
                let value = *locals.get(index).ok_or(Trap::IndexOutOfRange("local"))?;
                stack.push(value);
            }
            op::LOCAL_SET => {
                let index = imm_u32(&mut cur)? as usize;
                let value = stack.pop()?;
                let slot = locals
                    .get_mut(index)
                    .ok_or(Trap::IndexOutOfRange("local"))?;
                *slot = value;
            }
            op::LOCAL_TEE => {
                let index = imm_u32(&mut cur)? as usize;
                let value = stack.pop()?;
                let slot = locals
                    .get_mut(index)
                    .ok_or(Trap::IndexOutOfRange("local"))?;
                *slot = value;
                stack.push(value);
            }

            op::GLOBAL_GET => {
                let index = imm_u32(&mut cur)? as usize;
                let global = inst
                    .globals
                    .get(index)
                    .ok_or(Trap::IndexOutOfRange("global"))?;
                stack.push(global.get());
            }
            op::GLOBAL_SET => {
                let index = imm_u32(&mut cur)? as usize;
                let value = stack.pop()?;
                let global = inst
                    .globals
                    .get_mut(index)
                    .ok_or(Trap::IndexOutOfRange("global"))?;
                global.set(value)?;
            }

            op::TABLE_GET => {
                let table_idx = imm_u32(&mut cur)? as usize;
                let index = non_negative(stack.pop_i32()?, "table.get offset")?;
                let table = inst
                    .tables
                    .get(table_idx)
                    .ok_or(Trap::IndexOutOfRange("table"))?;
                let value = table.get(index).ok_or(Trap::TableOutOfBounds)?;
                stack.push_tagged(value, ValueOrigin::LoadResult);
            }
            op::TABLE_SET => {
                let table_idx = imm_u32(&mut cur)? as usize;
                let elem_ty = inst
                    .tables
                    .get(table_idx)
                    .ok_or(Trap::IndexOutOfRange("table"))?
                    .elem_type();
                let value = stack.pop_ref(elem_ty)?;
                let index = non_negative(stack.pop_i32()?, "table.set offset")?;
                inst.tables[table_idx]
                    .set(index, value)
                    .map_err(|_| Trap::TableOutOfBounds)?;
            }

            op::I32_LOAD => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 4, mem)?;
                let v = mem.load_u32(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I32(v as i32), ValueOrigin::LoadResult);
            }
            op::I64_LOAD => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 8, mem)?;
                let v = mem.load_u64(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I64(v as i64), ValueOrigin::LoadResult);
            }
            op::F32_LOAD => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 4, mem)?;
                let bits = mem.load_u32(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::F32(bits), ValueOrigin::LoadResult);
            }
            op::F64_LOAD => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 8, mem)?;
                let bits = mem.load_u64(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::F64(bits), ValueOrigin::LoadResult);
            }
            op::I32_LOAD8_S => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 1, mem)?;
                let v = mem.load_u8(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I32(v as i8 as i32), ValueOrigin::LoadResult);
            }
            op::I32_LOAD8_U => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 1, mem)?;
                let v = mem.load_u8(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I32(v as i32), ValueOrigin::LoadResult);
            }
            op::I32_LOAD16_S => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 2, mem)?;
                let v = mem.load_u16(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I32(v as i16 as i32), ValueOrigin::LoadResult);
            }
            op::I32_LOAD16_U => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 2, mem)?;
                let v = mem.load_u16(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I32(v as i32), ValueOrigin::LoadResult);
            }
            op::I64_LOAD8_S => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 1, mem)?;
                let v = mem.load_u8(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I64(v as i8 as i64), ValueOrigin::LoadResult);
            }
            op::I64_LOAD8_U => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 1, mem)?;
                let v = mem.load_u8(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I64(v as i64), ValueOrigin::LoadResult);
            }
            op::I64_LOAD16_S => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 2, mem)?;
                let v = mem.load_u16(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I64(v as i16 as i64), ValueOrigin::LoadResult);
            }
            op::I64_LOAD16_U => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 2, mem)?;
                let v = mem.load_u16(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I64(v as i64), ValueOrigin::LoadResult);
            }
            op::I64_LOAD32_S => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 4, mem)?;
                let v = mem.load_u32(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I64(v as i32 as i64), ValueOrigin::LoadResult);
            }
            op::I64_LOAD32_U => {
                let memarg = read_memarg(&mut cur)?;
                let base = stack.pop_i32()? as u32;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 4, mem)?;
                let v = mem.load_u32(ea).map_err(|_| Trap::MemoryOutOfBounds)?;
                stack.push_tagged(Value::I64(v as i64), ValueOrigin::LoadResult);
            }

            op::I32_STORE => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_i32)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 4, mem)?;
                mem.store_u32(ea, value as u32)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
            op::I64_STORE => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_i64)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 8, mem)?;
                mem.store_u64(ea, value as u64)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
            op::F32_STORE => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_f32)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 4, mem)?;
                mem.store_u32(ea, value.to_bits())
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
            op::F64_STORE => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_f64)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 8, mem)?;
                mem.store_u64(ea, value.to_bits())
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
            op::I32_STORE8 => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_i32)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 1, mem)?;
                mem.store_u8(ea, (value as u32 & 0xFF) as u8)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
            op::I32_STORE16 => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_i32)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 2, mem)?;
                mem.store_u16(ea, (value as u32 & 0xFFFF) as u16)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
            op::I64_STORE8 => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_i64)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 1, mem)?;
                mem.store_u8(ea, (value as u64 & 0xFF) as u8)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
            op::I64_STORE16 => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_i64)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 2, mem)?;
                mem.store_u16(ea, (value as u64 & 0xFFFF) as u16)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
            op::I64_STORE32 => {
                let memarg = read_memarg(&mut cur)?;
                let (value, base) = store_operands(&mut stack, OperandStack::pop_i64)?;
                let mem = memory0(inst)?;
                let ea = effective_addr(base, memarg.offset, 4, mem)?;
                mem.store_u32(ea, (value as u64 & 0xFFFF_FFFF) as u32)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }

            op::MEMORY_SIZE => {
                let _index = imm_u32(&mut cur)?;
                let mem = memory0(inst)?;
                stack.push(Value::I32(mem.size_pages() as i32));
            }
            op::MEMORY_GROW => {
                let _index = imm_u32(&mut cur)?;
                let delta = stack.pop_i32()?;
                let mem = memory0(inst)?;
                let result = if delta < 0 {
                    -1
                } else {
                    match mem.grow(delta as u32) {
                        Some(prev) => prev as i32,
                        None => -1,
                    }
                };
                stack.push(Value::I32(result));
            }

            op::I32_CONST => {
                let v = imm_i32(&mut cur)?;
                stack.push(Value::I32(v));
            }
            op::I64_CONST => {
                let v = imm_i64(&mut cur)?;
                stack.push(Value::I64(v));
            }
            op::F32_CONST => {
                let bits = imm_f32_bits(&mut cur)?;
                stack.push(Value::F32(bits));
            }
            op::F64_CONST => {
                let bits = imm_f64_bits(&mut cur)?;
                stack.push(Value::F64(bits));
            }

            op::REF_NULL => {
                let heap_type = imm_byte(&mut cur)?;
                let value = match heap_type {
                    0x70 => Value::FuncRef(None),
                    0x6F => Value::ExternRef(None),
                    _ => return Err(Trap::MalformedCode("unsupported heap type for ref.null")),
                };
                stack.push(value);
            }
            op::REF_IS_NULL => {
                let entry = stack.pop_any_ref_entry()?;
                stack.push_tagged(Value::I32(entry.value.is_null_ref() as i32), entry.origin);
            }
            op::REF_FUNC => {
                let index = imm_u32(&mut cur)?;
                if index as usize >= inst.funcs.len() {
                    return Err(Trap::IndexOutOfRange("function"));
                }
                stack.push(Value::FuncRef(Some(index)));
            }

            op::I32_EQZ => {
                let v = stack.pop_i32()?;
                push_bool(&mut stack, v == 0);
            }
            op::I32_EQ => cmp_i32(&mut stack, |a, b| a == b)?,
            op::I32_NE => cmp_i32(&mut stack, |a, b| a != b)?,
            op::I32_LT_S => cmp_i32(&mut stack, |a, b| a < b)?,
            op::I32_LT_U => cmp_u32(&mut stack, |a, b| a < b)?,
            op::I32_GT_S => cmp_i32(&mut stack, |a, b| a > b)?,
            op::I32_GT_U => cmp_u32(&mut stack, |a, b| a > b)?,
            op::I32_LE_S => cmp_i32(&mut stack, |a, b| a <= b)?,
            op::I32_LE_U => cmp_u32(&mut stack, |a, b| a <= b)?,
            op::I32_GE_S => cmp_i32(&mut stack, |a, b| a >= b)?,
            op::I32_GE_U => cmp_u32(&mut stack, |a, b| a >= b)?,

            op::I64_EQZ => {
                let v = stack.pop_i64()?;
                push_bool(&mut stack, v == 0);
            }
            op::I64_EQ => cmp_i64(&mut stack, |a, b| a == b)?,
            op::I64_NE => cmp_i64(&mut stack, |a, b| a != b)?,
            op::I64_LT_S => cmp_i64(&mut stack, |a, b| a < b)?,
            op::I64_LT_U => cmp_u64(&mut stack, |a, b| a < b)?,
            op::I64_GT_S => cmp_i64(&mut stack, |a, b| a > b)?,
            op::I64_GT_U => cmp_u64(&mut stack, |a, b| a > b)?,
            op::I64_LE_S => cmp_i64(&mut stack, |a, b| a <= b)?,
            op::I64_LE_U => cmp_u64(&mut stack, |a, b| a <= b)?,
            op::I64_GE_S => cmp_i64(&mut stack, |a, b| a >= b)?,
            op::I64_GE_U => cmp_u64(&mut stack, |a, b| a >= b)?,

            op::F32_EQ => cmp_f32(&mut stack, |a, b| a == b)?,
            op::F32_NE => cmp_f32(&mut stack, |a, b| a != b)?,
            op::F32_LT => cmp_f32(&mut stack, |a, b| a < b)?,
            op::F32_GT => cmp_f32(&mut stack, |a, b| a > b)?,
            op::F32_LE => cmp_f32(&mut stack, |a, b| a <= b)?,
            op::F32_GE => cmp_f32(&mut stack, |a, b| a >= b)?,

            op::F64_EQ => cmp_f64(&mut stack, |a, b| a == b)?,
            op::F64_NE => cmp_f64(&mut stack, |a, b| a != b)?,
            op::F64_LT => cmp_f64(&mut stack, |a, b| a < b)?,
            op::F64_GT => cmp_f64(&mut stack, |a, b| a > b)?,
            op::F64_LE => cmp_f64(&mut stack, |a, b| a <= b)?,
            op::F64_GE => cmp_f64(&mut stack, |a, b| a >= b)?,

            op::I32_CLZ => {
                let v = stack.pop_i32()?;
                stack.push(Value::I32((v as u32).leading_zeros() as i32));
            }
            op::I32_CTZ => {
                let v = stack.pop_i32()?;
                stack.push(Value::I32((v as u32).trailing_zeros() as i32));
            }
            op::I32_POPCNT => {
                let v = stack.pop_i32()?;
                stack.push(Value::I32((v as u32).count_ones() as i32));
            }
            op::I32_ADD => binop_i32(&mut stack, |a, b| Ok(a.wrapping_add(b)))?,
            op::I32_SUB => binop_i32(&mut stack, |a, b| Ok(a.wrapping_sub(b)))?,
            op::I32_MUL => binop_i32(&mut stack, |a, b| Ok(a.wrapping_mul(b)))?,
            op::I32_DIV_S => binop_i32(&mut stack, |a, b| {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                if a == i32::MIN && b == -1 {
                    return Err(Trap::IntegerOverflow);
                }
                Ok(a / b)
            })?,
            op::I32_DIV_U => binop_i32(&mut stack, |a, b| {
                let (a, b) = (a as u32, b as u32);
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok((a / b) as i32)
            })?,
            op::I32_REM_S => binop_i32(&mut stack, |a, b| {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                if a == i32::MIN && b == -1 {
                    return Ok(0);
                }
                Ok(a % b)
            })?,
            op::I32_REM_U => binop_i32(&mut stack, |a, b| {
                let (a, b) = (a as u32, b as u32);
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok((a % b) as i32)
            })?,
            op::I32_AND => binop_i32(&mut stack, |a, b| Ok(a & b))?,
            op::I32_OR => binop_i32(&mut stack, |a, b| Ok(a | b))?,
            op::I32_XOR => binop_i32(&mut stack, |a, b| Ok(a ^ b))?,
            op::I32_SHL => binop_i32(&mut stack, |a, b| Ok(a.wrapping_shl(b as u32)))?,
            op::I32_SHR_S => binop_i32(&mut stack, |a, b| Ok(a.wrapping_shr(b as u32)))?,
            op::I32_SHR_U => {
                binop_i32(&mut stack, |a, b| {
                    Ok((a as u32).wrapping_shr(b as u32) as i32)
                })?
            }
            op::I32_ROTL => binop_i32(&mut stack, |a, b| {
                Ok((a as u32).rotate_left(b as u32) as i32)
            })?,
            op::I32_ROTR => binop_i32(&mut stack, |a, b| {
                Ok((a as u32).rotate_right(b as u32) as i32)
            })?,

            op::I64_CLZ => {
                let v = stack.pop_i64()?;
                stack.push(Value::I64((v as u64).leading_zeros() as i64));
            }
            op::I64_CTZ => {
                let v = stack.pop_i64()?;
                stack.push(Value::I64((v as u64).trailing_zeros() as i64));
            }
            op::I64_POPCNT => {
                let v = stack.pop_i64()?;
                stack.push(Value::I64((v as u64).count_ones() as i64));
            }
            op::I64_ADD => binop_i64(&mut stack, |a, b| Ok(a.wrapping_add(b)))?,
            op::I64_SUB => binop_i64(&mut stack, |a, b| Ok(a.wrapping_sub(b)))?,
            op::I64_MUL => binop_i64(&mut stack, |a, b| Ok(a.wrapping_mul(b)))?,
            op::I64_DIV_S => binop_i64(&mut stack, |a, b| {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                if a == i64::MIN && b == -1 {
                    return Err(Trap::IntegerOverflow);
                }
                Ok(a / b)
            })?,
            op::I64_DIV_U => binop_i64(&mut stack, |a, b| {
                let (a, b) = (a as u64, b as u64);
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok((a / b) as i64)
            })?,
            op::I64_REM_S => binop_i64(&mut stack, |a, b| {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                if a == i64::MIN && b == -1 {
                    return Ok(0);
                }
                Ok(a % b)
            })?,
            op::I64_REM_U => binop_i64(&mut stack, |a, b| {
                let (a, b) = (a as u64, b as u64);
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                Ok((a % b) as i64)
            })?,
            op::I64_AND => binop_i64(&mut stack, |a, b| Ok(a & b))?,
            op::I64_OR => binop_i64(&mut stack, |a, b| Ok(a | b))?,
            op::I64_XOR => binop_i64(&mut stack, |a, b| Ok(a ^ b))?,
            op::I64_SHL => binop_i64(&mut stack, |a, b| Ok(a.wrapping_shl(b as u32)))?,
            op::I64_SHR_S => binop_i64(&mut stack, |a, b| Ok(a.wrapping_shr(b as u32)))?,
            op::I64_SHR_U => {
                binop_i64(&mut stack, |a, b| {
                    Ok((a as u64).wrapping_shr(b as u32) as i64)
                })?
            }
            op::I64_ROTL => binop_i64(&mut stack, |a, b| {
                Ok((a as u64).rotate_left(b as u32) as i64)
            })?,
            op::I64_ROTR => binop_i64(&mut stack, |a, b| {
                Ok((a as u64).rotate_right(b as u32) as i64)
            })?,

            op::F32_ABS => unop_f32(&mut stack, f32::abs)?,
            op::F32_NEG => unop_f32(&mut stack, |v| -v)?,
            op::F32_CEIL => unop_f32(&mut stack, f32::ceil)?,
            op::F32_FLOOR => unop_f32(&mut stack, f32::floor)?,
            op::F32_TRUNC => unop_f32(&mut stack, f32::trunc)?,
            op::F32_NEAREST => unop_f32(&mut stack, wasm_nearest_f32)?,
            op::F32_SQRT => unop_f32(&mut stack, f32::sqrt)?,
            op::F32_ADD => binop_f32(&mut stack, |a, b| a + b)?,
            op::F32_SUB => binop_f32(&mut stack, |a, b| a - b)?,
            op::F32_MUL => binop_f32(&mut stack, |a, b| a * b)?,
            op::F32_DIV => binop_f32(&mut stack, |a, b| a / b)?,
            op::F32_MIN => binop_f32(&mut stack, wasm_fmin_f32)?,
            op::F32_MAX => binop_f32(&mut stack, wasm_fmax_f32)?,
            op::F32_COPYSIGN => binop_f32(&mut stack, f32::copysign)?,

            op::F64_ABS => unop_f64(&mut stack, f64::abs)?,
            op::F64_NEG => unop_f64(&mut stack, |v| -v)?,
            op::F64_CEIL => unop_f64(&mut stack, f64::ceil)?,
            op::F64_FLOOR => unop_f64(&mut stack, f64::floor)?,
            op::F64_TRUNC => unop_f64(&mut stack, f64::trunc)?,
            op::F64_NEAREST => unop_f64(&mut stack, wasm_nearest_f64)?,
            op::F64_SQRT => unop_f64(&mut stack, f64::sqrt)?,
            op::F64_ADD => binop_f64(&mut stack, |a, b| a + b)?,
            op::F64_SUB => binop_f64(&mut stack, |a, b| a - b)?,
            op::F64_MUL => binop_f64(&mut stack, |a, b| a * b)?,
            op::F64_DIV => binop_f64(&mut stack, |a, b| a / b)?,
            op::F64_MIN => binop_f64(&mut stack, wasm_fmin_f64)?,
            op::F64_MAX => binop_f64(&mut stack, wasm_fmax_f64)?,
            op::F64_COPYSIGN => binop_f64(&mut stack, f64::copysign)?,

            op::I32_WRAP_I64 => {
                let v = stack.pop_i64()?;
                stack.push(Value::I32(v as i32));
            }
            op::I32_TRUNC_F32_S => {
                let v = stack.pop_f32()?;
                stack.push(Value::I32(trunc_f64_to_i32(v as f64)?));
            }
            op::I32_TRUNC_F32_U => {
                let v = stack.pop_f32()?;
                stack.push(Value::I32(trunc_f64_to_u32(v as f64)? as i32));
            }
            op::I32_TRUNC_F64_S => {
                let v = stack.pop_f64()?;
                stack.push(Value::I32(trunc_f64_to_i32(v)?));
            }
            op::I32_TRUNC_F64_U => {
                let v = stack.pop_f64()?;
                stack.push(Value::I32(trunc_f64_to_u32(v)? as i32));
            }
            op::I64_EXTEND_I32_S => {
                let v = stack.pop_i32()?;
                stack.push(Value::I64(v as i64));
            }
            op::I64_EXTEND_I32_U => {
                let v = stack.pop_i32()?;
                stack.push(Value::I64(v as u32 as i64));
            }
            op::I64_TRUNC_F32_S => {
                let v = stack.pop_f32()?;
                stack.push(Value::I64(trunc_f64_to_i64(v as f64)?));
            }
            op::I64_TRUNC_F32_U => {
                let v = stack.pop_f32()?;
                stack.push(Value::I64(trunc_f64_to_u64(v as f64)? as i64));
            }
            op::I64_TRUNC_F64_S => {
                let v = stack.pop_f64()?;
                stack.push(Value::I64(trunc_f64_to_i64(v)?));
            }
            op::I64_TRUNC_F64_U => {
                let v = stack.pop_f64()?;
                stack.push(Value::I64(trunc_f64_to_u64(v)? as i64));
            }
            op::F32_CONVERT_I32_S => {
                let v = stack.pop_i32()?;
                stack.push(Value::from_f32(v as f32));
            }
            op::F32_CONVERT_I32_U => {
                let v = stack.pop_i32()?;
                stack.push(Value::from_f32(v as u32 as f32));
            }
            op::F32_CONVERT_I64_S => {
                let v = stack.pop_i64()?;
                stack.push(Value::from_f32(v as f32));
            }
            op::F32_CONVERT_I64_U => {
                let v = stack.pop_i64()?;
                stack.push(Value::from_f32(v as u64 as f32));
            }
            op::F32_DEMOTE_F64 => {
                let v = stack.pop_f64()?;
                stack.push(Value::from_f32(v as f32));
            }
            op::F64_CONVERT_I32_S => {
                let v = stack.pop_i32()?;
                stack.push(Value::from_f64(v as f64));
            }
            op::F64_CONVERT_I32_U => {
                let v = stack.pop_i32()?;
                stack.push(Value::from_f64(v as u32 as f64));
            }
            op::F64_CONVERT_I64_S => {
                let v = stack.pop_i64()?;
                stack.push(Value::from_f64(v as f64));
            }
            op::F64_CONVERT_I64_U => {
                let v = stack.pop_i64()?;
                stack.push(Value::from_f64(v as u64 as f64));
            }
            op::F64_PROMOTE_F32 => {
                let v = stack.pop_f32()?;
                stack.push(Value::from_f64(v as f64));
            }
            op::I32_REINTERPRET_F32 => {
                let v = stack.pop()?;
                match v {
                    Value::F32(bits) => stack.push(Value::I32(bits as i32)),
                    _ => return Err(Trap::OperandType("f32")),
                }
            }
            op::I64_REINTERPRET_F64 => {
                let v = stack.pop()?;
                match v {
                    Value::F64(bits) => stack.push(Value::I64(bits as i64)),
                    _ => return Err(Trap::OperandType("f64")),
                }
            }
            op::F32_REINTERPRET_I32 => {
                let v = stack.pop_i32()?;
                stack.push(Value::F32(v as u32));
            }
            op::F64_REINTERPRET_I64 => {
                let v = stack.pop_i64()?;
                stack.push(Value::F64(v as u64));
            }

            op::I32_EXTEND8_S => {
                let v = stack.pop_i32()?;
                stack.push(Value::I32(v as i8 as i32));
            }
            op::I32_EXTEND16_S => {
                let v = stack.pop_i32()?;
                stack.push(Value::I32(v as i16 as i32));
            }
            op::I64_EXTEND8_S => {
                let v = stack.pop_i64()?;
                stack.push(Value::I64(v as i8 as i64));
            }
            op::I64_EXTEND16_S => {
                let v = stack.pop_i64()?;
                stack.push(Value::I64(v as i16 as i64));
            }
            op::I64_EXTEND32_S => {
                let v = stack.pop_i64()?;
                stack.push(Value::I64(v as i32 as i64));
            }

            op::PREFIX_FC => {
                let sub = imm_u32(&mut cur)?;
                execute_prefixed(sub, &mut cur, inst, &mut stack)?;
            }

            other => return Err(Trap::UnsupportedOpcode(other)),
        }
    }
}

/// The 0xFC-prefixed suite: saturating truncations and bulk memory/table
/// operations.
fn execute_prefixed(
    sub: u32,
    cur: &mut Cursor,
    inst: &mut Instance,
    stack: &mut OperandStack,
) -> Result<(), Trap> {
    match sub {
        // Saturating truncations: NaN becomes 0, out-of-range values clamp.
        // Rust's float-to-int casts implement exactly these semantics.
        fc::I32_TRUNC_SAT_F32_S => {
            let v = stack.pop_f32()?;
            stack.push(Value::I32(v as i32));
        }
        fc::I32_TRUNC_SAT_F32_U => {
            let v = stack.pop_f32()?;
            stack.push(Value::I32(v as u32 as i32));
        }
        fc::I32_TRUNC_SAT_F64_S => {
            let v = stack.pop_f64()?;
            stack.push(Value::I32(v as i32));
        }
        fc::I32_TRUNC_SAT_F64_U => {
            let v = stack.pop_f64()?;
            stack.push(Value::I32(v as u32 as i32));
        }
        fc::I64_TRUNC_SAT_F32_S => {
            let v = stack.pop_f32()?;
            stack.push(Value::I64(v as i64));
        }
        fc::I64_TRUNC_SAT_F32_U => {
            let v = stack.pop_f32()?;
            stack.push(Value::I64(v as u64 as i64));
        }
        fc::I64_TRUNC_SAT_F64_S => {
            let v = stack.pop_f64()?;
            stack.push(Value::I64(v as i64));
        }
        fc::I64_TRUNC_SAT_F64_U => {
            let v = stack.pop_f64()?;
            stack.push(Value::I64(v as u64 as i64));
        }

        fc::MEMORY_INIT => {
            let data_idx = imm_u32(cur)? as usize;
            let mem_idx = imm_u32(cur)? as usize;
            if mem_idx >= inst.memories.len() {
                return Err(Trap::IndexOutOfRange("memory"));
            }
            let len = non_negative(stack.pop_i32()?, "memory.init size")?;
            let src = non_negative(stack.pop_i32()?, "memory.init source offset")?;
            let dest = non_negative(stack.pop_i32()?, "memory.init destination")?;
            let segment = inst
                .data
                .get(data_idx)
                .ok_or(Trap::IndexOutOfRange("data segment"))?;
            if segment.is_dropped() {
                return Err(Trap::DroppedDataSegment);
            }
            let bytes = segment.bytes();
            if src as u64 + len as u64 > bytes.len() as u64 {
                return Err(Trap::MemoryOutOfBounds);
            }
            let slice = &bytes[src as usize..src as usize + len as usize];
            inst.memories[mem_idx]
                .init_from(dest, slice)
                .map_err(|_| Trap::MemoryOutOfBounds)?;
        }
        fc::DATA_DROP => {
            let data_idx = imm_u32(cur)? as usize;
            let segment = inst
                .data
                .get_mut(data_idx)
                .ok_or(Trap::IndexOutOfRange("data segment"))?;
            segment.drop_segment();
        }
        fc::MEMORY_COPY => {
            let dest_idx = imm_u32(cur)? as usize;
            let src_idx = imm_u32(cur)? as usize;
            if dest_idx >= inst.memories.len() || src_idx >= inst.memories.len() {
                return Err(Trap::IndexOutOfRange("memory"));
            }
            let len = non_negative(stack.pop_i32()?, "memory.copy size")?;
            let src = non_negative(stack.pop_i32()?, "memory.copy source")?;
            let dest = non_negative(stack.pop_i32()?, "memory.copy destination")?;
            if dest_idx == src_idx {
                inst.memories[dest_idx]
                    .copy_within(dest, src, len)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            } else {
                let (dest_mem, src_mem) = split_two(&mut inst.memories, dest_idx, src_idx);
                if src as u64 + len as u64 > src_mem.len() as u64 {
                    return Err(Trap::MemoryOutOfBounds);
                }
                let slice = &src_mem.data()[src as usize..src as usize + len as usize];
                dest_mem
                    .init_from(dest, slice)
                    .map_err(|_| Trap::MemoryOutOfBounds)?;
            }
        }
        fc::MEMORY_FILL => {
            let mem_idx = imm_u32(cur)? as usize;
            if mem_idx >= inst.memories.len() {
                return Err(Trap::IndexOutOfRange("memory"));
            }
            let len = non_negative(stack.pop_i32()?, "memory.fill size")?;
            let value = stack.pop_i32()?;
            let dest = non_negative(stack.pop_i32()?, "memory.fill destination")?;
            inst.memories[mem_idx]
                .fill(dest, (value as u32 & 0xFF) as u8, len)
                .map_err(|_| Trap::MemoryOutOfBounds)?;
        }

        fc::TABLE_INIT => return Err(Trap::UnsupportedPrefixedOpcode(sub)),
        fc::ELEM_DROP => return Err(Trap::UnsupportedPrefixedOpcode(sub)),

        fc::TABLE_COPY => {
            let dest_idx = imm_u32(cur)? as usize;
            let src_idx = imm_u32(cur)? as usize;
            if dest_idx >= inst.tables.len() || src_idx >= inst.tables.len() {
                return Err(Trap::IndexOutOfRange("table"));
            }
            let count = non_negative(stack.pop_i32()?, "table.copy count")?;
            let src = non_negative(stack.pop_i32()?, "table.copy source offset")?;
            let dest = non_negative(stack.pop_i32()?, "table.copy destination offset")?;
            if inst.tables[dest_idx].elem_type() != inst.tables[src_idx].elem_type() {
                return Err(Trap::TableTypeMismatch);
            }
            if dest_idx == src_idx {
                inst.tables[dest_idx]
                    .copy_within(dest, src, count)
                    .map_err(|_| Trap::TableOutOfBounds)?;
            } else {
                let (dest_table, src_table) = split_two(&mut inst.tables, dest_idx, src_idx);
                if src as u64 + count as u64 > src_table.size() as u64
                    || dest as u64 + count as u64 > dest_table.size() as u64
                {
                    return Err(Trap::TableOutOfBounds);
                }
                for i in 0..count {
                    let value = src_table.get(src + i).ok_or(Trap::TableOutOfBounds)?;
                    dest_table
                        .set(dest + i, value)
                        .map_err(|_| Trap::TableOutOfBounds)?;
                }
            }
        }
        fc::TABLE_GROW => {
            let table_idx = imm_u32(cur)? as usize;
            let elem_ty = inst
                .tables
                .get(table_idx)
                .ok_or(Trap::IndexOutOfRange("table"))?
                .elem_type();
            let delta = non_negative(stack.pop_i32()?, "table.grow delta")?;
            let init = stack.pop_ref(elem_ty)?;
            let result = match inst.tables[table_idx].grow(delta, init) {
                Some(prev) => prev as i32,
                None => -1,
            };
            stack.push(Value::I32(result));
        }
        fc::TABLE_SIZE => {
            let table_idx = imm_u32(cur)? as usize;
            let size = inst
                .tables
                .get(table_idx)
                .ok_or(Trap::IndexOutOfRange("table"))?
                .size();
            stack.push_tagged(Value::I32(size as i32), ValueOrigin::LoadResult);
        }
        fc::TABLE_FILL => {
            let table_idx = imm_u32(cur)? as usize;
            let elem_ty = inst
                .tables
                .get(table_idx)
                .ok_or(Trap::IndexOutOfRange("table"))?
                .elem_type();
            let count = non_negative(stack.pop_i32()?, "table.fill count")?;
            let value = stack.pop_ref(elem_ty)?;
            let offset = non_negative(stack.pop_i32()?, "table.fill offset")?;
            inst.tables[table_idx]
                .fill(offset, value, count)
                .map_err(|_| Trap::TableOutOfBounds)?;
        }

        other => return Err(Trap::UnsupportedPrefixedOpcode(other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_block_finds_matching_end() {
        // block; i32.const 1; if; nop; else; nop; end; end
        let code = [
            0x41, 0x01, // i32.const 1
            0x04, 0x40, // if (empty)
            0x01, // nop
            0x05, // else
            0x01, // nop
            0x0B, // end (if)
            0x0B, // end (outer)
        ];
        let info = analyze_block(&code, 0).unwrap();
        assert_eq!(info.end_pc, 8);
        assert_eq!(info.end_next_pc, 9);
        assert_eq!(info.else_pc, None); // nested else belongs to the if

        let inner = analyze_block(&code, 4).unwrap();
        assert_eq!(inner.else_pc, Some(5));
        assert_eq!(inner.else_body_pc, Some(6));
        assert_eq!(inner.end_pc, 7);
    }

    #[test]
    fn analyze_block_skips_constants_that_look_like_end() {
        // i64.const 0x0B (the payload byte equals END) then end.
        let code = [0x42, 0x0B, 0x0B];
        let info = analyze_block(&code, 0).unwrap();
        assert_eq!(info.end_pc, 2);
    }

    #[test]
    fn analyze_block_unterminated_is_trap() {
        let code = [0x01, 0x01];
        assert!(matches!(
            analyze_block(&code, 0),
            Err(Trap::MalformedCode(_))
        ));
    }

    #[test]
    fn nearest_ties_to_even() {
        assert_eq!(wasm_nearest_f64(2.5), 2.0);
        assert_eq!(wasm_nearest_f64(3.5), 4.0);
        assert_eq!(wasm_nearest_f64(-2.5), -2.0);
        assert!(wasm_nearest_f64(f64::NAN).is_nan());
    }

    #[test]
    fn fmin_fmax_zero_rules() {
        assert!(wasm_fmin_f32(-0.0, 0.0).is_sign_negative());
        assert!(!wasm_fmax_f32(-0.0, 0.0).is_sign_negative());
        assert!(wasm_fmax_f32(-0.0, -0.0).is_sign_negative());
        assert!(wasm_fmin_f32(f32::NAN, 1.0).is_nan());
        assert!(wasm_fmax_f32(1.0, f32::NAN).is_nan());
    }

    #[test]
    fn trapping_truncation_bounds() {
        assert!(matches!(
            trunc_f64_to_i32(f64::NAN),
            Err(Trap::NanConversion)
        ));
        assert!(matches!(
            trunc_f64_to_i32(2_147_483_648.0),
            Err(Trap::TruncOverflow)
        ));
        assert_eq!(trunc_f64_to_i32(-2_147_483_648.9).unwrap(), i32::MIN);
        assert_eq!(trunc_f64_to_u32(-0.9).unwrap(), 0);
        assert!(matches!(trunc_f64_to_u32(-1.0), Err(Trap::TruncOverflow)));
        assert_eq!(
            trunc_f64_to_i64(-9_223_372_036_854_775_808.0).unwrap(),
            i64::MIN
        );
        assert!(matches!(
            trunc_f64_to_i64(9_223_372_036_854_775_808.0),
            Err(Trap::TruncOverflow)
        ));
    }
}
