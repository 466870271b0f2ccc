//! Control frames for structured control flow.

use crate::model::ValType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Function,
    Block,
    Loop,
    If,
}

/// A block's type: parameters and results. The label arity of a loop is its
/// parameter list; for every other frame kind it is the result list.
#[derive(Debug, Clone, Default)]
pub struct BlockSignature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

/// One entry of the control stack, carrying the offsets discovered by block
/// analysis and the operand-stack height captured on entry (for `if`, after
/// the condition was consumed; block parameters sit above the height).
#[derive(Debug, Clone)]
pub struct ControlFrame {
    pub kind: FrameKind,
    pub signature: BlockSignature,
    /// First byte of the body (after the block-type immediate). Branches to a
    /// loop re-enter here.
    pub start_pc: usize,
    /// Offset of the matching `end` opcode.
    pub end_pc: usize,
    /// Offset just past the matching `end`.
    pub end_next_pc: usize,
    /// Offset of the `else` opcode, if present.
    pub else_pc: Option<usize>,
    /// Offset just past the `else` opcode, if present.
    pub else_body_pc: Option<usize>,
    pub stack_height: usize,
    pub executing_else: bool,
}
