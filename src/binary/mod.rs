//! Binary-format utilities: byte cursor, LEB128, vector/name helpers, and the
//! section-level module decoder. This layer reports errors through a local
//! error type; the public API wraps it into `ParseError`.

pub mod cursor;
pub mod leb128;
pub mod reader;
pub mod sections;

use thiserror::Error;

/// Result alias for binary reading operations.
pub type Result<T> = core::result::Result<T, BinaryReadError>;

/// Errors that can occur while reading a WebAssembly binary stream.
#[derive(Debug, Error)]
pub enum BinaryReadError {
    #[error("unexpected end of input at offset {offset} ({needed} more bytes needed)")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("LEB128 value overflows {target_bits} bits at offset {offset}")]
    Leb128Overflow { target_bits: u8, offset: usize },

    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("malformed binary at offset {offset}: {msg}")]
    Malformed { offset: usize, msg: &'static str },
}
