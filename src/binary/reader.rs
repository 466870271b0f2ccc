//! Higher-level binary helpers: length-prefixed vectors and UTF-8 names.

use super::{cursor::Cursor, leb128, BinaryReadError, Result};

/// Read a length-prefixed vector of raw bytes (u32 length via ULEB128).
pub fn read_len_prefixed_bytes(cur: &mut Cursor) -> Result<Vec<u8>> {
    let len = leb128::read_uleb_u32(cur)? as usize;
    Ok(cur.read_bytes(len)?.to_vec())
}

/// Read a UTF-8 name (length-prefixed bytes).
pub fn read_name(cur: &mut Cursor) -> Result<String> {
    let bytes = read_len_prefixed_bytes(cur)?;
    String::from_utf8(bytes).map_err(|_| BinaryReadError::InvalidUtf8 {
        offset: cur.offset(),
    })
}

/// Read a vector of T using the provided element reader closure.
/// Length is encoded as ULEB128 u32.
pub fn read_vec<T, F>(cur: &mut Cursor, mut elem: F) -> Result<Vec<T>>
where
    F: FnMut(&mut Cursor) -> Result<T>,
{
    let len = leb128::read_uleb_u32(cur)? as usize;
    let mut out = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        out.push(elem(cur)?);
    }
    Ok(out)
}
