//! ULEB128/SLEB128 decoding with bounded target widths.

use super::{cursor::Cursor, BinaryReadError, Result};

/// Decode an unsigned LEB128 as u32 (at most 5 bytes).
pub fn read_uleb_u32(cur: &mut Cursor) -> Result<u32> {
    read_uleb_generic(cur, 32).map(|v| v as u32)
}

/// Decode an unsigned LEB128 as u64 (at most 10 bytes).
pub fn read_uleb_u64(cur: &mut Cursor) -> Result<u64> {
    read_uleb_generic(cur, 64)
}

/// Decode a signed LEB128 as i32 (at most 5 bytes).
pub fn read_sleb_i32(cur: &mut Cursor) -> Result<i32> {
    read_sleb_generic(cur, 32).map(|v| v as i32)
}

/// Decode a signed LEB128 as i64 (at most 10 bytes).
pub fn read_sleb_i64(cur: &mut Cursor) -> Result<i64> {
    read_sleb_generic(cur, 64).map(|v| v as i64)
}

fn read_uleb_generic(cur: &mut Cursor, bits: u32) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = cur.read_u8()?;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= bits {
            return Err(BinaryReadError::Leb128Overflow {
                target_bits: bits as u8,
                offset: cur.offset(),
            });
        }
    }
}

fn read_sleb_generic(cur: &mut Cursor, bits: u32) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = cur.read_u8()?;
        result |= ((byte & 0x7F) as i64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < bits && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
        if shift >= bits {
            return Err(BinaryReadError::Leb128Overflow {
                target_bits: bits as u8,
                offset: cur.offset(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb32_basic() {
        let mut c = Cursor::new(&[0xE5, 0x8E, 0x26]); // 624485
        assert_eq!(read_uleb_u32(&mut c).unwrap(), 624485);
    }

    #[test]
    fn sleb32_basic() {
        // -624485 encoded as SLEB128
        let mut c = Cursor::new(&[0x9B, 0xF1, 0x59]);
        assert_eq!(read_sleb_i32(&mut c).unwrap(), -624485);
    }

    #[test]
    fn sleb32_sign_extension() {
        let mut c = Cursor::new(&[0x7F]);
        assert_eq!(read_sleb_i32(&mut c).unwrap(), -1);
        let mut c = Cursor::new(&[0x3F]);
        assert_eq!(read_sleb_i32(&mut c).unwrap(), 63);
    }

    #[test]
    fn sleb64_min() {
        // i64::MIN is ten bytes ending in 0x7F
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7F];
        let mut c = Cursor::new(&bytes);
        assert_eq!(read_sleb_i64(&mut c).unwrap(), i64::MIN);
    }

    #[test]
    fn uleb32_overflow() {
        // Continuation bits keep the shift growing past 32.
        let bytes = [0xFFu8; 6];
        let mut c = Cursor::new(&bytes);
        assert!(matches!(
            read_uleb_u32(&mut c),
            Err(BinaryReadError::Leb128Overflow { .. })
        ));
    }

    #[test]
    fn uleb_truncated_input() {
        let mut c = Cursor::new(&[0x80]);
        assert!(matches!(
            read_uleb_u32(&mut c),
            Err(BinaryReadError::UnexpectedEof { .. })
        ));
    }
}
