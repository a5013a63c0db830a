//! LEB128 variable-length unsigned integers.

use std::io::Read;

use crate::error::{CollectionError, Result};

/// Encode an unsigned 64-bit integer as LEB128 into `buf`.
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Folds one LEB128 byte into `result`. Returns true when the value is complete.
fn accumulate(result: &mut u64, shift: &mut u32, byte: u8) -> Result<bool> {
    let payload = (byte & 0x7F) as u64;
    if *shift >= 64 || (*shift == 63 && payload > 1) {
        return Err(CollectionError::CorruptIndex("varint overflow".into()));
    }
    *result |= payload << *shift;
    *shift += 7;
    Ok(byte & 0x80 == 0)
}

/// Decode a LEB128 unsigned integer from `buf` starting at `*pos`.
/// Advances `*pos` past the consumed bytes.
pub fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| CollectionError::CorruptIndex("truncated varint".into()))?;
        *pos += 1;
        if accumulate(&mut result, &mut shift, byte)? {
            return Ok(result);
        }
    }
}

/// Decode a LEB128 unsigned integer directly from a reader, one byte at a time.
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if accumulate(&mut result, &mut shift, byte[0])? {
            return Ok(result);
        }
    }
}
