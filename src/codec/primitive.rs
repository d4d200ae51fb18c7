//! Fixed-width integers/floats, bit-slices, bitfield containers, and
//! variable-length integers (DER, LEB128).
//!
//! Mirrors the teacher's `PrimitiveFieldTypeParser`/`UIntParser` split: one
//! function per wire shape, dispatched by the caller (here, `driver`)
//! rather than by a method on an enum, since the value produced varies
//! (`u64` vs `i64` vs `f64`) in a way a single trait method can't express
//! without boxing.

use crate::bitstream::{BitReader, BitWriter, Endianness};
use crate::error::{Error, FieldPath};
use crate::schema::validate::{PrimIntType, VarlengthEncoding};
use crate::value::Value;

pub fn read_prim_uint(
    r: &mut BitReader,
    path: &FieldPath,
    ty: PrimIntType,
    endianness: Endianness,
) -> Result<u64, Error> {
    Ok(match ty {
        PrimIntType::U8 => r.read_u8(path)? as u64,
        PrimIntType::U16 => r.read_u16(path, endianness)? as u64,
        PrimIntType::U32 => r.read_u32(path, endianness)? as u64,
        PrimIntType::U64 => r.read_u64(path, endianness)?,
        PrimIntType::I8 => r.read_i8(path)? as u64,
        PrimIntType::I16 => r.read_i16(path, endianness)? as u64,
        PrimIntType::I32 => r.read_i32(path, endianness)? as u64,
        PrimIntType::I64 => r.read_i64(path, endianness)? as u64,
    })
}

pub fn write_prim_uint(
    w: &mut BitWriter,
    path: &FieldPath,
    ty: PrimIntType,
    endianness: Endianness,
    value: u64,
) -> Result<(), Error> {
    match ty {
        PrimIntType::U8 => w.write_u8(path, value as u8),
        PrimIntType::U16 => w.write_u16(path, value as u16, endianness),
        PrimIntType::U32 => w.write_u32(path, value as u32, endianness),
        PrimIntType::U64 => w.write_u64(path, value, endianness),
        PrimIntType::I8 => w.write_i8(path, value as i8),
        PrimIntType::I16 => w.write_i16(path, value as i16, endianness),
        PrimIntType::I32 => w.write_i32(path, value as i32, endianness),
        PrimIntType::I64 => w.write_i64(path, value as i64, endianness),
    }
}

pub fn decode_primitive(
    r: &mut BitReader,
    path: &FieldPath,
    ty: PrimIntType,
    endianness: Endianness,
) -> Result<Value, Error> {
    Ok(if ty.is_signed() {
        Value::Int(match ty {
            PrimIntType::I8 => r.read_i8(path)? as i64,
            PrimIntType::I16 => r.read_i16(path, endianness)? as i64,
            PrimIntType::I32 => r.read_i32(path, endianness)? as i64,
            PrimIntType::I64 => r.read_i64(path, endianness)?,
            _ => unreachable!(),
        })
    } else {
        Value::UInt(read_prim_uint(r, path, ty, endianness)?)
    })
}

pub fn encode_primitive(
    w: &mut BitWriter,
    path: &FieldPath,
    ty: PrimIntType,
    endianness: Endianness,
    value: &Value,
) -> Result<(), Error> {
    let raw = if ty.is_signed() {
        value.as_i64().unwrap_or(0) as u64
    } else {
        value.as_u64().unwrap_or(0)
    };
    write_prim_uint(w, path, ty, endianness, raw)
}

pub fn decode_float32(r: &mut BitReader, path: &FieldPath, endianness: Endianness) -> Result<Value, Error> {
    Ok(Value::F32(ordered_float::OrderedFloat(r.read_f32(path, endianness)?)))
}

pub fn decode_float64(r: &mut BitReader, path: &FieldPath, endianness: Endianness) -> Result<Value, Error> {
    Ok(Value::F64(ordered_float::OrderedFloat(r.read_f64(path, endianness)?)))
}

pub fn encode_float32(w: &mut BitWriter, path: &FieldPath, endianness: Endianness, value: &Value) -> Result<(), Error> {
    let f = match value {
        Value::F32(v) => v.0,
        Value::F64(v) => v.0 as f32,
        _ => 0.0,
    };
    w.write_f32(path, f, endianness)
}

pub fn encode_float64(w: &mut BitWriter, path: &FieldPath, endianness: Endianness, value: &Value) -> Result<(), Error> {
    let f = match value {
        Value::F64(v) => v.0,
        Value::F32(v) => v.0 as f64,
        _ => 0.0,
    };
    w.write_f64(path, f, endianness)
}

/// Zero/sign-extend a `size`-bit slice read MSB-first into the value's
/// natural host width.
pub fn decode_bit(r: &mut BitReader, path: &FieldPath, signed: bool, size: u32) -> Result<Value, Error> {
    let raw = r.read_bits(path, size)?;
    if signed && size < 64 {
        let sign_bit = 1u64 << (size - 1);
        if raw & sign_bit != 0 {
            let extended = raw | (!0u64 << size);
            return Ok(Value::Int(extended as i64));
        }
    }
    if signed {
        Ok(Value::Int(raw as i64))
    } else {
        Ok(Value::UInt(raw))
    }
}

pub fn encode_bit(w: &mut BitWriter, size: u32, value: &Value) -> Result<(), Error> {
    let raw = value.as_i64().unwrap_or(0) as u64;
    let mask = if size >= 64 { u64::MAX } else { (1u64 << size) - 1 };
    w.write_bits(raw & mask, size);
    Ok(())
}

pub fn decode_bitfield(
    r: &mut BitReader,
    path: &FieldPath,
    size: u32,
    fields: &[crate::schema::validate::BitSlot],
) -> Result<Value, Error> {
    let start = r.cursor().bit_offset();
    let mut out = Vec::with_capacity(fields.len());
    for slot in fields {
        let slot_start = start + slot.offset as usize;
        let current = r.cursor().bit_offset();
        if slot_start < current {
            return Err(Error::MisalignedRead {
                path: path.clone(),
                bit_offset: slot_start,
            });
        }
        if slot_start > current {
            r.read_bits(path, (slot_start - current) as u32)?;
        }
        let raw = r.read_bits(path, slot.size)?;
        let value = if slot.signed && slot.size < 64 {
            let sign_bit = 1u64 << (slot.size - 1);
            if raw & sign_bit != 0 {
                Value::Int((raw | (!0u64 << slot.size)) as i64)
            } else {
                Value::Int(raw as i64)
            }
        } else if slot.signed {
            Value::Int(raw as i64)
        } else {
            Value::UInt(raw)
        };
        out.push((slot.name, value));
    }
    let consumed = r.cursor().bit_offset() - start;
    if consumed < size as usize {
        r.read_bits(path, (size as usize - consumed) as u32)?;
    }
    Ok(Value::Record(out))
}

pub fn encode_bitfield(
    w: &mut BitWriter,
    size: u32,
    fields: &[crate::schema::validate::BitSlot],
    value: &Value,
) -> Result<(), Error> {
    let start = w.cursor().bit_offset();
    for slot in fields {
        let slot_start = start + slot.offset as usize;
        let current = w.cursor().bit_offset();
        if slot_start > current {
            w.write_bits(0, (slot_start - current) as u32);
        }
        let raw = value
            .record_field(slot.name.as_str())
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as u64;
        let mask = if slot.size >= 64 { u64::MAX } else { (1u64 << slot.size) - 1 };
        w.write_bits(raw & mask, slot.size);
    }
    let consumed = w.cursor().bit_offset() - start;
    if consumed < size as usize {
        w.write_bits(0, (size as usize - consumed) as u32);
    }
    Ok(())
}

pub fn decode_varlength(r: &mut BitReader, path: &FieldPath, encoding: VarlengthEncoding) -> Result<Value, Error> {
    Ok(Value::UInt(match encoding {
        VarlengthEncoding::Der => decode_der_length(r, path)? as u64,
        VarlengthEncoding::Leb128 => decode_leb128(r, path)?,
    }))
}

pub fn encode_varlength(w: &mut BitWriter, path: &FieldPath, encoding: VarlengthEncoding, value: &Value) -> Result<(), Error> {
    let v = value.as_u64().unwrap_or(0);
    match encoding {
        VarlengthEncoding::Der => encode_der_length(w, path, v as usize),
        VarlengthEncoding::Leb128 => encode_leb128(w, path, v),
    }
}

/// ASN.1 DER length: short form (<128) is the one byte; long form's first
/// byte is `0x80 | n` followed by `n` big-endian length bytes.
pub fn decode_der_length(r: &mut BitReader, path: &FieldPath) -> Result<usize, Error> {
    let first = r.read_u8(path)?;
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    let n = (first & 0x7F) as usize;
    let mut len: usize = 0;
    for _ in 0..n {
        len = (len << 8) | r.read_u8(path)? as usize;
    }
    Ok(len)
}

pub fn encode_der_length(w: &mut BitWriter, path: &FieldPath, len: usize) -> Result<(), Error> {
    if len < 128 {
        w.write_u8(path, len as u8)
    } else {
        let bytes = len.to_be_bytes();
        let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
        let significant = &bytes[first_nonzero..];
        w.write_u8(path, 0x80 | significant.len() as u8)?;
        w.write_bytes(path, significant)
    }
}

fn decode_leb128(r: &mut BitReader, path: &FieldPath) -> Result<u64, Error> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = r.read_u8(path)?;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

fn encode_leb128(w: &mut BitWriter, path: &FieldPath, mut value: u64) -> Result<(), Error> {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        w.write_u8(path, byte)?;
        if value == 0 {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::BitOrder;

    fn path() -> FieldPath {
        FieldPath::root("Test")
    }

    #[test]
    fn der_short_and_long_form() {
        let mut w = BitWriter::new(BitOrder::MsbFirst);
        encode_der_length(&mut w, &path(), 5).unwrap();
        encode_der_length(&mut w, &path(), 300).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 5);

        let mut r = BitReader::new(&bytes, BitOrder::MsbFirst);
        assert_eq!(decode_der_length(&mut r, &path()).unwrap(), 5);
        assert_eq!(decode_der_length(&mut r, &path()).unwrap(), 300);
    }

    #[test]
    fn leb128_roundtrip() {
        let mut w = BitWriter::new(BitOrder::MsbFirst);
        encode_leb128(&mut w, &path(), 300).unwrap();
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes, BitOrder::MsbFirst);
        assert_eq!(decode_leb128(&mut r, &path()).unwrap(), 300);
    }

    #[test]
    fn signed_bit_slice_sign_extends() {
        let mut w = BitWriter::new(BitOrder::MsbFirst);
        w.write_bits(0b111, 3); // -1 in 3-bit two's complement
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes, BitOrder::MsbFirst);
        let v = decode_bit(&mut r, &path(), true, 3).unwrap();
        assert_eq!(v.as_i64(), Some(-1));
    }
}
