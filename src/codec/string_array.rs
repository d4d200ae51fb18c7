//! String codec (the three wire shapes `length_prefixed`/`null_terminated`/
//! `fixed`) plus small helpers shared by the array-kind dispatch in
//! `driver`, which owns the actual per-kind iteration loop since it needs
//! to recurse back into the driver for composite/union item types.

use crate::bitstream::{BitReader, BitWriter, Endianness};
use crate::error::{Error, FieldPath};
use crate::schema::validate::{PrimIntType, StrEncoding, StringDef, StringKind};
use crate::value::Value;

use super::primitive::{read_prim_uint, write_prim_uint};

fn decode_bytes_as_string(path: &FieldPath, bytes: &[u8], encoding: StrEncoding) -> Result<String, Error> {
    match encoding {
        StrEncoding::Utf8 => std::str::from_utf8(bytes)
            .map(|s| s.to_owned())
            .map_err(|source| Error::Utf8DecodeError {
                path: path.clone(),
                source,
            }),
        StrEncoding::Ascii => {
            for &b in bytes {
                if b >= 0x80 {
                    return Err(Error::AsciiOutOfRange {
                        path: path.clone(),
                        byte: b,
                    });
                }
            }
            Ok(bytes.iter().map(|&b| b as char).collect())
        }
    }
}

fn encode_string_bytes(path: &FieldPath, s: &str, encoding: StrEncoding) -> Result<Vec<u8>, Error> {
    match encoding {
        StrEncoding::Utf8 => Ok(s.as_bytes().to_vec()),
        StrEncoding::Ascii => {
            let mut out = Vec::with_capacity(s.len());
            for c in s.chars() {
                if c as u32 >= 0x80 {
                    return Err(Error::AsciiOutOfRange {
                        path: path.clone(),
                        byte: c as u8,
                    });
                }
                out.push(c as u8);
            }
            Ok(out)
        }
    }
}

pub fn decode_string(r: &mut BitReader, path: &FieldPath, def: &StringDef, endianness: Endianness) -> Result<Value, Error> {
    let bytes = match def.kind {
        StringKind::LengthPrefixed => {
            let len_ty = def.length_type.unwrap_or(PrimIntType::U32);
            let len = read_prim_uint(r, path, len_ty, endianness)? as usize;
            r.read_bytes(path, len)?
        }
        StringKind::Fixed => {
            let len = def.length.unwrap_or(0);
            let raw = r.read_bytes(path, len)?;
            let trimmed_end = raw.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
            raw[..trimmed_end].to_vec()
        }
        StringKind::NullTerminated => {
            let mut out = Vec::new();
            loop {
                let b = r.read_u8(path)?;
                if b == 0 {
                    break;
                }
                out.push(b);
            }
            out
        }
    };
    Ok(Value::Str(decode_bytes_as_string(path, &bytes, def.encoding)?))
}

pub fn encode_string(w: &mut BitWriter, path: &FieldPath, def: &StringDef, endianness: Endianness, value: &Value) -> Result<(), Error> {
    let s = value.as_str().unwrap_or("");
    let bytes = encode_string_bytes(path, s, def.encoding)?;
    match def.kind {
        StringKind::LengthPrefixed => {
            let len_ty = def.length_type.unwrap_or(PrimIntType::U32);
            write_prim_uint(w, path, len_ty, endianness, bytes.len() as u64)?;
            w.write_bytes(path, &bytes)
        }
        StringKind::Fixed => {
            let len = def.length.unwrap_or(bytes.len());
            if bytes.len() > len {
                return Err(Error::LengthExceedsPrefixRange {
                    path: path.clone(),
                    len: bytes.len(),
                    max: len,
                });
            }
            w.write_bytes(path, &bytes)?;
            let padding = vec![0u8; len - bytes.len()];
            w.write_bytes(path, &padding)
        }
        StringKind::NullTerminated => {
            w.write_bytes(path, &bytes)?;
            w.write_u8(path, 0)
        }
    }
}

/// The encoded byte length of a string value under `def`, used by
/// `length_of` computed fields.
pub fn string_encoded_len(path: &FieldPath, def: &StringDef, value: &Value) -> Result<usize, Error> {
    let s = value.as_str().unwrap_or("");
    let bytes = encode_string_bytes(path, s, def.encoding)?;
    Ok(match def.kind {
        StringKind::LengthPrefixed => def.length_type.unwrap_or(PrimIntType::U32).byte_width() + bytes.len(),
        StringKind::Fixed => def.length.unwrap_or(bytes.len()),
        StringKind::NullTerminated => bytes.len() + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::BitOrder;

    fn path() -> FieldPath {
        FieldPath::root("Test")
    }

    #[test]
    fn length_prefixed_utf8_roundtrip() {
        let def = StringDef {
            kind: StringKind::LengthPrefixed,
            encoding: StrEncoding::Utf8,
            length_type: Some(PrimIntType::U16),
            length: None,
        };
        let mut w = BitWriter::new(BitOrder::MsbFirst);
        encode_string(&mut w, &path(), &def, Endianness::Big, &Value::Str("\u{1f44b}Hi".to_owned())).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(bytes, vec![0x00, 0x06, 0xF0, 0x9F, 0x91, 0x8B, 0x48, 0x69]);

        let mut r = BitReader::new(&bytes, BitOrder::MsbFirst);
        let decoded = decode_string(&mut r, &path(), &def, Endianness::Big).unwrap();
        assert_eq!(decoded, Value::Str("\u{1f44b}Hi".to_owned()));
    }

    #[test]
    fn fixed_strings_trim_trailing_zero_padding() {
        let def = StringDef {
            kind: StringKind::Fixed,
            encoding: StrEncoding::Ascii,
            length_type: None,
            length: Some(8),
        };
        let mut w = BitWriter::new(BitOrder::MsbFirst);
        encode_string(&mut w, &path(), &def, Endianness::Big, &Value::Str("abc".to_owned())).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(bytes, b"abc\0\0\0\0\0");

        let mut r = BitReader::new(&bytes, BitOrder::MsbFirst);
        let decoded = decode_string(&mut r, &path(), &def, Endianness::Big).unwrap();
        assert_eq!(decoded, Value::Str("abc".to_owned()));
    }
}
