//! Position-based lazy fields ("instances") and the bounded sub-streams
//! they and back-references both rely on.
//!
//! Grounded on the teacher's `AlignedCursor`/`StreamReader` pattern of
//! constructing a fresh, bounded reader over the same backing buffer
//! rather than mutating a shared cursor; generalized here to seek to an
//! arbitrary absolute offset from the root buffer rather than always
//! continuing from the current position.

use crate::bitstream::{BitOrder, BitReader};
use crate::error::{Error, FieldPath};
use crate::expr::{Expr, Scope};

/// Evaluates an instance's `position` expression (literal, field
/// reference, or simple arithmetic) against the enclosing composite's
/// already-decoded scope.
pub fn compute_position(position: &Expr, scope: &Scope, path: &FieldPath) -> Result<u64, Error> {
    position
        .eval(scope)
        .map(|v| v as u64)
        .map_err(|source| Error::ExpressionError {
            path: path.clone(),
            source,
        })
}

/// A reader positioned at `absolute_pos` bytes from the start of the root
/// buffer, the origin all instance and back-reference offsets are
/// measured against. Bounded to `size` bytes when given; unbounded
/// otherwise (the reader still can't read past the root buffer's end).
pub fn reader_at<'a>(
    root_bytes: &'a [u8],
    bit_order: BitOrder,
    absolute_pos: u64,
    size: Option<usize>,
    path: &FieldPath,
) -> Result<BitReader<'a>, Error> {
    let pos = absolute_pos as usize;
    if pos > root_bytes.len() {
        return Err(Error::PositionOutOfBounds {
            path: path.clone(),
            position: absolute_pos,
            stream_len: root_bytes.len(),
        });
    }
    match size {
        Some(size) => {
            let root = BitReader::new(root_bytes, bit_order);
            root.fork(path, pos, size)
        }
        None => {
            let mut r = BitReader::new(root_bytes, bit_order);
            r.seek(pos);
            Ok(r)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_out_of_bounds_is_rejected() {
        let bytes = vec![0u8; 4];
        let path = FieldPath::root("T");
        assert!(reader_at(&bytes, BitOrder::MsbFirst, 10, None, &path).is_err());
    }

    #[test]
    fn sized_instance_bounds_the_reader() {
        let bytes = vec![1, 2, 3, 4, 5];
        let path = FieldPath::root("T");
        let mut r = reader_at(&bytes, BitOrder::MsbFirst, 2, Some(2), &path).unwrap();
        assert_eq!(r.read_u8(&path).unwrap(), 3);
        assert_eq!(r.read_u8(&path).unwrap(), 4);
        assert!(r.at_eof());
    }
}
