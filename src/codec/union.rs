//! Discriminated-union variant selection.
//!
//! Field-discriminated unions evaluate each variant's `when` expression
//! against the already-decoded discriminator value, first match wins.
//! Peek-discriminated unions read the storage type without advancing the
//! stream (`BitReader::peek_uint`), evaluate the same way, then let the
//! selected variant's own decode consume the bytes it peeked.

use crate::bitstream::BitReader;
use crate::error::{Error, FieldPath};
use crate::expr::Scope;
use crate::schema::validate::{TypeId, VariantDef};

pub fn select_variant(
    path: &FieldPath,
    variants: &[VariantDef],
    discriminant: i64,
) -> Result<TypeId, Error> {
    let scope = Scope::new().with("value", discriminant);
    for variant in variants {
        match variant.when.eval_bool(&scope) {
            Ok(true) => return Ok(variant.target),
            Ok(false) => continue,
            Err(source) => {
                return Err(Error::ExpressionError {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
    Err(Error::DiscriminatorNoMatch {
        path: path.clone(),
        discriminant,
    })
}

/// Peek `n_bytes` (the union's `peek_type` storage width) ahead without
/// advancing the reader's cursor.
pub fn peek_discriminant(
    r: &BitReader,
    path: &FieldPath,
    n_bytes: usize,
    endianness: crate::bitstream::Endianness,
) -> Result<i64, Error> {
    Ok(r.peek_uint(path, n_bytes, endianness)? as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn first_matching_when_wins() {
        let path = FieldPath::root("Msg");
        let variants = vec![
            VariantDef {
                when: Expr::parse("value == 1").unwrap(),
                target: TypeId(0),
            },
            VariantDef {
                when: Expr::parse("value == 2").unwrap(),
                target: TypeId(1),
            },
        ];
        assert_eq!(select_variant(&path, &variants, 2).unwrap(), TypeId(1));
        assert!(select_variant(&path, &variants, 3).is_err());
    }
}
