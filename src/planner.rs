//! The computed-field planner: two-pass encoding plus cross-element
//! correlation, per spec section 4.9 -- the hardest subsystem and the one
//! with the largest implementation share.
//!
//! Pass 1 (measurement) encodes the whole tree into a scratch buffer with
//! zero placeholders for every `computed` field, recording each field's
//! byte span and, for choice arrays, per-type occurrence lists, into a
//! [`LayoutMap`]. Pass 2 (real) re-encodes using the same driver logic, but
//! this time `computed` fields resolve against the finished `LayoutMap`
//! instead of writing zero. Because every `computed` field is a
//! fixed-width primitive, its presence never changes sibling byte offsets
//! between the two passes, so pass 1's spans stay valid in pass 2.

use crate::error::{Error, FieldPath};
use crate::schema::validate::{ComputedKind, PathSegment, TargetPath, TypeId, ValidatedSchema};
use crate::value::Value;
use fxhash::FxHashMap;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Pass {
    Measurement,
    Real,
}

/// Per-encode bookkeeping built during the measurement pass and consulted
/// (read-only, in spirit) during the real pass.
#[derive(Default)]
pub struct LayoutMap {
    /// The measurement-pass output; used to read raw bytes back for
    /// `crc32_of` and `length_of`.
    pub buf: Vec<u8>,
    /// `FieldPath::to_string()` -> (start_byte, end_byte) for every value
    /// encoded anywhere in the tree, leaf or composite.
    pub field_spans: FxHashMap<String, (usize, usize)>,
    /// `"{array_field_path}::{type_name}"` -> ordered spans of every
    /// element of that variant type within that array, in wire order.
    pub type_positions: FxHashMap<String, Vec<(usize, usize)>>,
    /// `(target_type, encoded_bytes)` -> byte offset of the first in-band
    /// (non-pointer) occurrence. Used to resolve `back_reference` targets
    /// on encode: the pointer is only ever written if some other field
    /// elsewhere in the tree encodes identical bytes for that type.
    pub pointer_candidates: FxHashMap<(TypeId, Vec<u8>), usize>,
    /// `FieldPath::to_string()` -> element count, for every array field
    /// encoded anywhere in the tree. Lets `length_of` report the element
    /// count for an array target instead of its raw byte span.
    pub array_lengths: FxHashMap<String, usize>,
}

impl LayoutMap {
    pub fn record_span(&mut self, path: &FieldPath, span: (usize, usize)) {
        self.field_spans.insert(path.to_string(), span);
    }

    pub fn record_type_position(&mut self, array_path: &FieldPath, type_name: &str, span: (usize, usize)) -> usize {
        let key = format!("{array_path}::{type_name}");
        let list = self.type_positions.entry(key).or_default();
        list.push(span);
        list.len()
    }

    pub fn record_pointer_candidate(&mut self, ty: TypeId, bytes: &[u8], start: usize) {
        self.pointer_candidates
            .entry((ty, bytes.to_vec()))
            .or_insert(start);
    }

    pub fn lookup_pointer_candidate(&self, ty: TypeId, bytes: &[u8]) -> Option<usize> {
        self.pointer_candidates.get(&(ty, bytes.to_vec())).copied()
    }

    pub fn record_array_length(&mut self, path: &FieldPath, len: usize) {
        self.array_lengths.insert(path.to_string(), len);
    }
}

/// Resolves a `computed`/`instance.position` target path to a byte span in
/// the layout map. `ancestors` is the stack of enclosing composite field
/// paths (root first); `current_occurrence` is the 1-based index of the
/// value currently being encoded among same-typed siblings in its own
/// array, used for `corresponding<T>`/`same_index<T>`.
pub fn resolve_target_span(
    layout: &LayoutMap,
    ancestors: &[FieldPath],
    target: &TargetPath,
    current_occurrence: Option<usize>,
    path: &FieldPath,
) -> Result<(usize, usize), Error> {
    let mut scope_idx = ancestors.len();
    let mut cursor: Option<FieldPath> = None;
    let mut last_span: Option<(usize, usize)> = None;

    for seg in &target.0 {
        match seg {
            PathSegment::Parent => {
                scope_idx = scope_idx.saturating_sub(1);
                cursor = None;
            }
            PathSegment::Root => {
                scope_idx = 1;
                cursor = None;
            }
            PathSegment::Field(name) => {
                let base = cursor.clone().unwrap_or_else(|| {
                    ancestors[scope_idx.saturating_sub(1).min(ancestors.len() - 1)].clone()
                });
                let next = base.field(name);
                last_span = layout.field_spans.get(&next.to_string()).copied();
                cursor = Some(next);
            }
            PathSegment::FirstOfType(ty) | PathSegment::CorrespondingOfType(ty) => {
                let array_path = cursor.clone().ok_or_else(|| Error::ExpressionError {
                    path: path.clone(),
                    source: crate::expr::ExprError::Parse {
                        src: format!("{target:?}"),
                        message: "index selector must follow a field name".to_owned(),
                    },
                })?;
                let key = format!("{array_path}::{ty}");
                let positions = layout.type_positions.get(&key).ok_or_else(|| Error::PointerTargetMissing {
                    path: path.clone(),
                    offset: 0,
                })?;
                let idx = match seg {
                    PathSegment::FirstOfType(_) => 0,
                    PathSegment::CorrespondingOfType(_) => current_occurrence
                        .and_then(|n| n.checked_sub(1))
                        .ok_or_else(|| Error::PointerTargetMissing {
                            path: path.clone(),
                            offset: 0,
                        })?,
                    _ => unreachable!(),
                };
                let span = *positions.get(idx).ok_or_else(|| Error::PointerTargetMissing {
                    path: path.clone(),
                    offset: idx as u64,
                })?;
                last_span = Some(span);
                cursor = Some(array_path.index(idx));
            }
        }
    }

    last_span.ok_or_else(|| Error::PointerTargetMissing {
        path: path.clone(),
        offset: 0,
    })
}

/// Resolves a `TargetPath` down to just the field path it names (used when
/// the selector picks an array field itself, e.g. `sum_of_type_sizes`'s
/// `target`), without requiring the span to already exist in the layout.
fn resolve_target_field_path(ancestors: &[FieldPath], target: &TargetPath) -> FieldPath {
    let mut scope_idx = ancestors.len();
    let mut cursor = ancestors[scope_idx - 1].clone();
    for seg in &target.0 {
        match seg {
            PathSegment::Parent => {
                scope_idx = scope_idx.saturating_sub(1);
                cursor = ancestors[scope_idx.saturating_sub(1)].clone();
            }
            PathSegment::Root => {
                scope_idx = 1;
                cursor = ancestors[0].clone();
            }
            PathSegment::Field(name) => {
                cursor = cursor.field(name);
            }
            PathSegment::FirstOfType(_) | PathSegment::CorrespondingOfType(_) => {}
        }
    }
    cursor
}

/// Computes the value of a `computed` field against the finished layout
/// map. Called only during the real pass.
pub fn resolve_computed(
    schema: &ValidatedSchema,
    layout: &LayoutMap,
    ancestors: &[FieldPath],
    composite_base: &FieldPath,
    current_occurrence: Option<usize>,
    kind: &ComputedKind,
    path: &FieldPath,
) -> Result<Value, Error> {
    match kind {
        ComputedKind::LengthOf { target, from_after_field: Some(sibling) } => {
            let sibling_path = composite_base.field(sibling);
            let (_, sibling_end) = layout
                .field_spans
                .get(&sibling_path.to_string())
                .copied()
                .ok_or_else(|| Error::LengthFieldMissing {
                    type_name: composite_base.to_string(),
                    field_name: path.to_string(),
                    length_field: sibling.clone(),
                })?;
            let (_, composite_end) = layout
                .field_spans
                .get(&composite_base.to_string())
                .copied()
                .unwrap_or((sibling_end, sibling_end));
            let _ = target;
            Ok(Value::UInt((composite_end - sibling_end) as u64))
        }
        ComputedKind::LengthOf { target, from_after_field: None } => {
            let field_path = resolve_target_field_path(ancestors, target);
            if let Some(count) = layout.array_lengths.get(&field_path.to_string()) {
                return Ok(Value::UInt(*count as u64));
            }
            let (start, end) = resolve_target_span(layout, ancestors, target, current_occurrence, path)?;
            Ok(Value::UInt((end - start) as u64))
        }
        ComputedKind::Crc32Of { target } => {
            let (start, end) = resolve_target_span(layout, ancestors, target, current_occurrence, path)?;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&layout.buf[start..end]);
            Ok(Value::UInt(hasher.finalize() as u64))
        }
        ComputedKind::PositionOf { target } => {
            let (start, _) = resolve_target_span(layout, ancestors, target, current_occurrence, path)?;
            Ok(Value::UInt(start as u64))
        }
        ComputedKind::SumOfTypeSizes { target, element_type } => {
            let array_path = resolve_target_field_path(ancestors, target);
            let type_name = schema.type_def(*element_type).name();
            let key = format!("{array_path}::{type_name}");
            let sum: usize = layout
                .type_positions
                .get(&key)
                .map(|spans| spans.iter().map(|(s, e)| e - s).sum())
                .unwrap_or(0);
            Ok(Value::UInt(sum as u64))
        }
    }
}
