//! Orchestrates a type's field sequence: conditionals, const validation,
//! computed-field delegation, optional presence, padding, and recursion
//! into composite/union/array/string/primitive codecs. Also the streaming
//! decoder for `length_prefixed_items` arrays, built the same way the
//! teacher's `PacketDecoder` implements `tokio_util::codec::Decoder` as an
//! explicit resumable state machine.

use crate::bitstream::{BitReader, BitWriter, Endianness};
use crate::codec::{primitive, pointer, string_array, union};
use crate::error::{Error, FieldPath};
use crate::expr::Scope;
use crate::instance;
use crate::planner::{self, LayoutMap, Pass};
use crate::schema::validate::{
    ArrayDef, ArrayKind, CompositeDef, DiscriminatorKind, FieldDef, FieldKind, TypeDef, TypeId,
    ValidatedSchema,
};
use crate::value::Value;
use internment::Intern;

/// Top-level entry point: `Schema::encode`.
pub fn encode_root(schema: &ValidatedSchema, root_type_name: &str, value: &Value) -> Result<Vec<u8>, Error> {
    let root_id = schema
        .lookup(root_type_name)
        .ok_or_else(|| Error::TypeNotFound(root_type_name.to_owned()))?;
    reject_decode_only(schema, root_id, root_type_name)?;

    let root_path = FieldPath::root(root_type_name);

    // Measurement pass: zero placeholders for computed fields, building the
    // layout map the real pass resolves them against.
    let mut layout = LayoutMap::default();
    {
        let mut w = BitWriter::new(schema.default_bit_order);
        let mut ancestors = Vec::new();
        let mut scope_stack = Vec::new();
        encode_value(
            schema,
            &mut layout,
            Pass::Measurement,
            root_id,
            value,
            &mut w,
            &root_path,
            &mut ancestors,
            &mut scope_stack,
            None,
        )?;
        layout.buf = w.into_bytes();
    }

    let mut w = BitWriter::new(schema.default_bit_order);
    let mut ancestors = Vec::new();
    let mut scope_stack = Vec::new();
    encode_value(
        schema,
        &mut layout,
        Pass::Real,
        root_id,
        value,
        &mut w,
        &root_path,
        &mut ancestors,
        &mut scope_stack,
        None,
    )?;
    Ok(w.into_bytes())
}

/// Top-level entry point: `Schema::decode`.
pub fn decode_root(schema: &ValidatedSchema, root_type_name: &str, bytes: &[u8]) -> Result<Value, Error> {
    let root_id = schema
        .lookup(root_type_name)
        .ok_or_else(|| Error::TypeNotFound(root_type_name.to_owned()))?;
    let root_path = FieldPath::root(root_type_name);
    let mut r = BitReader::new(bytes, schema.default_bit_order);
    let mut ancestors = Vec::new();
    let mut scope_stack = Vec::new();
    decode_value(
        schema,
        bytes,
        root_id,
        &mut r,
        &root_path,
        0,
        false,
        &mut ancestors,
        &mut scope_stack,
        None,
    )
}

fn reject_decode_only(schema: &ValidatedSchema, id: TypeId, name: &str) -> Result<(), Error> {
    if let TypeDef::Composite(c) = schema.type_def(id) {
        if c.decode_only {
            return Err(Error::SchemaInvalid(vec![crate::error::Diagnostic {
                type_name: name.to_owned(),
                field_name: None,
                message: "type declares or contains 'instances' and is decode-only; it cannot be encoded".to_owned(),
            }]));
        }
    }
    Ok(())
}

fn build_scope(fields: &[(Intern<String>, Value)]) -> Scope {
    let mut scope = Scope::new();
    insert_scope_fields(&mut scope, "", fields);
    scope
}

fn insert_scope_fields(scope: &mut Scope, prefix: &str, fields: &[(Intern<String>, Value)]) {
    for (name, value) in fields {
        let key = if prefix.is_empty() {
            name.as_str().to_owned()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            Value::Record(sub) => insert_scope_fields(scope, &key, sub),
            other => {
                if let Some(n) = other.as_i64().or_else(|| other.as_u64().map(|u| u as i64)) {
                    scope.insert(key, n);
                }
            }
        }
    }
}

fn lookup_scoped(scope_stack: &[Scope], name: &str) -> Option<i64> {
    if let Some(rest) = name.strip_prefix("_root.") {
        return scope_stack.first()?.get(rest);
    }
    if let Some(rest) = name.strip_prefix("parent.") {
        let idx = scope_stack.len().checked_sub(2)?;
        return scope_stack.get(idx)?.get(rest);
    }
    scope_stack.last()?.get(name)
}

fn type_occurrence_name(schema: &ValidatedSchema, item_type: TypeId, value: &Value) -> String {
    value
        .variant_type_name()
        .map(|s| s.to_owned())
        .unwrap_or_else(|| schema.type_def(item_type).name().as_str().to_owned())
}

// ---------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn encode_value(
    schema: &ValidatedSchema,
    layout: &mut LayoutMap,
    pass: Pass,
    id: TypeId,
    value: &Value,
    w: &mut BitWriter,
    path: &FieldPath,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
    current_occurrence: Option<usize>,
) -> Result<(usize, usize), Error> {
    let start = w.byte_offset();
    match schema.type_def(id) {
        TypeDef::Composite(c) => {
            ancestors.push(path.clone());
            scope_stack.push(Scope::new());
            let result = encode_composite(schema, layout, pass, c, value, w, path, ancestors, scope_stack, current_occurrence);
            scope_stack.pop();
            ancestors.pop();
            result?;
        }
        TypeDef::Alias(a) => {
            encode_value(schema, layout, pass, a.target, value, w, path, ancestors, scope_stack, None)?;
        }
        TypeDef::Union(u) => {
            let (ty_name, inner) = match value {
                Value::Variant { ty, value } => (*ty, value.as_ref()),
                other => (schema.type_def(id).name(), other),
            };
            let target = schema
                .lookup(ty_name.as_str())
                .ok_or_else(|| Error::TypeNotFound(ty_name.as_str().to_owned()))?;
            let _ = &u.discriminator;
            encode_value(schema, layout, pass, target, inner, w, path, ancestors, scope_stack, None)?;
        }
    }
    let end = w.byte_offset();
    let span = (start, end);
    layout.record_span(path, span);
    layout.record_pointer_candidate(id, &w.as_bytes()[start..end], start);
    Ok(span)
}

#[allow(clippy::too_many_arguments)]
fn encode_composite(
    schema: &ValidatedSchema,
    layout: &mut LayoutMap,
    pass: Pass,
    composite: &CompositeDef,
    value: &Value,
    w: &mut BitWriter,
    path: &FieldPath,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
    current_occurrence: Option<usize>,
) -> Result<(), Error> {
    let input_fields = value.as_record().unwrap_or(&[]);
    for field in &composite.fields {
        let field_path = path.field(field.name.as_str());
        let input_value = input_fields.iter().find(|(n, _)| *n == field.name).map(|(_, v)| v);

        if let Some(cond) = &field.conditional {
            let truthy = cond.eval_bool(scope_stack.last().unwrap()).map_err(|source| Error::ExpressionError {
                path: field_path.clone(),
                source,
            })?;
            if !truthy {
                continue;
            }
        }

        if matches!(field.kind, FieldKind::Padding { .. }) {
            if let FieldKind::Padding { align_to } = &field.kind {
                w.align_to(&field_path, *align_to)?;
            }
            continue;
        }

        let resolved_value: Value;
        let effective_value: &Value = if let Some(const_value) = &field.const_value {
            if let Some(supplied) = input_value {
                if supplied != const_value {
                    return Err(Error::ConstMismatch {
                        path: field_path.clone(),
                        expected: const_value.clone(),
                        actual: supplied.clone(),
                    });
                }
            }
            const_value
        } else if let Some(computed) = &field.computed {
            if input_value.is_some() {
                return Err(Error::ComputedFieldSet { path: field_path.clone() });
            }
            resolved_value = match pass {
                Pass::Measurement => Value::UInt(0),
                Pass::Real => planner::resolve_computed(
                    schema,
                    layout,
                    ancestors,
                    ancestors.last().unwrap(),
                    current_occurrence,
                    &computed.kind,
                    &field_path,
                )?,
            };
            &resolved_value
        } else {
            match input_value {
                Some(v) => v,
                None => {
                    resolved_value = default_value_for(&field.kind);
                    &resolved_value
                }
            }
        };

        let endianness = field.endianness_override.unwrap_or(schema.default_endianness);
        let field_start = w.byte_offset();
        encode_field(
            schema,
            layout,
            pass,
            field,
            effective_value,
            w,
            &field_path,
            endianness,
            ancestors,
            scope_stack,
        )?;
        layout.record_span(&field_path, (field_start, w.byte_offset()));

        let sibling_fields: Vec<(Intern<String>, Value)> = vec![(field.name, effective_value.clone())];
        insert_scope_fields(scope_stack.last_mut().unwrap(), "", &sibling_fields);
    }

    for instance in &composite.instances {
        let _ = instance;
        // Instances are decode-only; rejected before reaching here by
        // `reject_decode_only`.
    }

    Ok(())
}

fn default_value_for(kind: &FieldKind) -> Value {
    match kind {
        FieldKind::Float32 => Value::F32(ordered_float::OrderedFloat(0.0)),
        FieldKind::Float64 => Value::F64(ordered_float::OrderedFloat(0.0)),
        FieldKind::StringField(_) => Value::Str(String::new()),
        FieldKind::ArrayField(_) => Value::Array(Vec::new()),
        FieldKind::Optional { .. } => Value::Option(None),
        _ => Value::UInt(0),
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_field(
    schema: &ValidatedSchema,
    layout: &mut LayoutMap,
    pass: Pass,
    field: &FieldDef,
    value: &Value,
    w: &mut BitWriter,
    path: &FieldPath,
    endianness: Endianness,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
) -> Result<(), Error> {
    match &field.kind {
        FieldKind::UInt(ty) | FieldKind::Int(ty) => primitive::encode_primitive(w, path, *ty, endianness, value),
        FieldKind::Float32 => primitive::encode_float32(w, path, endianness, value),
        FieldKind::Float64 => primitive::encode_float64(w, path, endianness, value),
        FieldKind::Bit { size, .. } => primitive::encode_bit(w, *size, value),
        FieldKind::Bitfield { size, fields } => primitive::encode_bitfield(w, *size, fields, value),
        FieldKind::Varlength { encoding } => primitive::encode_varlength(w, path, *encoding, value),
        FieldKind::StringField(def) => string_array::encode_string(w, path, def, endianness, value),
        FieldKind::Padding { .. } => Ok(()),
        FieldKind::Optional { value_type, presence_type } => {
            let inner = match value {
                Value::Option(Some(v)) => Some(v.as_ref()),
                Value::Option(None) => None,
                other => Some(other),
            };
            write_presence(w, path, *presence_type, inner.is_some())?;
            if let Some(inner) = inner {
                encode_value(schema, layout, pass, *value_type, inner, w, path, ancestors, scope_stack, None)?;
            }
            Ok(())
        }
        FieldKind::ArrayField(array) => encode_array(schema, layout, pass, array, value, w, path, endianness, ancestors, scope_stack),
        FieldKind::BackReference(back) => {
            let mut scratch = BitWriter::new(schema.default_bit_order);
            encode_value(schema, layout, pass, back.target_type, value, &mut scratch, path, ancestors, scope_stack, None)?;
            let target_bytes = scratch.into_bytes();
            let candidate = layout.lookup_pointer_candidate(back.target_type, &target_bytes);
            let absolute = match candidate {
                Some(offset) => offset as u64,
                None => match pass {
                    Pass::Measurement => 0,
                    Pass::Real => {
                        return Err(Error::PointerTargetMissing {
                            path: path.clone(),
                            offset: 0,
                        })
                    }
                },
            };
            let current = w.byte_offset() as u64;
            let base = match back.offset_from {
                crate::schema::validate::OffsetFrom::MessageStart => 0,
                crate::schema::validate::OffsetFrom::CurrentPosition => current,
            };
            let delta = absolute.saturating_sub(base);
            let storage_width_mask = match back.storage.byte_width() {
                1 => 0xFFu64,
                2 => 0xFFFF,
                4 => 0xFFFF_FFFF,
                _ => u64::MAX,
            };
            let raw = (delta & back.offset_mask) | (!back.offset_mask & storage_width_mask);
            primitive::write_prim_uint(w, path, back.storage, back.endianness, raw)
        }
        FieldKind::TypeRef(target) => {
            encode_value(schema, layout, pass, *target, value, w, path, ancestors, scope_stack, None)?;
            Ok(())
        }
    }
}

fn write_presence(
    w: &mut BitWriter,
    path: &FieldPath,
    presence_type: crate::schema::validate::PresenceType,
    present: bool,
) -> Result<(), Error> {
    match presence_type {
        crate::schema::validate::PresenceType::Uint8 => w.write_u8(path, present as u8),
        crate::schema::validate::PresenceType::Bit => {
            w.write_bits(present as u64, 1);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_array(
    schema: &ValidatedSchema,
    layout: &mut LayoutMap,
    pass: Pass,
    array: &ArrayDef,
    value: &Value,
    w: &mut BitWriter,
    path: &FieldPath,
    endianness: Endianness,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
) -> Result<(), Error> {
    let items = value.as_array().unwrap_or(&[]);
    let mut per_type_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    layout.record_array_length(path, items.len());

    match &array.kind {
        ArrayKind::Fixed { length } => {
            if items.len() != *length {
                return Err(Error::ArrayLengthMismatch {
                    path: path.clone(),
                    expected: *length,
                    actual: items.len(),
                });
            }
            for i in 0..items.len() {
                encode_array_item(schema, layout, pass, array, items, i, path, w, ancestors, scope_stack, &mut per_type_counts)?;
            }
        }
        ArrayKind::LengthPrefixed { length_type } => {
            primitive::write_prim_uint(w, path, *length_type, endianness, items.len() as u64)?;
            for i in 0..items.len() {
                encode_array_item(schema, layout, pass, array, items, i, path, w, ancestors, scope_stack, &mut per_type_counts)?;
            }
        }
        ArrayKind::LengthPrefixedItems { length_type, item_length_type } => {
            primitive::write_prim_uint(w, path, *length_type, endianness, items.len() as u64)?;
            let max_len = match item_length_type.byte_width() {
                1 => 0xFF,
                2 => 0xFFFF,
                4 => 0xFFFF_FFFFu64 as usize,
                _ => usize::MAX,
            };
            for i in 0..items.len() {
                let mut scratch = BitWriter::new(schema.default_bit_order);
                let item_path = path.index(i);
                let type_name = type_occurrence_name(schema, array.item_type, &items[i]);
                let counter = per_type_counts.entry(type_name.clone()).or_insert(0);
                *counter += 1;
                let occurrence = *counter;
                encode_value(
                    schema,
                    layout,
                    pass,
                    array.item_type,
                    &items[i],
                    &mut scratch,
                    &item_path,
                    ancestors,
                    scope_stack,
                    Some(occurrence),
                )?;
                let bytes = scratch.into_bytes();
                if bytes.len() > max_len {
                    return Err(Error::LengthExceedsPrefixRange {
                        path: item_path.clone(),
                        len: bytes.len(),
                        max: max_len,
                    });
                }
                primitive::write_prim_uint(w, &item_path, *item_length_type, endianness, bytes.len() as u64)?;
                let start = w.byte_offset();
                w.write_bytes(&item_path, &bytes)?;
                let end = w.byte_offset();
                layout.record_span(&item_path, (start, end));
                layout.record_type_position(path, &type_name, (start, end));
            }
        }
        ArrayKind::ByteLengthPrefixed { length_type } => {
            let mut scratch = BitWriter::new(schema.default_bit_order);
            for i in 0..items.len() {
                let item_path = path.index(i);
                let type_name = type_occurrence_name(schema, array.item_type, &items[i]);
                let counter = per_type_counts.entry(type_name.clone()).or_insert(0);
                *counter += 1;
                let occurrence = *counter;
                encode_value(
                    schema,
                    layout,
                    pass,
                    array.item_type,
                    &items[i],
                    &mut scratch,
                    &item_path,
                    ancestors,
                    scope_stack,
                    Some(occurrence),
                )?;
            }
            let bytes = scratch.into_bytes();
            primitive::write_prim_uint(w, path, *length_type, endianness, bytes.len() as u64)?;
            w.write_bytes(path, &bytes)?;
        }
        ArrayKind::FieldReferenced { .. } | ArrayKind::ComputedCount { .. } | ArrayKind::EofTerminated | ArrayKind::Greedy => {
            for i in 0..items.len() {
                encode_array_item(schema, layout, pass, array, items, i, path, w, ancestors, scope_stack, &mut per_type_counts)?;
            }
        }
        ArrayKind::NullTerminated { terminal_variants } => {
            let mut wrote_terminal = false;
            for i in 0..items.len() {
                encode_array_item(schema, layout, pass, array, items, i, path, w, ancestors, scope_stack, &mut per_type_counts)?;
                if let Value::Variant { ty, .. } = &items[i] {
                    let tid = schema.lookup(ty.as_str());
                    if tid.map(|t| terminal_variants.contains(&t)).unwrap_or(false) {
                        wrote_terminal = true;
                    }
                }
            }
            if !wrote_terminal {
                w.write_u8(path, 0)?;
            }
        }
        ArrayKind::VariantTerminated { .. } | ArrayKind::SignatureTerminated { .. } => {
            for i in 0..items.len() {
                encode_array_item(schema, layout, pass, array, items, i, path, w, ancestors, scope_stack, &mut per_type_counts)?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode_array_item(
    schema: &ValidatedSchema,
    layout: &mut LayoutMap,
    pass: Pass,
    array: &ArrayDef,
    items: &[Value],
    i: usize,
    array_path: &FieldPath,
    w: &mut BitWriter,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
    per_type_counts: &mut std::collections::HashMap<String, usize>,
) -> Result<(usize, usize), Error> {
    let item_path = array_path.index(i);
    let type_name = type_occurrence_name(schema, array.item_type, &items[i]);
    let counter = per_type_counts.entry(type_name.clone()).or_insert(0);
    *counter += 1;
    let occurrence = *counter;
    let span = encode_value(
        schema,
        layout,
        pass,
        array.item_type,
        &items[i],
        w,
        &item_path,
        ancestors,
        scope_stack,
        Some(occurrence),
    )?;
    layout.record_type_position(array_path, &type_name, span);
    Ok(span)
}

// ---------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn decode_value(
    schema: &ValidatedSchema,
    root_bytes: &[u8],
    id: TypeId,
    r: &mut BitReader,
    path: &FieldPath,
    window_origin: usize,
    bounded: bool,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
    current_occurrence: Option<usize>,
) -> Result<Value, Error> {
    let _ = current_occurrence;
    match schema.type_def(id) {
        TypeDef::Composite(c) => {
            ancestors.push(path.clone());
            scope_stack.push(Scope::new());
            let result = decode_composite(schema, root_bytes, c, r, path, window_origin, bounded, ancestors, scope_stack);
            scope_stack.pop();
            ancestors.pop();
            result
        }
        TypeDef::Alias(a) => decode_value(
            schema, root_bytes, a.target, r, path, window_origin, bounded, ancestors, scope_stack, None,
        ),
        TypeDef::Union(u) => {
            let discriminant = match &u.discriminator {
                DiscriminatorKind::Field(name) => lookup_scoped(scope_stack, name).ok_or_else(|| Error::ExpressionError {
                    path: path.clone(),
                    source: crate::expr::ExprError::UnknownIdentifier(name.clone()),
                })?,
                DiscriminatorKind::Peek { ty, endianness } => {
                    union::peek_discriminant(r, path, ty.byte_width(), *endianness)?
                }
            };
            let target = union::select_variant(path, &u.variants, discriminant)?;
            let inner = decode_value(
                schema, root_bytes, target, r, path, window_origin, bounded, ancestors, scope_stack, None,
            )?;
            let ty_name = schema.type_def(target).name();
            Ok(Value::Variant { ty: ty_name, value: Box::new(inner) })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_composite(
    schema: &ValidatedSchema,
    root_bytes: &[u8],
    composite: &CompositeDef,
    r: &mut BitReader,
    path: &FieldPath,
    window_origin: usize,
    bounded: bool,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
) -> Result<Value, Error> {
    let mut out: Vec<(Intern<String>, Value)> = Vec::with_capacity(composite.fields.len());

    for field in &composite.fields {
        let field_path = path.field(field.name.as_str());

        if let Some(cond) = &field.conditional {
            let truthy = cond.eval_bool(scope_stack.last().unwrap()).map_err(|source| Error::ExpressionError {
                path: field_path.clone(),
                source,
            })?;
            if !truthy {
                continue;
            }
        }

        if let FieldKind::Padding { align_to } = &field.kind {
            r.align_to(&field_path, *align_to)?;
            continue;
        }

        let endianness = field.endianness_override.unwrap_or(schema.default_endianness);
        let decoded = decode_field(schema, root_bytes, field, r, &field_path, endianness, window_origin, bounded, ancestors, scope_stack)?;

        if let Some(const_value) = &field.const_value {
            if &decoded != const_value {
                return Err(Error::ConstMismatch {
                    path: field_path.clone(),
                    expected: const_value.clone(),
                    actual: decoded,
                });
            }
        }

        insert_scope_fields(scope_stack.last_mut().unwrap(), "", std::slice::from_ref(&(field.name, decoded.clone())));
        out.push((field.name, decoded));
    }

    let base_scope = build_scope(&out);
    for inst in &composite.instances {
        let absolute = instance::compute_position(&inst.position, &base_scope, path)?;
        let mut inst_reader = instance::reader_at(root_bytes, schema.default_bit_order, absolute, inst.size, path)?;
        let inst_path = path.field(inst.name.as_str());
        let mut inst_ancestors = Vec::new();
        let mut inst_scope_stack = Vec::new();
        // A sized instance is bounded via `fork`, whose reader starts a
        // fresh zero-based cursor over a sub-slice, so its window origin is
        // the instance's own absolute start. An unbounded instance seeks a
        // reader directly over `root_bytes`, so its cursor is already
        // absolute and the window origin is 0.
        let inst_window_origin = if inst.size.is_some() { absolute as usize } else { 0 };
        let value = decode_value(
            schema,
            root_bytes,
            inst.ty,
            &mut inst_reader,
            &inst_path,
            inst_window_origin,
            inst.size.is_some(),
            &mut inst_ancestors,
            &mut inst_scope_stack,
            None,
        )?;
        out.push((inst.name, value));
    }

    Ok(Value::Record(out))
}

#[allow(clippy::too_many_arguments)]
fn decode_field(
    schema: &ValidatedSchema,
    root_bytes: &[u8],
    field: &FieldDef,
    r: &mut BitReader,
    path: &FieldPath,
    endianness: Endianness,
    window_origin: usize,
    bounded: bool,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
) -> Result<Value, Error> {
    match &field.kind {
        FieldKind::UInt(ty) | FieldKind::Int(ty) => primitive::decode_primitive(r, path, *ty, endianness),
        FieldKind::Float32 => primitive::decode_float32(r, path, endianness),
        FieldKind::Float64 => primitive::decode_float64(r, path, endianness),
        FieldKind::Bit { signed, size } => primitive::decode_bit(r, path, *signed, *size),
        FieldKind::Bitfield { size, fields } => primitive::decode_bitfield(r, path, *size, fields),
        FieldKind::Varlength { encoding } => primitive::decode_varlength(r, path, *encoding),
        FieldKind::StringField(def) => string_array::decode_string(r, path, def, endianness),
        FieldKind::Padding { .. } => Ok(Value::UInt(0)),
        FieldKind::Optional { value_type, presence_type } => {
            let present = read_presence(r, path, *presence_type)?;
            if !present {
                return Ok(Value::Option(None));
            }
            let inner = decode_value(schema, root_bytes, *value_type, r, path, window_origin, bounded, ancestors, scope_stack, None)?;
            Ok(Value::Option(Some(Box::new(inner))))
        }
        FieldKind::ArrayField(array) => decode_array(schema, root_bytes, array, r, path, endianness, window_origin, bounded, ancestors, scope_stack),
        FieldKind::BackReference(back) => {
            let raw = primitive::read_prim_uint(r, path, back.storage, back.endianness)?;
            let current = window_origin + r.byte_offset();
            let absolute = pointer::resolve_absolute_offset(raw, back.offset_mask, back.offset_from, current);
            // `reader_at` with no size seeks a fresh reader directly over
            // `root_bytes`, so its own byte_offset() is already absolute --
            // the window origin for decoding through it is 0, not `absolute`.
            let mut target_reader = instance::reader_at(root_bytes, schema.default_bit_order, absolute, None, path)?;
            let mut target_ancestors = Vec::new();
            let mut target_scope_stack = Vec::new();
            decode_value(
                schema,
                root_bytes,
                back.target_type,
                &mut target_reader,
                path,
                0,
                false,
                &mut target_ancestors,
                &mut target_scope_stack,
                None,
            )
        }
        FieldKind::TypeRef(target) => decode_value(schema, root_bytes, *target, r, path, window_origin, bounded, ancestors, scope_stack, None),
    }
}

fn read_presence(r: &mut BitReader, path: &FieldPath, presence_type: crate::schema::validate::PresenceType) -> Result<bool, Error> {
    Ok(match presence_type {
        crate::schema::validate::PresenceType::Uint8 => r.read_u8(path)? != 0,
        crate::schema::validate::PresenceType::Bit => r.read_bits(path, 1)? != 0,
    })
}

#[allow(clippy::too_many_arguments)]
fn decode_array(
    schema: &ValidatedSchema,
    root_bytes: &[u8],
    array: &ArrayDef,
    r: &mut BitReader,
    path: &FieldPath,
    endianness: Endianness,
    window_origin: usize,
    bounded: bool,
    ancestors: &mut Vec<FieldPath>,
    scope_stack: &mut Vec<Scope>,
) -> Result<Value, Error> {
    let mut items = Vec::new();
    let mut per_type_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    macro_rules! decode_one_item {
        ($reader:expr, $item_path:expr, $window:expr, $bounded:expr) => {{
            let value = decode_value(schema, root_bytes, array.item_type, $reader, &$item_path, $window, $bounded, ancestors, scope_stack, None)?;
            let type_name = type_occurrence_name(schema, array.item_type, &value);
            *per_type_counts.entry(type_name).or_insert(0) += 1;
            value
        }};
    }

    match &array.kind {
        ArrayKind::Fixed { length } => {
            for i in 0..*length {
                let item_path = path.index(i);
                items.push(decode_one_item!(r, item_path, window_origin, bounded));
            }
        }
        ArrayKind::LengthPrefixed { length_type } => {
            let count = primitive::read_prim_uint(r, path, *length_type, endianness)? as usize;
            for i in 0..count {
                let item_path = path.index(i);
                items.push(decode_one_item!(r, item_path, window_origin, bounded));
            }
        }
        ArrayKind::LengthPrefixedItems { length_type, item_length_type } => {
            let count = primitive::read_prim_uint(r, path, *length_type, endianness)? as usize;
            for i in 0..count {
                let item_path = path.index(i);
                let item_len = primitive::read_prim_uint(r, &item_path, *item_length_type, endianness)? as usize;
                // `r` is still in the outer coordinate system here; capture
                // the sub-buffer's absolute start before consuming it, since
                // the copied-out `raw` buffer always reads from its own 0.
                let sub_window_origin = window_origin + r.byte_offset();
                let raw = r.read_bytes(&item_path, item_len)?;
                let mut sub = BitReader::new(&raw, schema.default_bit_order);
                items.push(decode_one_item!(&mut sub, item_path, sub_window_origin, true));
            }
        }
        ArrayKind::ByteLengthPrefixed { length_type } => {
            let byte_len = primitive::read_prim_uint(r, path, *length_type, endianness)? as usize;
            let sub_window_origin = window_origin + r.byte_offset();
            let raw = r.read_bytes(path, byte_len)?;
            let mut sub = BitReader::new(&raw, schema.default_bit_order);
            let mut i = 0;
            while !sub.at_eof() {
                let item_path = path.index(i);
                items.push(decode_one_item!(&mut sub, item_path, sub_window_origin, true));
                i += 1;
            }
        }
        ArrayKind::FieldReferenced { length_field } => {
            let count = lookup_scoped(scope_stack, length_field).ok_or_else(|| Error::LengthFieldMissing {
                type_name: path.to_string(),
                field_name: path.to_string(),
                length_field: length_field.clone(),
            })? as usize;
            for i in 0..count {
                let item_path = path.index(i);
                items.push(decode_one_item!(r, item_path, window_origin, bounded));
            }
        }
        ArrayKind::ComputedCount { count_expr } => {
            let count = count_expr
                .eval(scope_stack.last().unwrap())
                .map_err(|source| Error::ExpressionError { path: path.clone(), source })? as usize;
            for i in 0..count {
                let item_path = path.index(i);
                items.push(decode_one_item!(r, item_path, window_origin, bounded));
            }
        }
        ArrayKind::NullTerminated { terminal_variants } => {
            let mut i = 0;
            loop {
                if terminal_variants.is_empty() {
                    let next = r.peek_uint(path, 1, endianness)?;
                    if next == 0 {
                        r.read_u8(path)?;
                        break;
                    }
                }
                let item_path = path.index(i);
                let value = decode_one_item!(r, item_path, window_origin, bounded);
                let is_terminal = value
                    .variant_type_name()
                    .and_then(|n| schema.lookup(n))
                    .map(|t| terminal_variants.contains(&t))
                    .unwrap_or(false);
                items.push(value);
                i += 1;
                if is_terminal {
                    break;
                }
                if r.at_eof() {
                    break;
                }
            }
        }
        ArrayKind::SignatureTerminated { terminator_type, terminator_value } => {
            let mut i = 0;
            loop {
                if r.at_eof() {
                    break;
                }
                let peeked = r.peek_uint(path, terminator_type.byte_width(), endianness)? as i64;
                if peeked == *terminator_value {
                    break;
                }
                let item_path = path.index(i);
                items.push(decode_one_item!(r, item_path, window_origin, bounded));
                i += 1;
            }
        }
        ArrayKind::VariantTerminated { terminal_variants } => {
            let mut i = 0;
            loop {
                let item_path = path.index(i);
                let value = decode_one_item!(r, item_path, window_origin, bounded);
                let is_terminal = value
                    .variant_type_name()
                    .and_then(|n| schema.lookup(n))
                    .map(|t| terminal_variants.contains(&t))
                    .unwrap_or(false);
                items.push(value);
                i += 1;
                if is_terminal || r.at_eof() {
                    break;
                }
            }
        }
        ArrayKind::EofTerminated => {
            let mut i = 0;
            while !r.at_eof() {
                let item_path = path.index(i);
                items.push(decode_one_item!(r, item_path, window_origin, bounded));
                i += 1;
            }
        }
        ArrayKind::Greedy => {
            if !bounded {
                return Err(Error::PositionOutOfBounds {
                    path: path.clone(),
                    position: r.byte_offset() as u64,
                    stream_len: r.len(),
                });
            }
            let mut i = 0;
            while !r.at_eof() {
                let item_path = path.index(i);
                items.push(decode_one_item!(r, item_path, window_origin, bounded));
                i += 1;
            }
        }
    }

    Ok(Value::Array(items))
}

pub mod stream;
pub use stream::StreamingArrayDecoder;
