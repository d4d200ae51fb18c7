//! Loader and runner for the JSON test-bundle format: a schema document
//! plus a list of literal-byte test cases, mirroring the teacher crate's
//! own config-driven test fixtures but carrying encode/decode expectations
//! instead of just parse expectations.
//!
//! Grounded in spec section 6's "Test bundle format" and section 8's
//! testable properties; this module is the harness `tests/full.rs` drives,
//! not a public codec surface.

use std::fmt;

use bytes::BytesMut;
use internment::Intern;
use ordered_float::OrderedFloat;
use serde::Deserialize;
use serde_json::Value as Json;
use tokio_util::codec::Decoder;

use crate::error::Error;
use crate::schema::validate::{ArrayDef, CompositeDef, FieldDef, FieldKind, TypeDef, TypeId, UnionDef, ValidatedSchema};
use crate::value::Value;
use crate::Schema;

/// One JSON test-bundle document: a schema plus the cases exercised against it.
#[derive(Debug, Clone, Deserialize)]
pub struct TestBundle {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schema: Json,
    pub test_type: String,
    pub test_cases: Vec<TestCase>,
}

/// One literal-input/literal-output case within a bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub bits: Option<Vec<u8>>,
    #[serde(default)]
    pub value: Option<Json>,
    #[serde(default)]
    pub decoded_value: Option<Json>,
    #[serde(default)]
    pub should_error_on_encode: bool,
    #[serde(default)]
    pub should_error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, rename = "chunkSizes")]
    pub chunk_sizes: Option<Vec<usize>>,
    #[serde(default)]
    pub schema_validation_error: bool,
}

impl TestCase {
    /// The literal wire bytes this case names, from `bytes` directly or
    /// packed MSB-first from a `bits` array of 0/1.
    fn expected_bytes(&self) -> Result<Option<Vec<u8>>, String> {
        if let Some(bytes) = &self.bytes {
            return Ok(Some(bytes.clone()));
        }
        let Some(bits) = &self.bits else { return Ok(None) };
        if bits.len() % 8 != 0 {
            return Err(format!("`bits` length {} is not a whole number of bytes", bits.len()));
        }
        let mut out = Vec::with_capacity(bits.len() / 8);
        for chunk in bits.chunks(8) {
            let mut byte = 0u8;
            for &bit in chunk {
                byte = (byte << 1) | (bit != 0) as u8;
            }
            out.push(byte);
        }
        Ok(Some(out))
    }
}

/// A single case's assertion failure, carrying the case's name for the
/// caller to report.
#[derive(Debug)]
pub struct CaseFailure {
    pub case_name: String,
    pub message: String,
}

impl fmt::Display for CaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.case_name, self.message)
    }
}

impl std::error::Error for CaseFailure {}

/// Builds the bundle's schema and runs every case against it, in order.
/// Each case's outcome is independent of its siblings' -- one failing case
/// does not stop the rest from running.
pub fn run_bundle(bundle: &TestBundle) -> Vec<(String, Result<(), CaseFailure>)> {
    let schema_json = bundle.schema.to_string();
    let schema_result = Schema::from_json(&schema_json);

    bundle
        .test_cases
        .iter()
        .enumerate()
        .map(|(i, case)| {
            let case_name = case.name.clone().unwrap_or_else(|| format!("{}#{i}", bundle.name));
            let result = run_case(&schema_result, &bundle.test_type, case, &case_name);
            (case_name, result)
        })
        .collect()
}

fn fail(case_name: &str, message: impl Into<String>) -> CaseFailure {
    CaseFailure { case_name: case_name.to_owned(), message: message.into() }
}

fn run_case(
    schema_result: &Result<Schema, Error>,
    root_type: &str,
    case: &TestCase,
    case_name: &str,
) -> Result<(), CaseFailure> {
    if case.schema_validation_error {
        return match schema_result {
            Err(_) => Ok(()),
            Ok(_) => Err(fail(case_name, "schema was expected to fail validation but loaded successfully")),
        };
    }

    let schema = schema_result.as_ref().map_err(|e| fail(case_name, format!("schema failed to load: {e}")))?;
    let root_id = schema
        .validated()
        .lookup(root_type)
        .ok_or_else(|| fail(case_name, format!("unknown root type '{root_type}'")))?;

    let expected_bytes = case.expected_bytes().map_err(|m| fail(case_name, m))?;

    if case.should_error_on_encode {
        let value_json = case.value.as_ref().ok_or_else(|| fail(case_name, "should_error_on_encode case is missing `value`"))?;
        let value = json_to_value(schema.validated(), root_id, value_json).map_err(|e| fail(case_name, e))?;
        return match schema.encode(root_type, &value) {
            Ok(_) => Err(fail(case_name, "expected encode to fail but it succeeded")),
            Err(e) => check_error_message(case, &e, case_name),
        };
    }

    if case.should_error {
        let bytes = expected_bytes.clone().ok_or_else(|| fail(case_name, "should_error case is missing `bytes`/`bits`"))?;
        return match schema.decode(root_type, &bytes) {
            Ok(_) => Err(fail(case_name, "expected decode to fail but it succeeded")),
            Err(e) => check_error_message(case, &e, case_name),
        };
    }

    if let Some(value_json) = &case.value {
        let value = json_to_value(schema.validated(), root_id, value_json).map_err(|e| fail(case_name, e))?;
        let encoded = schema.encode(root_type, &value).map_err(|e| fail(case_name, format!("encode failed: {e}")))?;

        if let Some(expected) = &expected_bytes {
            if &encoded != expected {
                return Err(fail(
                    case_name,
                    format!("encoded bytes {:02x?} did not match expected {:02x?}", encoded, expected),
                ));
            }
        }

        let decoded = schema
            .decode(root_type, &encoded)
            .map_err(|e| fail(case_name, format!("decode(encode(value)) failed: {e}")))?;
        let expected_decoded_json = case.decoded_value.as_ref().unwrap_or(value_json);
        let expected_decoded =
            json_to_value(schema.validated(), root_id, expected_decoded_json).map_err(|e| fail(case_name, e))?;
        if decoded != expected_decoded {
            return Err(fail(case_name, "decode(encode(value)) did not match the expected decoded value"));
        }
    } else if let Some(bytes) = &expected_bytes {
        let decoded_once = schema.decode(root_type, bytes).map_err(|e| fail(case_name, format!("decode failed: {e}")))?;
        let decoded_again = schema
            .decode(root_type, bytes)
            .map_err(|e| fail(case_name, format!("decode failed on repeat: {e}")))?;
        if decoded_once != decoded_again {
            return Err(fail(case_name, "decode was not pure: repeated decode of the same bytes produced different values"));
        }
        if let Some(expected_decoded_json) = &case.decoded_value {
            let expected_decoded =
                json_to_value(schema.validated(), root_id, expected_decoded_json).map_err(|e| fail(case_name, e))?;
            if decoded_once != expected_decoded {
                return Err(fail(case_name, "decoded value did not match `decoded_value`"));
            }
        }
    }

    if let Some(chunk_sizes) = &case.chunk_sizes {
        let bytes = expected_bytes
            .clone()
            .ok_or_else(|| fail(case_name, "chunkSizes case requires `bytes`/`bits`"))?;
        let one_shot = schema
            .decode(root_type, &bytes)
            .map_err(|e| fail(case_name, format!("one-shot decode failed: {e}")))?;
        let streamed = decode_chunked(schema, root_type, &bytes, chunk_sizes).map_err(|e| fail(case_name, e))?;
        if streamed != one_shot {
            return Err(fail(case_name, "streamed decode did not match the one-shot decode"));
        }
    }

    Ok(())
}

fn check_error_message(case: &TestCase, error: &Error, case_name: &str) -> Result<(), CaseFailure> {
    if let Some(needle) = &case.error_message {
        let haystack = error.to_string();
        if !haystack.contains(needle.as_str()) {
            return Err(fail(
                case_name,
                format!("error message '{haystack}' did not contain expected substring '{needle}'"),
            ));
        }
    }
    Ok(())
}

/// Feeds `bytes` through [`Schema::decode_stream`] in `chunk_sizes`-sized
/// pieces (repeating the last size for any remainder) and collects the
/// yielded items back into a `Value::Array`, for comparison against a
/// one-shot decode of the same bytes.
fn decode_chunked(schema: &Schema, root_type: &str, bytes: &[u8], chunk_sizes: &[usize]) -> Result<Value, String> {
    let mut decoder = schema.decode_stream(root_type).map_err(|e| e.to_string())?;
    let mut buf = BytesMut::new();
    let mut items = Vec::new();
    let mut offset = 0;
    let mut chunk_idx = 0;

    while offset < bytes.len() {
        let size = chunk_sizes.get(chunk_idx).copied().unwrap_or_else(|| *chunk_sizes.last().unwrap_or(&bytes.len()));
        let end = (offset + size.max(1)).min(bytes.len());
        buf.extend_from_slice(&bytes[offset..end]);
        offset = end;
        chunk_idx += 1;

        while let Some(item) = decoder.decode(&mut buf).map_err(|e| e.to_string())? {
            items.push(item);
        }
    }

    Ok(Value::Array(items))
}

/// Converts a JSON fixture value into the typed [`Value`] tree `encode`
/// expects and `decode` produces, guided by the schema's own field-kind
/// declarations (a JSON number alone can't distinguish a `uint16` from an
/// `int32` from a bitfield slot -- the schema tells us which).
pub fn json_to_value(schema: &ValidatedSchema, type_id: TypeId, json: &Json) -> Result<Value, String> {
    match schema.type_def(type_id) {
        TypeDef::Composite(c) => json_to_composite(schema, c, json),
        TypeDef::Alias(a) => json_to_value(schema, a.target, json),
        TypeDef::Union(u) => json_to_union(schema, u, json),
    }
}

fn json_to_composite(schema: &ValidatedSchema, composite: &CompositeDef, json: &Json) -> Result<Value, String> {
    let obj = json
        .as_object()
        .ok_or_else(|| format!("expected an object for type '{}'", composite.name))?;
    let mut fields = Vec::with_capacity(composite.fields.len());
    for field in &composite.fields {
        if matches!(field.kind, FieldKind::Padding { .. }) {
            continue;
        }
        let j = obj.get(field.name.as_str());
        match (&field.kind, j) {
            // An optional field absent from the fixture, or present but
            // explicitly `null`, means "not present" on both sides of the
            // wire -- `decode` always emits the field, so the expected
            // value must carry it too, as `Option(None)`.
            (FieldKind::Optional { .. }, None) => fields.push((field.name, Value::Option(None))),
            (FieldKind::Optional { .. }, Some(j)) if j.is_null() => fields.push((field.name, Value::Option(None))),
            (_, None) => continue,
            (_, Some(j)) => fields.push((field.name, json_to_field(schema, field, j)?)),
        }
    }
    Ok(Value::Record(fields))
}

fn json_to_union(schema: &ValidatedSchema, union: &UnionDef, json: &Json) -> Result<Value, String> {
    let obj = json
        .as_object()
        .ok_or_else(|| format!("expected an object for union '{}' (shape {{type, value}})", union.name))?;
    let ty_name = obj
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| format!("union '{}' value is missing a 'type' field", union.name))?;
    let inner_json = obj
        .get("value")
        .ok_or_else(|| format!("union '{}' value is missing a 'value' field", union.name))?;
    let variant = union
        .variants
        .iter()
        .find(|v| schema.type_def(v.target).name().as_str() == ty_name)
        .ok_or_else(|| format!("union '{}' has no variant named '{ty_name}'", union.name))?;
    let inner = json_to_value(schema, variant.target, inner_json)?;
    Ok(Value::Variant { ty: Intern::new(ty_name.to_owned()), value: Box::new(inner) })
}

fn json_to_field(schema: &ValidatedSchema, field: &FieldDef, json: &Json) -> Result<Value, String> {
    json_to_field_kind(schema, &field.kind, json, field.name.as_str())
}

fn json_to_field_kind(schema: &ValidatedSchema, kind: &FieldKind, json: &Json, field_name: &str) -> Result<Value, String> {
    match kind {
        FieldKind::UInt(_) => Ok(Value::UInt(json_as_u64(json, field_name)?)),
        FieldKind::Int(_) => Ok(Value::Int(json_as_i64(json, field_name)?)),
        FieldKind::Float32 => Ok(Value::F32(OrderedFloat(json_as_f64(json, field_name)? as f32))),
        FieldKind::Float64 => Ok(Value::F64(OrderedFloat(json_as_f64(json, field_name)?))),
        FieldKind::Bit { signed, .. } => {
            if *signed {
                Ok(Value::Int(json_as_i64(json, field_name)?))
            } else {
                Ok(Value::UInt(json_as_u64(json, field_name)?))
            }
        }
        FieldKind::Bitfield { fields, .. } => {
            let obj = json
                .as_object()
                .ok_or_else(|| format!("expected an object for bitfield '{field_name}'"))?;
            let mut out = Vec::with_capacity(fields.len());
            for slot in fields {
                let Some(j) = obj.get(slot.name.as_str()) else { continue };
                let v = if slot.signed {
                    Value::Int(json_as_i64(j, slot.name.as_str())?)
                } else {
                    Value::UInt(json_as_u64(j, slot.name.as_str())?)
                };
                out.push((slot.name, v));
            }
            Ok(Value::Record(out))
        }
        FieldKind::Varlength { .. } => Ok(Value::UInt(json_as_u64(json, field_name)?)),
        FieldKind::StringField(_) => Ok(Value::Str(
            json.as_str().ok_or_else(|| format!("expected a string for '{field_name}'"))?.to_owned(),
        )),
        FieldKind::Padding { .. } => Ok(Value::UInt(0)),
        FieldKind::Optional { value_type, .. } => {
            Ok(Value::Option(Some(Box::new(json_to_value(schema, *value_type, json)?))))
        }
        FieldKind::ArrayField(array) => json_to_array(schema, array, json, field_name),
        FieldKind::BackReference(back) => json_to_value(schema, back.target_type, json),
        FieldKind::TypeRef(target) => json_to_value(schema, *target, json),
    }
}

fn json_to_array(schema: &ValidatedSchema, array: &ArrayDef, json: &Json, field_name: &str) -> Result<Value, String> {
    let items = json
        .as_array()
        .ok_or_else(|| format!("expected an array for '{field_name}'"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(json_to_value(schema, array.item_type, item)?);
    }
    Ok(Value::Array(out))
}

fn json_as_u64(json: &Json, field_name: &str) -> Result<u64, String> {
    json.as_u64()
        .or_else(|| json.as_i64().map(|v| v as u64))
        .ok_or_else(|| format!("expected an unsigned integer for '{field_name}', got {json}"))
}

fn json_as_i64(json: &Json, field_name: &str) -> Result<i64, String> {
    json.as_i64().ok_or_else(|| format!("expected an integer for '{field_name}', got {json}"))
}

fn json_as_f64(json: &Json, field_name: &str) -> Result<f64, String> {
    json.as_f64().ok_or_else(|| format!("expected a number for '{field_name}', got {json}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_pack_msb_first() {
        let case = TestCase {
            name: None,
            bytes: None,
            bits: Some(vec![1, 0, 1, 0, 1, 0, 1, 0]),
            value: None,
            decoded_value: None,
            should_error_on_encode: false,
            should_error: false,
            error_message: None,
            chunk_sizes: None,
            schema_validation_error: false,
        };
        assert_eq!(case.expected_bytes().unwrap(), Some(vec![0b1010_1010]));
    }

    #[test]
    fn point_struct_bundle_round_trips() {
        let bundle: TestBundle = serde_json::from_str(
            r#"{
                "name": "point",
                "schema": {
                    "config": {"endianness": "big_endian"},
                    "types": {
                        "Point": {"sequence": [
                            {"name": "x", "type": "uint16"},
                            {"name": "y", "type": "uint16"}
                        ]}
                    }
                },
                "test_type": "Point",
                "test_cases": [
                    {"value": {"x": 4660, "y": 22136}, "bytes": [0x12, 0x34, 0x56, 0x78]}
                ]
            }"#,
        )
        .unwrap();

        let results = run_bundle(&bundle);
        assert_eq!(results.len(), 1);
        for (name, result) in results {
            assert!(result.is_ok(), "{name}: {:?}", result.err());
        }
    }
}
