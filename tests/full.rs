use binschema::testsuite::{run_bundle, TestBundle};
use pretty_assertions::assert_eq;
use test_log::test;

fn load(path: &str) -> TestBundle {
    let raw = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn run_file(path: &str) {
    let bundle = load(path);
    run_bundle_ok(&bundle);
}

fn run_inline(json: &str) {
    let bundle: TestBundle = serde_json::from_str(json).unwrap();
    run_bundle_ok(&bundle);
}

fn run_bundle_ok(bundle: &TestBundle) {
    let results = run_bundle(bundle);
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|e| format!("{name}: {e}")))
        .collect();
    assert_eq!(failures, Vec::<String>::new(), "bundle '{}' had failing cases", bundle.name);
}

#[test]
fn computed_length_utf8_string() {
    run_file("test_resources/fixtures/full/computed_length.json");
}

#[test]
fn dns_compression_pointer() {
    run_file("test_resources/fixtures/full/dns_pointer.json");
}

#[test]
fn zip_style_archive() {
    run_file("test_resources/fixtures/full/zip.json");
}

/// Repeated decode of the same bytes yields the same value, and streaming
/// the same bytes in arbitrary chunk sizes through `decode_stream` yields
/// the same items as decoding them all at once.
#[test]
fn streamed_decode_matches_one_shot_and_is_pure() {
    run_inline(
        r#"{
            "name": "chunked_items",
            "schema": {
                "config": {"endianness": "big_endian"},
                "types": {
                    "Chunk": {"sequence": [{"name": "value", "type": "uint8"}]},
                    "ItemsMessage": {
                        "sequence": [
                            {"name": "items", "type": "array", "kind": "length_prefixed_items", "length_type": "uint16", "item_length_type": "uint8", "item_type": "Chunk"}
                        ]
                    }
                }
            },
            "test_type": "ItemsMessage",
            "test_cases": [
                {
                    "name": "two_chunks_fed_piecemeal",
                    "bytes": [0, 2, 1, 170, 1, 187],
                    "chunkSizes": [1, 2, 3]
                }
            ]
        }"#,
    );
}

/// A `const_value` field round-trips when the supplied value matches, and
/// rejects encoding when it doesn't.
#[test]
fn const_field_validation() {
    run_inline(
        r#"{
            "name": "const_magic",
            "schema": {
                "config": {"endianness": "big_endian"},
                "types": {
                    "Header": {"sequence": [{"name": "magic", "type": "uint32", "const_value": 305419896}]}
                }
            },
            "test_type": "Header",
            "test_cases": [
                {"name": "matches_const", "value": {}, "decoded_value": {"magic": 305419896}, "bytes": [18, 52, 86, 120]},
                {"name": "mismatched_const_rejected", "value": {"magic": 1}, "should_error_on_encode": true}
            ]
        }"#,
    );
}

/// A field name containing the reserved `__iter` substring fails schema
/// validation before any encode/decode is attempted.
#[test]
fn reserved_field_name_rejected() {
    run_inline(
        r#"{
            "name": "reserved_name",
            "schema": {
                "types": {
                    "Bad": {"sequence": [{"name": "loop__iter_count", "type": "uint8"}]}
                }
            },
            "test_type": "Bad",
            "test_cases": [
                {"name": "reserved_substring", "schema_validation_error": true}
            ]
        }"#,
    );
}

/// A field cannot declare both `const_value` and `computed` -- schema
/// validation rejects the ambiguity up front.
#[test]
fn const_and_computed_are_mutually_exclusive() {
    run_inline(
        r#"{
            "name": "const_computed_conflict",
            "schema": {
                "types": {
                    "Confused": {
                        "sequence": [
                            {"name": "payload", "type": "array", "kind": "fixed", "length": 1, "item_type": "Chunk"},
                            {"name": "len", "type": "uint8", "const_value": 1, "computed": {"type": "length_of", "target": "payload"}}
                        ]
                    },
                    "Chunk": {"sequence": [{"name": "value", "type": "uint8"}]}
                }
            },
            "test_type": "Confused",
            "test_cases": [
                {"name": "conflicting_attributes", "schema_validation_error": true}
            ]
        }"#,
    );
}

/// Supplying a value for a `computed` field on encode is rejected -- the
/// field's value is derived, not provided.
#[test]
fn computed_field_rejects_explicit_input() {
    run_inline(
        r#"{
            "name": "computed_exclusivity",
            "schema": {
                "types": {
                    "Chunk": {"sequence": [{"name": "value", "type": "uint8"}]},
                    "Framed": {
                        "sequence": [
                            {"name": "len", "type": "uint16", "computed": {"type": "length_of", "target": "payload"}},
                            {"name": "payload", "type": "array", "kind": "fixed", "length": 2, "item_type": "Chunk"}
                        ]
                    }
                }
            },
            "test_type": "Framed",
            "test_cases": [
                {
                    "name": "explicit_len_rejected",
                    "value": {"len": 99, "payload": [{"value": 1}, {"value": 2}]},
                    "should_error_on_encode": true
                }
            ]
        }"#,
    );
}

/// A `field_referenced` array whose `length_field` names no field at all
/// fails schema validation rather than surfacing as a decode-time error.
#[test]
fn unresolved_length_field_rejected() {
    run_inline(
        r#"{
            "name": "length_field_unresolved",
            "schema": {
                "types": {
                    "Chunk": {"sequence": [{"name": "value", "type": "uint8"}]},
                    "Framed": {"sequence": [{"name": "items", "type": "array", "kind": "field_referenced", "length_field": "count", "item_type": "Chunk"}]}
                }
            },
            "test_type": "Framed",
            "test_cases": [
                {"name": "no_such_field", "schema_validation_error": true}
            ]
        }"#,
    );
}

/// A field-discriminated union reached directly from a composite field
/// needs its discriminator to name an earlier field in that composite.
#[test]
fn discriminator_field_must_be_earlier() {
    run_inline(
        r#"{
            "name": "discriminator_field_not_earlier",
            "schema": {
                "types": {
                    "Chunk": {"sequence": [{"name": "value", "type": "uint8"}]},
                    "Payload": {"discriminator": {"field": "kind"}, "variants": [{"when": "true", "type": "Chunk"}]},
                    "Wrapper": {"sequence": [{"name": "payload", "type": "Payload"}]}
                }
            },
            "test_type": "Wrapper",
            "test_cases": [
                {"name": "no_kind_field_before_payload", "schema_validation_error": true}
            ]
        }"#,
    );
}

/// A `terminal_variants` entry must name a type reachable through the
/// array's own item type, not an unrelated one.
#[test]
fn terminal_variant_must_be_reachable() {
    run_inline(
        r#"{
            "name": "terminal_variant_unreachable",
            "schema": {
                "types": {
                    "Chunk": {"sequence": [{"name": "value", "type": "uint8"}]},
                    "Other": {"sequence": [{"name": "value", "type": "uint8"}]},
                    "Stream": {"sequence": [{"name": "items", "type": "array", "kind": "null_terminated", "item_type": "Chunk", "terminal_variants": ["Other"]}]}
                }
            },
            "test_type": "Stream",
            "test_cases": [
                {"name": "terminal_not_reachable", "schema_validation_error": true}
            ]
        }"#,
    );
}

/// A `fixed`-kind array whose item count doesn't match its declared length
/// is rejected rather than silently truncated or zero-padded.
#[test]
fn fixed_array_length_mismatch_rejected() {
    run_inline(
        r#"{
            "name": "fixed_array_size",
            "schema": {
                "types": {
                    "Chunk": {"sequence": [{"name": "value", "type": "uint8"}]},
                    "Pair": {"sequence": [{"name": "items", "type": "array", "kind": "fixed", "length": 2, "item_type": "Chunk"}]}
                }
            },
            "test_type": "Pair",
            "test_cases": [
                {
                    "name": "too_many_items",
                    "value": {"items": [{"value": 1}, {"value": 2}, {"value": 3}]},
                    "should_error_on_encode": true
                }
            ]
        }"#,
    );
}
