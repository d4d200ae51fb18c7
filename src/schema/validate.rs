//! The validated schema model: an arena-keyed type graph plus the checks
//! from spec section 3's invariants.
//!
//! Grounded on the teacher's own design note ("Implementers should
//! represent the type graph in an arena keyed by integer type IDs; field
//! references are indices, never owning pointers"): [`TypeId`] is a plain
//! `u32` newtype indexing a `Vec<TypeDef>`, and name lookup goes through an
//! `FxHashMap` exactly like the teacher's `StreamParser` keys its per-stream
//! parsers by interned name.

use crate::error::{Diagnostic, Error};
use crate::expr::Expr;
use crate::bitstream::{BitOrder, Endianness};
use crate::schema::doc::*;
use fxhash::FxHashMap;
use internment::Intern;

/// Index into [`ValidatedSchema::types`]. Cheap to copy, never dangling
/// once validation succeeds.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TypeId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PrimIntType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl PrimIntType {
    pub fn byte_width(self) -> usize {
        match self {
            PrimIntType::U8 | PrimIntType::I8 => 1,
            PrimIntType::U16 | PrimIntType::I16 => 2,
            PrimIntType::U32 | PrimIntType::I32 => 4,
            PrimIntType::U64 | PrimIntType::I64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimIntType::I8 | PrimIntType::I16 | PrimIntType::I32 | PrimIntType::I64
        )
    }

    fn parse(s: &str) -> Option<PrimIntType> {
        Some(match s {
            "uint8" => PrimIntType::U8,
            "uint16" => PrimIntType::U16,
            "uint32" => PrimIntType::U32,
            "uint64" => PrimIntType::U64,
            "int8" => PrimIntType::I8,
            "int16" => PrimIntType::I16,
            "int32" => PrimIntType::I32,
            "int64" => PrimIntType::I64,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VarlengthEncoding {
    Der,
    Leb128,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StrEncoding {
    Ascii,
    Utf8,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StringKind {
    LengthPrefixed,
    NullTerminated,
    Fixed,
}

#[derive(Clone, Debug)]
pub struct StringDef {
    pub kind: StringKind,
    pub encoding: StrEncoding,
    pub length_type: Option<PrimIntType>,
    pub length: Option<usize>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PresenceType {
    Uint8,
    Bit,
}

#[derive(Clone, Debug)]
pub enum ArrayKind {
    Fixed {
        length: usize,
    },
    LengthPrefixed {
        length_type: PrimIntType,
    },
    LengthPrefixedItems {
        length_type: PrimIntType,
        item_length_type: PrimIntType,
    },
    ByteLengthPrefixed {
        length_type: PrimIntType,
    },
    FieldReferenced {
        length_field: String,
    },
    ComputedCount {
        count_expr: Expr,
    },
    NullTerminated {
        terminal_variants: Vec<TypeId>,
    },
    SignatureTerminated {
        terminator_type: PrimIntType,
        terminator_value: i64,
    },
    VariantTerminated {
        terminal_variants: Vec<TypeId>,
    },
    EofTerminated,
    Greedy,
}

#[derive(Clone, Debug)]
pub struct ArrayDef {
    pub kind: ArrayKind,
    pub item_type: TypeId,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OffsetFrom {
    MessageStart,
    CurrentPosition,
}

#[derive(Clone, Debug)]
pub struct BackReferenceDef {
    pub storage: PrimIntType,
    pub offset_mask: u64,
    pub offset_from: OffsetFrom,
    pub target_type: TypeId,
    pub endianness: Endianness,
}

#[derive(Clone, Debug)]
pub struct BitSlot {
    pub name: Intern<String>,
    pub offset: u32,
    pub size: u32,
    pub signed: bool,
}

/// One segment of a `computed`/`instance` target path.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PathSegment {
    Field(String),
    Parent,
    Root,
    FirstOfType(String),
    CorrespondingOfType(String),
}

#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct TargetPath(pub Vec<PathSegment>);

impl TargetPath {
    /// Parses the path language from spec 4.9: `name`, `parent.name`,
    /// `../name`, `_root.name`, `sections[first<T>]`,
    /// `sections[corresponding<T>]` / `sections[same_index<T>]`, and
    /// `target.subfield`.
    pub fn parse(s: &str) -> Result<TargetPath, String> {
        let mut segments = Vec::new();
        for raw in s.split('.') {
            if raw == ".." {
                segments.push(PathSegment::Parent);
                continue;
            }
            if raw == "_root" {
                segments.push(PathSegment::Root);
                continue;
            }
            if let Some(bracket) = raw.find('[') {
                if !raw.ends_with(']') {
                    return Err(format!("malformed path segment '{raw}'"));
                }
                let field_name = &raw[..bracket];
                let inner = &raw[bracket + 1..raw.len() - 1];
                segments.push(PathSegment::Field(field_name.to_owned()));
                if let Some(ty) = inner.strip_prefix("first<").and_then(|s| s.strip_suffix('>')) {
                    segments.push(PathSegment::FirstOfType(ty.to_owned()));
                } else if let Some(ty) = inner
                    .strip_prefix("corresponding<")
                    .and_then(|s| s.strip_suffix('>'))
                {
                    segments.push(PathSegment::CorrespondingOfType(ty.to_owned()));
                } else if let Some(ty) = inner
                    .strip_prefix("same_index<")
                    .and_then(|s| s.strip_suffix('>'))
                {
                    segments.push(PathSegment::CorrespondingOfType(ty.to_owned()));
                } else {
                    return Err(format!("unknown index selector '[{inner}]'"));
                }
            } else {
                segments.push(PathSegment::Field(raw.to_owned()));
            }
        }
        Ok(TargetPath(segments))
    }
}

#[derive(Clone, Debug)]
pub enum ComputedKind {
    LengthOf {
        target: TargetPath,
        from_after_field: Option<String>,
    },
    Crc32Of {
        target: TargetPath,
    },
    PositionOf {
        target: TargetPath,
    },
    SumOfTypeSizes {
        target: TargetPath,
        element_type: TypeId,
    },
}

#[derive(Clone, Debug)]
pub struct ComputedDef {
    pub kind: ComputedKind,
}

#[derive(Clone, Debug)]
pub enum FieldKind {
    UInt(PrimIntType),
    Int(PrimIntType),
    Float32,
    Float64,
    Bit { signed: bool, size: u32 },
    Bitfield { size: u32, fields: Vec<BitSlot> },
    Varlength { encoding: VarlengthEncoding },
    StringField(StringDef),
    ArrayField(ArrayDef),
    Optional { value_type: TypeId, presence_type: PresenceType },
    Padding { align_to: usize },
    BackReference(BackReferenceDef),
    TypeRef(TypeId),
}

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: Intern<String>,
    pub kind: FieldKind,
    pub const_value: Option<crate::value::Value>,
    pub conditional: Option<Expr>,
    pub computed: Option<ComputedDef>,
    pub endianness_override: Option<Endianness>,
    pub description: Option<String>,
}

#[derive(Clone, Debug)]
pub struct InstanceDef {
    pub name: Intern<String>,
    pub ty: TypeId,
    pub position: Expr,
    pub size: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct CompositeDef {
    pub name: Intern<String>,
    pub fields: Vec<FieldDef>,
    pub instances: Vec<InstanceDef>,
    /// True if this type (or a type it contains) declares instances --
    /// encoders must reject it per spec 4.8.
    pub decode_only: bool,
}

#[derive(Clone, Debug)]
pub enum DiscriminatorKind {
    Field(String),
    Peek { ty: PrimIntType, endianness: Endianness },
}

#[derive(Clone, Debug)]
pub struct VariantDef {
    pub when: Expr,
    pub target: TypeId,
}

#[derive(Clone, Debug)]
pub struct UnionDef {
    pub name: Intern<String>,
    pub discriminator: DiscriminatorKind,
    pub variants: Vec<VariantDef>,
}

#[derive(Clone, Debug)]
pub struct AliasDef {
    pub name: Intern<String>,
    pub target: TypeId,
}

#[derive(Clone, Debug)]
pub enum TypeDef {
    Composite(CompositeDef),
    Alias(AliasDef),
    Union(UnionDef),
}

impl TypeDef {
    pub fn name(&self) -> Intern<String> {
        match self {
            TypeDef::Composite(c) => c.name,
            TypeDef::Alias(a) => a.name,
            TypeDef::Union(u) => u.name,
        }
    }
}

/// A fully resolved, invariant-checked schema, ready to drive encode/decode.
#[derive(Clone, Debug)]
pub struct ValidatedSchema {
    pub default_endianness: Endianness,
    pub default_bit_order: BitOrder,
    pub types: Vec<TypeDef>,
    pub names: FxHashMap<Intern<String>, TypeId>,
}

impl ValidatedSchema {
    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0 as usize]
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.names.get(&Intern::new(name.to_owned())).copied()
    }
}

struct Builder<'a> {
    doc: &'a SchemaDoc,
    names: FxHashMap<Intern<String>, TypeId>,
    order: Vec<&'a str>,
    diagnostics: Vec<Diagnostic>,
}

/// Parses and validates a schema document, returning either a ready-to-use
/// schema or the full list of diagnostics (never a partial schema -- a
/// schema that fails validation is never handed to the driver).
pub fn validate(doc: &SchemaDoc) -> Result<ValidatedSchema, Error> {
    let mut order: Vec<&str> = doc.types.keys().map(|s| s.as_str()).collect();
    order.sort_unstable();
    let mut names = FxHashMap::default();
    for (i, name) in order.iter().enumerate() {
        names.insert(Intern::new((*name).to_owned()), TypeId(i as u32));
    }

    let default_endianness = match doc.config.endianness.unwrap_or(EndiannessDoc::BigEndian) {
        EndiannessDoc::BigEndian => Endianness::Big,
        EndiannessDoc::LittleEndian => Endianness::Little,
    };
    let default_bit_order = match doc.config.bit_order.unwrap_or(BitOrderDoc::MsbFirst) {
        BitOrderDoc::MsbFirst => BitOrder::MsbFirst,
        BitOrderDoc::LsbFirst => BitOrder::LsbFirst,
    };

    let mut builder = Builder {
        doc,
        names: names.clone(),
        order: order.clone(),
        diagnostics: Vec::new(),
    };

    let mut types = Vec::with_capacity(order.len());
    for name in &order {
        let type_doc = &doc.types[*name];
        types.push(builder.lower_type(name, type_doc, default_endianness));
    }

    if !builder.diagnostics.is_empty() {
        return Err(Error::SchemaInvalid(builder.diagnostics));
    }

    mark_decode_only(&mut types);
    check_cycles(&types, &mut builder.diagnostics);
    check_array_length_fields(&types, &mut builder.diagnostics);
    check_discriminator_order(&types, &mut builder.diagnostics);
    check_terminal_variants(&types, &mut builder.diagnostics);
    if !builder.diagnostics.is_empty() {
        return Err(Error::SchemaInvalid(builder.diagnostics));
    }

    Ok(ValidatedSchema {
        default_endianness,
        default_bit_order,
        types,
        names,
    })
}

impl<'a> Builder<'a> {
    fn diag(&mut self, type_name: &str, field_name: Option<&str>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            type_name: type_name.to_owned(),
            field_name: field_name.map(|s| s.to_owned()),
            message: message.into(),
        });
    }

    fn resolve_type(&mut self, type_name: &str, field_name: &str, name: &str) -> TypeId {
        match self.names.get(&Intern::new(name.to_owned())) {
            Some(id) => *id,
            None => {
                self.diag(
                    type_name,
                    Some(field_name),
                    format!("reference to undefined type '{name}'"),
                );
                TypeId(u32::MAX)
            }
        }
    }

    fn parse_prim_int(&mut self, type_name: &str, field_name: &str, s: &str) -> PrimIntType {
        PrimIntType::parse(s).unwrap_or_else(|| {
            self.diag(type_name, Some(field_name), format!("'{s}' is not an integer storage type"));
            PrimIntType::U8
        })
    }

    fn parse_endianness(&self, s: Option<&str>, default: Endianness) -> Endianness {
        match s {
            Some("little_endian") => Endianness::Little,
            Some("big_endian") => Endianness::Big,
            _ => default,
        }
    }

    fn parse_expr(&mut self, type_name: &str, field_name: &str, src: &str) -> Expr {
        match Expr::parse(src) {
            Ok(e) => e,
            Err(e) => {
                self.diag(type_name, Some(field_name), format!("invalid expression: {e}"));
                Expr::parse("0").unwrap()
            }
        }
    }

    fn parse_target_path(&mut self, type_name: &str, field_name: &str, s: &str) -> TargetPath {
        match TargetPath::parse(s) {
            Ok(p) => p,
            Err(e) => {
                self.diag(type_name, Some(field_name), format!("invalid target path: {e}"));
                TargetPath::default()
            }
        }
    }

    fn lower_type(&mut self, name: &str, doc: &TypeDoc, default_endianness: Endianness) -> TypeDef {
        match doc {
            TypeDoc::Composite { sequence, instances } => {
                let mut seen_names = std::collections::HashSet::new();
                let fields = sequence
                    .iter()
                    .map(|f| self.lower_field(name, f, default_endianness, &mut seen_names))
                    .collect();
                let instances = instances
                    .iter()
                    .map(|i| self.lower_instance(name, i))
                    .collect();
                TypeDef::Composite(CompositeDef {
                    name: Intern::new(name.to_owned()),
                    fields,
                    instances,
                    decode_only: false,
                })
            }
            TypeDoc::Union { discriminator, variants } => {
                let discriminator = match discriminator {
                    DiscriminatorDoc::Field { field } => DiscriminatorKind::Field(field.clone()),
                    DiscriminatorDoc::Peek { peek_type, endianness } => DiscriminatorKind::Peek {
                        ty: self.parse_prim_int(name, "<discriminator>", peek_type),
                        endianness: self.parse_endianness(endianness.as_deref(), default_endianness),
                    },
                };
                let variants = variants
                    .iter()
                    .map(|v| VariantDef {
                        when: self.parse_expr(name, "<variant>", &v.when),
                        target: self.resolve_type(name, "<variant>", &v.ty),
                    })
                    .collect();
                TypeDef::Union(UnionDef {
                    name: Intern::new(name.to_owned()),
                    discriminator,
                    variants,
                })
            }
            TypeDoc::Alias { alias } => TypeDef::Alias(AliasDef {
                name: Intern::new(name.to_owned()),
                target: self.resolve_type(name, "<alias>", alias),
            }),
        }
    }

    fn lower_instance(&mut self, type_name: &str, doc: &InstanceDoc) -> InstanceDef {
        InstanceDef {
            name: Intern::new(doc.name.clone()),
            ty: self.resolve_type(type_name, &doc.name, &doc.ty),
            position: self.parse_expr(type_name, &doc.name, &doc.position),
            size: doc.size.map(|n| n as usize),
        }
    }

    fn lower_field(
        &mut self,
        type_name: &str,
        doc: &FieldDoc,
        default_endianness: Endianness,
        seen_names: &mut std::collections::HashSet<String>,
    ) -> FieldDef {
        if doc.name.contains("__iter") {
            self.diag(
                type_name,
                Some(&doc.name),
                "field name contains the reserved substring '__iter'",
            );
        }
        if !seen_names.insert(doc.name.clone()) {
            self.diag(type_name, Some(&doc.name), "duplicate field name in sequence");
        }

        let endianness_override = doc
            .endianness
            .as_deref()
            .map(|s| self.parse_endianness(Some(s), default_endianness));
        let effective_endianness = endianness_override.unwrap_or(default_endianness);

        let kind = self.lower_field_kind(type_name, doc, effective_endianness);

        let const_value = doc
            .const_value
            .as_ref()
            .map(|v| json_to_const_value(v));

        let conditional = doc
            .conditional
            .as_deref()
            .map(|s| self.parse_expr(type_name, &doc.name, s));

        let computed = doc.computed.as_ref().map(|c| self.lower_computed(type_name, &doc.name, c));

        if const_value.is_some() && computed.is_some() {
            self.diag(
                type_name,
                Some(&doc.name),
                "a field cannot be both 'const' and 'computed'",
            );
        }

        FieldDef {
            name: Intern::new(doc.name.clone()),
            kind,
            const_value,
            conditional,
            computed,
            endianness_override,
            description: doc.description.clone(),
        }
    }

    fn lower_computed(&mut self, type_name: &str, field_name: &str, doc: &ComputedDoc) -> ComputedDef {
        let target = doc
            .target
            .as_deref()
            .map(|s| self.parse_target_path(type_name, field_name, s))
            .unwrap_or_default();
        let kind = match doc.kind.as_str() {
            "length_of" => ComputedKind::LengthOf {
                target,
                from_after_field: doc.from_after_field.clone(),
            },
            "crc32_of" => ComputedKind::Crc32Of { target },
            "position_of" => ComputedKind::PositionOf { target },
            "sum_of_type_sizes" => ComputedKind::SumOfTypeSizes {
                target,
                element_type: doc
                    .element_type
                    .as_deref()
                    .map(|t| self.resolve_type(type_name, field_name, t))
                    .unwrap_or(TypeId(u32::MAX)),
            },
            other => {
                self.diag(type_name, Some(field_name), format!("unknown computed.type '{other}'"));
                ComputedKind::LengthOf {
                    target: TargetPath::default(),
                    from_after_field: None,
                }
            }
        };
        ComputedDef { kind }
    }

    fn lower_field_kind(
        &mut self,
        type_name: &str,
        doc: &FieldDoc,
        endianness: Endianness,
    ) -> FieldKind {
        let _ = endianness;
        match doc.ty.as_str() {
            "uint8" => FieldKind::UInt(PrimIntType::U8),
            "uint16" => FieldKind::UInt(PrimIntType::U16),
            "uint32" => FieldKind::UInt(PrimIntType::U32),
            "uint64" => FieldKind::UInt(PrimIntType::U64),
            "int8" => FieldKind::Int(PrimIntType::I8),
            "int16" => FieldKind::Int(PrimIntType::I16),
            "int32" => FieldKind::Int(PrimIntType::I32),
            "int64" => FieldKind::Int(PrimIntType::I64),
            "float32" => FieldKind::Float32,
            "float64" => FieldKind::Float64,
            "bit" | "int_bits" => FieldKind::Bit {
                signed: doc.signed.unwrap_or(false),
                size: doc.size.unwrap_or(1),
            },
            "bitfield" => FieldKind::Bitfield {
                size: doc.size.unwrap_or(0),
                fields: doc
                    .fields
                    .as_ref()
                    .map(|slots| {
                        slots
                            .iter()
                            .map(|s| BitSlot {
                                name: Intern::new(s.name.clone()),
                                offset: s.offset,
                                size: s.size,
                                signed: s.signed,
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "varlength" => FieldKind::Varlength {
                encoding: match doc.encoding.as_deref() {
                    Some("leb128") => VarlengthEncoding::Leb128,
                    _ => VarlengthEncoding::Der,
                },
            },
            "string" => {
                let kind = match doc.kind.as_deref() {
                    Some("null_terminated") => StringKind::NullTerminated,
                    Some("fixed") => StringKind::Fixed,
                    _ => StringKind::LengthPrefixed,
                };
                let encoding = match doc.encoding.as_deref() {
                    Some("ascii") => StrEncoding::Ascii,
                    _ => StrEncoding::Utf8,
                };
                let length_type = doc
                    .length_type
                    .as_deref()
                    .map(|s| self.parse_prim_int(type_name, &doc.name, s));
                FieldKind::StringField(StringDef {
                    kind,
                    encoding,
                    length_type,
                    length: doc.length.map(|n| n as usize),
                })
            }
            "array" => {
                let item_type = doc
                    .item_type
                    .as_deref()
                    .map(|t| self.resolve_type(type_name, &doc.name, t))
                    .unwrap_or_else(|| {
                        self.diag(type_name, Some(&doc.name), "array field missing 'item_type'");
                        TypeId(u32::MAX)
                    });
                let kind = match doc.kind.as_deref().unwrap_or("fixed") {
                    "fixed" => ArrayKind::Fixed {
                        length: doc.length.unwrap_or(0) as usize,
                    },
                    "length_prefixed" => ArrayKind::LengthPrefixed {
                        length_type: self.parse_prim_int(
                            type_name,
                            &doc.name,
                            doc.length_type.as_deref().unwrap_or("uint32"),
                        ),
                    },
                    "length_prefixed_items" => ArrayKind::LengthPrefixedItems {
                        length_type: self.parse_prim_int(
                            type_name,
                            &doc.name,
                            doc.length_type.as_deref().unwrap_or("uint32"),
                        ),
                        item_length_type: self.parse_prim_int(
                            type_name,
                            &doc.name,
                            doc.item_length_type.as_deref().unwrap_or("uint8"),
                        ),
                    },
                    "byte_length_prefixed" => ArrayKind::ByteLengthPrefixed {
                        length_type: self.parse_prim_int(
                            type_name,
                            &doc.name,
                            doc.length_type.as_deref().unwrap_or("uint32"),
                        ),
                    },
                    "field_referenced" => ArrayKind::FieldReferenced {
                        length_field: doc.length_field.clone().unwrap_or_default(),
                    },
                    "computed_count" => ArrayKind::ComputedCount {
                        count_expr: self.parse_expr(
                            type_name,
                            &doc.name,
                            doc.count_expr.as_deref().unwrap_or("0"),
                        ),
                    },
                    "null_terminated" => ArrayKind::NullTerminated {
                        terminal_variants: doc
                            .terminal_variants
                            .as_ref()
                            .map(|names| {
                                names
                                    .iter()
                                    .map(|n| self.resolve_type(type_name, &doc.name, n))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    },
                    "signature_terminated" => ArrayKind::SignatureTerminated {
                        terminator_type: self.parse_prim_int(
                            type_name,
                            &doc.name,
                            doc.terminator_type.as_deref().unwrap_or("uint8"),
                        ),
                        terminator_value: doc.terminator_value.map(|v| v.0).unwrap_or(0),
                    },
                    "variant_terminated" => ArrayKind::VariantTerminated {
                        terminal_variants: doc
                            .terminal_variants
                            .as_ref()
                            .map(|names| {
                                names
                                    .iter()
                                    .map(|n| self.resolve_type(type_name, &doc.name, n))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    },
                    "eof_terminated" => ArrayKind::EofTerminated,
                    "greedy" => ArrayKind::Greedy,
                    other => {
                        self.diag(type_name, Some(&doc.name), format!("unknown array kind '{other}'"));
                        ArrayKind::EofTerminated
                    }
                };
                FieldKind::ArrayField(ArrayDef { kind, item_type })
            }
            "optional" => FieldKind::Optional {
                value_type: doc
                    .value_type
                    .as_deref()
                    .map(|t| self.resolve_type(type_name, &doc.name, t))
                    .unwrap_or_else(|| {
                        self.diag(type_name, Some(&doc.name), "optional field missing 'value_type'");
                        TypeId(u32::MAX)
                    }),
                presence_type: match doc.presence_type.as_deref() {
                    Some("bit") => PresenceType::Bit,
                    _ => PresenceType::Uint8,
                },
            },
            "padding" => FieldKind::Padding {
                align_to: doc.align_to.unwrap_or(2) as usize,
            },
            "back_reference" => FieldKind::BackReference(BackReferenceDef {
                storage: self.parse_prim_int(
                    type_name,
                    &doc.name,
                    doc.storage.as_deref().unwrap_or("uint16"),
                ),
                offset_mask: doc.offset_mask.map(|v| v.0 as u64).unwrap_or(u64::MAX),
                offset_from: match doc.offset_from.as_deref() {
                    Some("current_position") => OffsetFrom::CurrentPosition,
                    _ => OffsetFrom::MessageStart,
                },
                target_type: doc
                    .target_type
                    .as_deref()
                    .map(|t| self.resolve_type(type_name, &doc.name, t))
                    .unwrap_or_else(|| {
                        self.diag(type_name, Some(&doc.name), "back_reference missing 'target_type'");
                        TypeId(u32::MAX)
                    }),
                endianness: self.parse_endianness(doc.endianness.as_deref(), endianness),
            }),
            other => FieldKind::TypeRef(self.resolve_type(type_name, &doc.name, other)),
        }
    }
}

fn json_to_const_value(v: &serde_json::Value) -> crate::value::Value {
    use crate::value::Value;
    match v {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::F64(ordered_float::OrderedFloat(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_const_value).collect())
        }
        _ => Value::UInt(0),
    }
}

/// A composite inherits `decode_only` if it declares instances itself or
/// references (directly, through a field) a type that is decode-only.
fn mark_decode_only(types: &mut [TypeDef]) {
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..types.len() {
            let already = matches!(&types[i], TypeDef::Composite(c) if c.decode_only);
            if already {
                continue;
            }
            let should = match &types[i] {
                TypeDef::Composite(c) => {
                    !c.instances.is_empty()
                        || c.fields.iter().any(|f| field_refs_decode_only(f, types))
                }
                _ => false,
            };
            if should {
                if let TypeDef::Composite(c) = &mut types[i] {
                    c.decode_only = true;
                    changed = true;
                }
            }
        }
    }
}

fn type_is_decode_only(id: TypeId, types: &[TypeDef]) -> bool {
    if (id.0 as usize) >= types.len() {
        return false;
    }
    matches!(&types[id.0 as usize], TypeDef::Composite(c) if c.decode_only)
}

fn field_refs_decode_only(field: &FieldDef, types: &[TypeDef]) -> bool {
    match &field.kind {
        FieldKind::TypeRef(id) => type_is_decode_only(*id, types),
        FieldKind::ArrayField(a) => type_is_decode_only(a.item_type, types),
        FieldKind::Optional { value_type, .. } => type_is_decode_only(*value_type, types),
        _ => false,
    }
}

/// Direct recursion through `sequence` is rejected; recursion through a
/// pointer or instance boundary is fine because stream re-entry bounds
/// depth by input size (spec 9).
fn check_cycles(types: &[TypeDef], diagnostics: &mut Vec<Diagnostic>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }
    let mut marks = vec![Mark::Unvisited; types.len()];

    fn visit(id: usize, types: &[TypeDef], marks: &mut [Mark], diagnostics: &mut Vec<Diagnostic>) {
        if marks[id] == Mark::Done {
            return;
        }
        if marks[id] == Mark::Visiting {
            diagnostics.push(Diagnostic {
                type_name: types[id].name().as_str().to_owned(),
                field_name: None,
                message: "type is recursive through 'sequence' without passing through a pointer or instance boundary".to_owned(),
            });
            return;
        }
        marks[id] = Mark::Visiting;
        if let TypeDef::Composite(c) = &types[id] {
            for f in &c.fields {
                let next = match &f.kind {
                    FieldKind::TypeRef(t) => Some(*t),
                    FieldKind::ArrayField(a) => Some(a.item_type),
                    FieldKind::Optional { value_type, .. } => Some(*value_type),
                    _ => None,
                };
                if let Some(t) = next {
                    if (t.0 as usize) < types.len() {
                        visit(t.0 as usize, types, marks, diagnostics);
                    }
                }
            }
        }
        marks[id] = Mark::Done;
    }

    for i in 0..types.len() {
        visit(i, types, &mut marks, diagnostics);
    }
}

/// Invariant 3 (the `field_referenced` slice of it) plus §4.2's explicit
/// "rejects unresolved `length_field`" promise: an unqualified `length_field`
/// must name an earlier field in the same sequence. A qualified path
/// (`_root.x`, dotted) is left to the driver's scope lookup -- validating it
/// here would require the same cross-scope resolution the driver already
/// does at encode/decode time.
fn check_array_length_fields(types: &[TypeDef], diagnostics: &mut Vec<Diagnostic>) {
    for ty in types {
        let TypeDef::Composite(c) = ty else { continue };
        for (i, field) in c.fields.iter().enumerate() {
            let FieldKind::ArrayField(array) = &field.kind else { continue };
            let ArrayKind::FieldReferenced { length_field } = &array.kind else { continue };
            if length_field.is_empty() || length_field.contains('.') {
                if length_field.is_empty() {
                    diagnostics.push(Diagnostic {
                        type_name: c.name.as_str().to_owned(),
                        field_name: Some(field.name.as_str().to_owned()),
                        message: "field_referenced array is missing 'length_field'".to_owned(),
                    });
                }
                continue;
            }
            let resolves = c.fields[..i].iter().any(|f| f.name.as_str() == length_field.as_str());
            if !resolves {
                diagnostics.push(Diagnostic {
                    type_name: c.name.as_str().to_owned(),
                    field_name: Some(field.name.as_str().to_owned()),
                    message: format!(
                        "length_field '{length_field}' does not name an earlier field in '{}'",
                        c.name
                    ),
                });
            }
        }
    }
}

/// Invariant 5: a `field`-discriminated union reached through a plain type
/// reference needs its discriminator field to be an earlier field in the
/// referencing composite's own sequence. Peek discriminators have no such
/// requirement -- they read from the stream directly, not the scope.
fn check_discriminator_order(types: &[TypeDef], diagnostics: &mut Vec<Diagnostic>) {
    for ty in types {
        let TypeDef::Composite(c) = ty else { continue };
        for (i, field) in c.fields.iter().enumerate() {
            let FieldKind::TypeRef(target) = &field.kind else { continue };
            let Some(TypeDef::Union(u)) = types.get(target.0 as usize) else { continue };
            let DiscriminatorKind::Field(disc_name) = &u.discriminator else { continue };
            let resolves = c.fields[..i].iter().any(|f| f.name.as_str() == disc_name.as_str());
            if !resolves {
                diagnostics.push(Diagnostic {
                    type_name: c.name.as_str().to_owned(),
                    field_name: Some(field.name.as_str().to_owned()),
                    message: format!(
                        "discriminator field '{disc_name}' for union '{}' does not name an earlier field in '{}'",
                        u.name, c.name
                    ),
                });
            }
        }
    }
}

/// Is `target` reachable from `from` by following alias targets and union
/// variants? Used to check invariant 6: a `terminal_variants` entry must
/// name a type reachable through the array's own item type.
fn type_reachable(from: TypeId, target: TypeId, types: &[TypeDef], visited: &mut std::collections::HashSet<u32>) -> bool {
    if from == target {
        return true;
    }
    if !visited.insert(from.0) {
        return false;
    }
    match &types[from.0 as usize] {
        TypeDef::Alias(a) => type_reachable(a.target, target, types, visited),
        TypeDef::Union(u) => u.variants.iter().any(|v| type_reachable(v.target, target, types, visited)),
        TypeDef::Composite(_) => false,
    }
}

/// Invariant 6: `terminal_variants` in a `null_terminated`/`variant_terminated`
/// array must name types reachable through the array's item type.
fn check_terminal_variants(types: &[TypeDef], diagnostics: &mut Vec<Diagnostic>) {
    for ty in types {
        let TypeDef::Composite(c) = ty else { continue };
        for field in &c.fields {
            let FieldKind::ArrayField(array) = &field.kind else { continue };
            let terminal_variants = match &array.kind {
                ArrayKind::NullTerminated { terminal_variants } => terminal_variants,
                ArrayKind::VariantTerminated { terminal_variants } => terminal_variants,
                _ => continue,
            };
            for terminal in terminal_variants {
                let mut visited = std::collections::HashSet::new();
                if !type_reachable(array.item_type, *terminal, types, &mut visited) {
                    diagnostics.push(Diagnostic {
                        type_name: c.name.as_str().to_owned(),
                        field_name: Some(field.name.as_str().to_owned()),
                        message: format!(
                            "terminal variant '{}' is not reachable through item type '{}'",
                            types[terminal.0 as usize].name(),
                            types[array.item_type.0 as usize].name()
                        ),
                    });
                }
            }
        }
    }
}
