//! Raw, serde-deserializable shape of a schema document.
//!
//! Mirrors the teacher crate's `config.rs` (a structured YAML document
//! decoded straight into plain structs, with kebab-case-style field names
//! and a handful of custom scalar deserializers) but over JSON, with a flat
//! `FieldDoc` carrying every tag's attributes as optional fields rather than
//! an enum-per-tag -- the field's `type` string and which optional
//! attributes are set together pick the tag, resolved in
//! `schema::validate`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// An integer constant as it appears in a schema document: a JSON number or
/// a `0x...` hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntLiteral(pub i64);

impl<'de> Deserialize<'de> for IntLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(i64),
            Str(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(IntLiteral(n)),
            Repr::Str(s) => {
                let s = s.trim();
                if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    i64::from_str_radix(hex, 16)
                        .map(IntLiteral)
                        .map_err(|e| D::Error::custom(format!("invalid hex literal '{s}': {e}")))
                } else {
                    s.parse::<i64>()
                        .map(IntLiteral)
                        .map_err(|e| D::Error::custom(format!("invalid integer literal '{s}': {e}")))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EndiannessDoc {
    BigEndian,
    LittleEndian,
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BitOrderDoc {
    MsbFirst,
    LsbFirst,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigDoc {
    #[serde(default)]
    pub endianness: Option<EndiannessDoc>,
    #[serde(default)]
    pub bit_order: Option<BitOrderDoc>,
}

impl Default for ConfigDoc {
    fn default() -> Self {
        ConfigDoc {
            endianness: Some(EndiannessDoc::BigEndian),
            bit_order: Some(BitOrderDoc::MsbFirst),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDoc {
    #[serde(default)]
    pub config: ConfigDoc,
    pub types: BTreeMap<String, TypeDoc>,
}

/// One entry of the top-level `types` map.
///
/// `serde(untagged)` tries each variant's required fields in turn:
/// `sequence` picks Composite, `discriminator` picks Union, bare `alias`
/// picks Alias.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TypeDoc {
    Composite {
        sequence: Vec<FieldDoc>,
        #[serde(default)]
        instances: Vec<InstanceDoc>,
    },
    Union {
        discriminator: DiscriminatorDoc,
        variants: Vec<VariantDoc>,
    },
    Alias {
        alias: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DiscriminatorDoc {
    Field {
        field: String,
    },
    Peek {
        peek_type: String,
        #[serde(default)]
        endianness: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantDoc {
    pub when: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub position: String,
    #[serde(default)]
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitfieldSlotDoc {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    #[serde(default)]
    pub signed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputedDoc {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub element_type: Option<String>,
    #[serde(default)]
    pub from_after_field: Option<String>,
}

/// Every field tag's attributes, flattened. Which subset is meaningful
/// depends on `ty`; `schema::validate` is the single place that interprets
/// this combination.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,

    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub signed: Option<bool>,
    #[serde(default)]
    pub fields: Option<Vec<BitfieldSlotDoc>>,

    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub length_type: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub length_field: Option<String>,
    #[serde(default)]
    pub count_expr: Option<String>,
    #[serde(default)]
    pub item_length_type: Option<String>,
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub terminator_type: Option<String>,
    #[serde(default)]
    pub terminator_value: Option<IntLiteral>,
    #[serde(default)]
    pub terminal_variants: Option<Vec<String>>,

    #[serde(default)]
    pub value_type: Option<String>,
    #[serde(default)]
    pub presence_type: Option<String>,

    #[serde(default)]
    pub align_to: Option<i64>,

    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub offset_mask: Option<IntLiteral>,
    #[serde(default)]
    pub offset_from: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,

    #[serde(default)]
    pub endianness: Option<String>,

    #[serde(default)]
    pub const_value: Option<serde_json::Value>,
    #[serde(default)]
    pub conditional: Option<String>,
    #[serde(default)]
    pub computed: Option<ComputedDoc>,
    #[serde(default)]
    pub description: Option<String>,
}
