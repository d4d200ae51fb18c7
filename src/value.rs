use derive_more::Display;
use internment::Intern;
use ordered_float::OrderedFloat;

/// The in-memory tree shape shared by `encode` input and `decode` output.
///
/// Mirrors the teacher crate's `FieldValue`/`PrimitiveFieldValue` split, but
/// generalized: a schema field can itself be a full record, an array of
/// records, or a tagged discriminated-union instance, not just a primitive
/// leaf or a flat array of primitives.
#[derive(Clone, PartialEq, Debug, Display)]
pub enum Value {
    #[display("{_0}")]
    UInt(u64),
    #[display("{_0}")]
    Int(i64),
    #[display("{_0}")]
    UInt128(u128),
    #[display("{_0}")]
    Int128(i128),
    #[display("{_0}")]
    F32(OrderedFloat<f32>),
    #[display("{_0}")]
    F64(OrderedFloat<f64>),
    #[display("{_0:?}")]
    Str(String),
    #[display("<{} bytes>", _0.len())]
    Bytes(Vec<u8>),
    #[display("[{}]", _0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Array(Vec<Value>),
    /// An ordered record: field name -> value, in schema-declaration order.
    #[display("{{{}}}", _0.iter().map(|(n, v)| format!("{n}: {v}")).collect::<Vec<_>>().join(", "))]
    Record(Vec<(Intern<String>, Value)>),
    /// A discriminated-union instance.
    #[display("{ty}({value})")]
    Variant {
        ty: Intern<String>,
        value: Box<Value>,
    },
    /// An `optional` field; `None` means the presence flag decoded as absent.
    #[display("{}", _0.as_ref().map(ToString::to_string).unwrap_or_else(|| "none".to_owned()))]
    Option(Option<Box<Value>>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Int(v) => Some(*v),
            Value::UInt128(v) => i64::try_from(*v).ok(),
            Value::Int128(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::UInt128(v) => u64::try_from(*v).ok(),
            Value::Int128(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&[(Intern<String>, Value)]> {
        match self {
            Value::Record(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn record_field(&self, name: &str) -> Option<&Value> {
        self.as_record()?
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v)
    }

    pub fn variant_type_name(&self) -> Option<&str> {
        match self {
            Value::Variant { ty, .. } => Some(ty.as_str()),
            _ => None,
        }
    }
}
