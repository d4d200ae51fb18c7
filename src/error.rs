use crate::expr::ExprError;
use crate::value::Value;
use derive_more::Display;
use internment::Intern;
use thiserror::Error;

/// One segment of a [`FieldPath`].
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum PathSegment {
    #[display("{_0}")]
    Name(Intern<String>),
    #[display("[{_0}]")]
    Index(usize),
}

/// Identifies where in a type's field tree a failure occurred, e.g.
/// `Message.answer.name[2]`.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct FieldPath(pub Vec<PathSegment>);

impl FieldPath {
    pub fn root(type_name: &str) -> Self {
        Self(vec![PathSegment::Name(Intern::new(type_name.to_owned()))])
    }

    pub fn field(&self, name: &str) -> Self {
        let mut path = self.0.clone();
        path.push(PathSegment::Name(Intern::new(name.to_owned())));
        Self(path)
    }

    pub fn index(&self, i: usize) -> Self {
        let mut path = self.0.clone();
        path.push(PathSegment::Index(i));
        Self(path)
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                PathSegment::Name(_) if i > 0 => write!(f, ".{seg}")?,
                PathSegment::Name(_) => write!(f, "{seg}")?,
                PathSegment::Index(_) => write!(f, "{seg}")?,
            }
        }
        Ok(())
    }
}

/// A single schema-validation failure.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Diagnostic {
    pub type_name: String,
    pub field_name: Option<String>,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field_name {
            Some(field) => write!(f, "{}.{}: {}", self.type_name, field, self.message),
            None => write!(f, "{}: {}", self.type_name, self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("schema is invalid: {}", .0.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("; "))]
    SchemaInvalid(Vec<Diagnostic>),

    #[error("type '{0}' is not defined in the schema")]
    TypeNotFound(String),

    #[error("field '{field_name}' in type '{type_name}' uses the reserved substring '__iter'")]
    ReservedFieldName {
        type_name: String,
        field_name: String,
    },

    #[error("length_field '{length_field}' referenced by '{type_name}.{field_name}' was not found")]
    LengthFieldMissing {
        type_name: String,
        field_name: String,
        length_field: String,
    },

    #[error("const mismatch at {path}: expected {expected:?}, got {actual:?}")]
    ConstMismatch {
        path: FieldPath,
        expected: Value,
        actual: Value,
    },

    #[error("computed field at {path} must not be supplied by the caller")]
    ComputedFieldSet { path: FieldPath },

    #[error("unexpected end of stream at {path}: needed {needed} bytes, {available} available")]
    UnexpectedEndOfStream {
        path: FieldPath,
        needed: usize,
        available: usize,
    },

    #[error("misaligned read at {path}: bit offset {bit_offset} is not byte-aligned")]
    MisalignedRead { path: FieldPath, bit_offset: usize },

    #[error("utf8 decode error at {path}: {source}")]
    Utf8DecodeError {
        path: FieldPath,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("ascii out of range at {path}: byte 0x{byte:02X} >= 0x80")]
    AsciiOutOfRange { path: FieldPath, byte: u8 },

    #[error("no discriminator variant matched at {path} (value {discriminant})")]
    DiscriminatorNoMatch { path: FieldPath, discriminant: i64 },

    #[error("back-reference target missing at {path}: offset {offset}")]
    PointerTargetMissing { path: FieldPath, offset: u64 },

    #[error("length {len} at {path} exceeds the prefix range (max {max})")]
    LengthExceedsPrefixRange {
        path: FieldPath,
        len: usize,
        max: usize,
    },

    #[error("array at {path} has {actual} element(s), expected exactly {expected}")]
    ArrayLengthMismatch {
        path: FieldPath,
        expected: usize,
        actual: usize,
    },

    #[error("expression error at {path}: {source}")]
    ExpressionError {
        path: FieldPath,
        #[source]
        source: ExprError,
    },

    #[error("position {position} at {path} is out of bounds (stream length {stream_len})")]
    PositionOutOfBounds {
        path: FieldPath,
        position: u64,
        stream_len: usize,
    },

    #[error(
        "type '{type_name}' is recursive without passing through a pointer or instance boundary"
    )]
    CycleWithoutPointer { type_name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
