//! A declarative compiler and runtime for byte-exact binary wire formats.
//!
//! A [`Schema`] is parsed once from a JSON document (see [`schema::doc`] for
//! its shape) and then drives both directions of the codec: [`Schema::encode`]
//! turns an in-memory [`Value`] into bytes, [`Schema::decode`] turns bytes
//! back into a `Value`, and [`Schema::decode_stream`] drives the same decode
//! incrementally over a chunked byte source for the one array shape that
//! supports it.

pub use crate::error::Error;
pub use crate::value::Value;

pub mod bitstream;
pub mod codec;
pub mod driver;
pub mod error;
pub mod expr;
pub mod instance;
pub mod planner;
pub mod schema;
pub mod testsuite;
pub mod value;

use crate::driver::stream::StreamingArrayDecoder;
use crate::error::{Diagnostic, FieldPath};
use crate::schema::validate::{FieldKind, TypeDef, ValidatedSchema};

/// A validated wire-format schema, ready to encode and decode values of any
/// type it declares.
#[derive(Debug)]
pub struct Schema {
    inner: ValidatedSchema,
}

impl Schema {
    /// Parses and validates a schema document in one step.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(Self { inner: schema::load(json)? })
    }

    /// Encodes `value` as `root_type_name`.
    pub fn encode(&self, root_type_name: &str, value: &Value) -> Result<Vec<u8>, Error> {
        driver::encode_root(&self.inner, root_type_name, value)
    }

    /// Decodes `bytes` as `root_type_name`.
    pub fn decode(&self, root_type_name: &str, bytes: &[u8]) -> Result<Value, Error> {
        driver::decode_root(&self.inner, root_type_name, bytes)
    }

    /// Builds an incremental decoder for `root_type_name`, usable as a
    /// `tokio_util::codec::Decoder` over a chunked byte source.
    ///
    /// Only supported when the named type's whole shape is a single
    /// `length_prefixed_items` array field, per the stream-decoder design
    /// note: every other array kind needs the full buffer up front.
    pub fn decode_stream(&self, root_type_name: &str) -> Result<StreamingArrayDecoder<'_>, Error> {
        let id = self
            .inner
            .lookup(root_type_name)
            .ok_or_else(|| Error::TypeNotFound(root_type_name.to_owned()))?;
        let not_streamable = || {
            Error::SchemaInvalid(vec![Diagnostic {
                type_name: root_type_name.to_owned(),
                field_name: None,
                message: "decode_stream requires a composite with exactly one length_prefixed_items array field"
                    .to_owned(),
            }])
        };
        match self.inner.type_def(id) {
            TypeDef::Composite(c) if c.fields.len() == 1 => match &c.fields[0].kind {
                FieldKind::ArrayField(array) => {
                    let field = &c.fields[0];
                    let endianness = field.endianness_override.unwrap_or(self.inner.default_endianness);
                    let path = FieldPath::root(root_type_name).field(field.name.as_str());
                    StreamingArrayDecoder::new(&self.inner, array.clone(), path, endianness)
                }
                _ => Err(not_streamable()),
            },
            _ => Err(not_streamable()),
        }
    }

    /// The underlying validated type graph, for callers that need to
    /// inspect or reuse it directly (e.g. the test-suite runner).
    pub fn validated(&self) -> &ValidatedSchema {
        &self.inner
    }
}
