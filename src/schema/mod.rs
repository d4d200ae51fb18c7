//! Schema loading and validation: turn a JSON document into a
//! [`validate::ValidatedSchema`] or a list of diagnostics, never a partial
//! result.

pub mod doc;
pub mod validate;

pub use validate::{TypeId, ValidatedSchema};

use crate::error::Error;

/// Parses `json` as a [`doc::SchemaDoc`] and validates it in one step. This
/// is the only path by which callers obtain a [`ValidatedSchema`].
pub fn load(json: &str) -> Result<ValidatedSchema, Error> {
    let parsed: doc::SchemaDoc = serde_json::from_str(json).map_err(|e| {
        Error::SchemaInvalid(vec![crate::error::Diagnostic {
            type_name: "<document>".to_owned(),
            field_name: None,
            message: format!("failed to parse schema document: {e}"),
        }])
    })?;
    validate::validate(&parsed)
}
