//! Row representation.
//!
//! A row is a schemaless JSON object carried as raw bytes.  The storage
//! core never interprets row contents beyond the internal fields it owns,
//! so the blob is parsed lazily, at the call sites that actually need
//! fields.  Internal fields are `__`-prefixed; the row id lives in
//! [`ROW_ID_FIELD`] and user-level projections never include internal
//! fields.

use serde_json::{Map, Value};
use thiserror::Error;

/// Internal field holding the stringified 128-bit row id.
pub const ROW_ID_FIELD: &str = "__uuid";

/// Prefix marking fields owned by the storage core.
pub const INTERNAL_PREFIX: &str = "__";

/// Stable row identifier (a stringified 128-bit value).
pub type RowId = String;

/// Errors surfaced while interpreting a row blob.
#[derive(Debug, Error)]
pub enum RowError {
    /// The blob is not valid JSON.
    #[error("malformed row payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The blob parsed but is not a JSON object.
    #[error("row payload is not an object")]
    NotAnObject,

    /// The row carries no id field.
    #[error("row has no {ROW_ID_FIELD} field")]
    MissingRowId,
}

/// A self-describing record: raw JSON bytes plus typed, on-demand access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    bytes: Vec<u8>,
}

impl Row {
    /// Wraps raw bytes without validating them; malformed payloads fail
    /// at the first field access instead.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Serializes a field map into a row.
    pub fn from_fields(fields: &Map<String, Value>) -> Result<Self, RowError> {
        let bytes = serde_json::to_vec(&Value::Object(fields.clone()))?;
        Ok(Self { bytes })
    }

    /// Builds a row from user fields, stamping a fresh id unless the map
    /// already carries one.  Returns the id alongside the row.
    pub fn with_generated_id(mut fields: Map<String, Value>) -> Result<(RowId, Self), RowError> {
        let row_id = match fields.get(ROW_ID_FIELD).and_then(Value::as_str) {
            Some(existing) => existing.to_string(),
            None => {
                let fresh = generate_row_id();
                fields.insert(ROW_ID_FIELD.to_string(), Value::String(fresh.clone()));
                fresh
            }
        };
        Ok((row_id, Self::from_fields(&fields)?))
    }

    /// Parses the blob into a field map.
    pub fn fields(&self) -> Result<Map<String, Value>, RowError> {
        match serde_json::from_slice::<Value>(&self.bytes)? {
            Value::Object(map) => Ok(map),
            _ => Err(RowError::NotAnObject),
        }
    }

    /// Extracts the row id.
    pub fn row_id(&self) -> Result<RowId, RowError> {
        self.fields()?
            .get(ROW_ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(RowError::MissingRowId)
    }

    /// The user-visible fields: everything not `__`-prefixed.
    pub fn user_fields(&self) -> Result<Map<String, Value>, RowError> {
        let mut fields = self.fields()?;
        fields.retain(|name, _| !name.starts_with(INTERNAL_PREFIX));
        Ok(fields)
    }

    /// True when the row's `column` equals `value`.
    ///
    /// Comparison is against the JSON value's string rendering so callers
    /// can match numbers and strings alike with a plain string predicate.
    pub fn matches(&self, column: &str, value: &str) -> bool {
        let Ok(fields) = self.fields() else {
            return false;
        };
        match fields.get(column) {
            Some(Value::String(s)) => s == value,
            Some(other) => other.to_string() == value,
            None => false,
        }
    }

    /// Returns a copy of this row with `column` set to `value`.
    pub fn with_field(&self, column: &str, value: Value) -> Result<Row, RowError> {
        let mut fields = self.fields()?;
        fields.insert(column.to_string(), value);
        Row::from_fields(&fields)
    }

    /// Raw serialized payload.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the row, yielding the raw payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Generates a fresh stringified 128-bit row id (UUID-shaped hex).
pub fn generate_row_id() -> RowId {
    let raw: u128 = rand::random();
    let hex = format!("{raw:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
