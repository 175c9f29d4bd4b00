//! Conversion between client JSON values and wire-format text values.
//!
//! Parameters travel to the backend as text-format values with no declared
//! type OID, so the backend infers types from query context. Result fields
//! come back as text and are rendered to JSON by column type OID.

use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::types::{self, Oid, oid};

/// One query to run against the backend: opaque SQL plus wire-encoded
/// parameter values. Immutable once constructed; owned by a single
/// request-handling task.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// SQL text with $1, $2, ... placeholders. Never parsed by the proxy.
    pub sql: String,
    /// Text-encoded parameter values, `None` for NULL.
    pub params: Vec<Option<Vec<u8>>>,
    /// Client-requested statement timeout, if any.
    pub timeout: Option<Duration>,
}

impl QueryRequest {
    /// Build a request from client JSON parameters.
    pub fn new(sql: String, params: &[Value], timeout: Option<Duration>) -> Result<Self> {
        if sql.trim().is_empty() {
            return Err(Error::InvalidRequest("sql must not be empty".into()));
        }
        // SQL travels as a null-terminated protocol string.
        if sql.contains('\0') {
            return Err(Error::InvalidRequest(
                "sql must not contain NUL bytes".into(),
            ));
        }
        let params = params.iter().map(encode_param).collect();
        Ok(Self {
            sql,
            params,
            timeout,
        })
    }
}

/// Encode one JSON parameter as a wire text value (`None` = NULL).
///
/// Arrays and objects are serialized as JSON text; the backend casts by
/// inference.
fn encode_param(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::Bool(true) => Some(b"true".to_vec()),
        Value::Bool(false) => Some(b"false".to_vec()),
        Value::Number(n) => Some(n.to_string().into_bytes()),
        Value::String(s) => Some(s.clone().into_bytes()),
        other => Some(other.to_string().into_bytes()),
    }
}

/// One result column: name plus wire type OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

impl Column {
    /// Type name as PostgreSQL reports it ("int4", "text", ...).
    pub fn type_name(&self) -> String {
        types::type_name(self.type_oid)
    }
}

/// Accumulated result of one successful execution. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Ordered column descriptors; empty for statements without rows.
    pub columns: Vec<Column>,
    /// Raw text-format field values, `None` for NULL.
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    /// Rows affected, parsed from the CommandComplete tag.
    pub rows_affected: Option<u64>,
}

impl ResultSet {
    /// Render the rows to JSON, mapping each field by its column type OID.
    pub fn rows_to_json(&self) -> Vec<Vec<Value>> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(i, field)| {
                        let type_oid = self.columns.get(i).map_or(0, |c| c.type_oid);
                        decode_field(type_oid, field.as_deref())
                    })
                    .collect()
            })
            .collect()
    }
}

/// Render one text-format field value to JSON by type OID.
///
/// Values that fail to parse as their claimed type fall back to the raw
/// string rather than erroring; the backend's text rendering is
/// authoritative and the client can still see it.
pub fn decode_field(type_oid: Oid, field: Option<&[u8]>) -> Value {
    let Some(bytes) = field else {
        return Value::Null;
    };

    let text = String::from_utf8_lossy(bytes);

    match type_oid {
        oid::BOOL => match text.as_ref() {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => Value::String(text.into_owned()),
        },
        oid::INT2 | oid::INT4 | oid::INT8 => text
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|_| Value::String(text.into_owned())),
        oid::FLOAT4 | oid::FLOAT8 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.into_owned())),
        oid::JSON | oid::JSONB => serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(text.into_owned())),
        // numeric stays textual so precision survives the trip
        _ => Value::String(text.into_owned()),
    }
}
