//! Decoder for the positional, arity-tagged tool-call argument encoding.
//!
//! Tool-call parameters arrive as `[[ [name, value_tuple], ... ]]`. The
//! length of each `value_tuple` selects the value type:
//!
//! | arity | meaning |
//! |-------|---------|
//! | 1 | `null` |
//! | 2 | number at index 1 |
//! | 3 | string at index 2 |
//! | 4 | boolean at index 3 (`1` is true) |
//! | 5 | nested object at index 4, encoded the same way |
//!
//! Arities 2 and 3 keep whatever JSON sits at their index, even when it is
//! not the usual number or string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{Result, WireError};

/// Decoded tool-call parameters keyed by parameter name.
pub type ToolParams = BTreeMap<String, ParamValue>;

/// A single decoded parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Explicit null.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Integer or floating point number.
    Number(Number),
    /// Text.
    String(String),
    /// Nested parameter object.
    Object(ToolParams),
    /// Any other JSON found where a number or string was expected.
    Raw(Value),
}

impl ParamValue {
    /// Wraps a JSON value taken as-is from a value tuple.
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::String(s.clone()),
            other => Self::Raw(other.clone()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

/// Decodes a tool-call parameter block.
///
/// `args[0]` must be the list of `[name, value_tuple]` pairs. A block whose
/// outer shape is wrong is an error, because it means the wire format is not
/// the one this decoder understands. Individual value tuples that are not
/// arrays, or that have an arity outside 1..=5, are ignored.
///
/// # Examples
///
/// ```
/// use aistudio_core::{decode_params, ParamValue};
/// use serde_json::json;
///
/// let params = decode_params(&json!([[["city", [1, 2, "Paris"]], ["days", [1, 3]]]])).unwrap();
/// assert_eq!(params["city"], ParamValue::from("Paris"));
/// assert_eq!(params["days"], ParamValue::from(3_i64));
/// ```
pub fn decode_params(args: &Value) -> Result<ToolParams> {
    let pairs = args
        .as_array()
        .ok_or_else(|| malformed("parameter block is not an array"))?
        .first()
        .ok_or_else(|| malformed("parameter block is empty"))?
        .as_array()
        .ok_or_else(|| malformed("parameter list is not an array"))?;

    let mut params = ToolParams::new();
    for pair in pairs {
        let pair = pair
            .as_array()
            .ok_or_else(|| malformed("parameter entry is not an array"))?;
        let name = pair
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("parameter entry has no name"))?;
        let tuple = pair
            .get(1)
            .ok_or_else(|| malformed(format!("parameter '{}' has no value", name)))?;

        let Value::Array(tuple) = tuple else {
            continue;
        };
        if let Some(value) = decode_value(tuple)? {
            params.insert(name.to_string(), value);
        }
    }

    Ok(params)
}

/// Decodes one value tuple by its arity.
fn decode_value(tuple: &[Value]) -> Result<Option<ParamValue>> {
    let value = match tuple.len() {
        1 => ParamValue::Null,
        2 => ParamValue::from_json(&tuple[1]),
        3 => ParamValue::from_json(&tuple[2]),
        4 => ParamValue::Bool(is_truthy_flag(&tuple[3])),
        5 => ParamValue::Object(decode_params(&tuple[4])?),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Boolean flags are encoded as `1`/`0`.
fn is_truthy_flag(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

fn malformed(reason: impl Into<String>) -> WireError {
    WireError::MalformedParams(reason.into())
}
