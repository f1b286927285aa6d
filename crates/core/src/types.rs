//! Value codec registry.
//!
//! Every attribute in the catalog names one of these types. A type is a plain
//! record of functions, so an unbound query value can be probed against every
//! registered type in a fixed order.
//!
//! Encodings are the strings handed to the content-address store. `String`,
//! `Entity_ID` and `Date` encode to the text itself, which means the same text
//! stored under different types shares one hash; the query engine tells them
//! apart by the attribute's type, never by the hash alone.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use crate::error::{FactlineError, Result};

pub const STRING: &str = "String";
pub const INTEGER: &str = "Integer";
pub const NUMBER: &str = "Number";
pub const BOOLEAN: &str = "Boolean";
pub const ENTITY_ID: &str = "Entity_ID";
pub const DATE: &str = "Date";

/// One registered value type.
#[derive(Debug, Clone, Copy)]
pub struct ValueType {
    pub name: &'static str,
    pub validate: fn(&Value) -> bool,
    pub encode: fn(&Value) -> String,
    pub decode: fn(&str) -> Result<Value>,
}

impl ValueType {
    /// Validate then encode, reporting the value that failed.
    pub fn encode_checked(&self, value: &Value) -> Result<String> {
        if (self.validate)(value) {
            Ok((self.encode)(value))
        } else {
            Err(FactlineError::InvalidValueType {
                type_name: self.name.to_string(),
                value: value.to_string(),
            })
        }
    }
}

/// Ordered set of value types. Registration order is probe order.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: Vec<ValueType>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self {
            types: vec![
                ValueType {
                    name: STRING,
                    validate: Value::is_string,
                    encode: encode_text,
                    decode: decode_text,
                },
                ValueType {
                    name: INTEGER,
                    validate: |v| v.as_i64().is_some(),
                    encode: |v| v.to_string(),
                    decode: decode_integer,
                },
                ValueType {
                    name: NUMBER,
                    validate: Value::is_number,
                    encode: |v| v.to_string(),
                    decode: decode_number,
                },
                ValueType {
                    name: BOOLEAN,
                    validate: Value::is_boolean,
                    encode: |v| v.to_string(),
                    decode: decode_boolean,
                },
                ValueType {
                    name: ENTITY_ID,
                    validate: is_entity_id,
                    encode: encode_text,
                    decode: decode_text,
                },
                ValueType {
                    name: DATE,
                    validate: is_canonical_date,
                    encode: encode_text,
                    decode: decode_text,
                },
            ],
        }
    }
}

impl TypeRegistry {
    /// A registry with no types at all. Mostly useful as a base for
    /// [`register`](Self::register).
    pub fn empty() -> Self {
        Self { types: Vec::new() }
    }

    /// Add a type, replacing any existing type with the same name in place.
    pub fn register(&mut self, value_type: ValueType) {
        match self.types.iter_mut().find(|t| t.name == value_type.name) {
            Some(slot) => *slot = value_type,
            None => self.types.push(value_type),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ValueType> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValueType> {
        self.types.iter()
    }

    /// Every type whose validator accepts `value`, in registration order.
    pub fn accepting<'a>(&'a self, value: &'a Value) -> impl Iterator<Item = &'a ValueType> {
        self.types.iter().filter(move |t| (t.validate)(value))
    }
}

fn encode_text(v: &Value) -> String {
    v.as_str().unwrap_or_default().to_string()
}

fn decode_text(s: &str) -> Result<Value> {
    Ok(Value::String(s.to_string()))
}

fn decode_integer(s: &str) -> Result<Value> {
    s.parse::<i64>()
        .map(Value::from)
        .map_err(|e| FactlineError::Storage(format!("corrupt Integer encoding {s:?}: {e}")))
}

fn decode_number(s: &str) -> Result<Value> {
    let n: Number = serde_json::from_str(s)?;
    Ok(Value::Number(n))
}

fn decode_boolean(s: &str) -> Result<Value> {
    match s {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        other => Err(FactlineError::Storage(format!(
            "corrupt Boolean encoding {other:?}"
        ))),
    }
}

/// Entity ids are non-empty runs of ASCII letters, digits, `-` and `_`.
fn is_entity_id(v: &Value) -> bool {
    v.as_str().is_some_and(|s| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// Dates are RFC 3339 instants already in their canonical UTC rendering, so
/// that one instant never has two encodings.
fn is_canonical_date(v: &Value) -> bool {
    v.as_str().is_some_and(|s| {
        DateTime::parse_from_rfc3339(s).is_ok_and(|dt| {
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::AutoSi, true)
                == s
        })
    })
}
