//! Values carried by topics
//!
//! [`Value`] is the closed set of primitives and composites a topic can
//! hold: integers, floats, strings, binary blobs, ordered lists and
//! string-keyed maps. Values are replaced wholesale in the topic tree,
//! never mutated in place.
//!
//! # JSON encoding
//!
//! Values serialize to plain JSON, except binary blobs which have no
//! native JSON form. Blobs are written as a typed object:
//!
//! ```text
//! {"__type__": "bytes", "data": "<base64>"}
//! ```
//!
//! so that a profile file round-trips a blob back into [`Value::Bytes`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

const TYPE_KEY: &str = "__type__";
const DATA_KEY: &str = "data";

/// A topic value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absence of a value (events without payload, unset topics)
    #[default]
    Null,
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer too large for `Int`
    UInt(u64),
    Float(f64),
    Str(String),
    /// Binary blob
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Wrap a binary blob
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    /// Build a list of strings
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::Str(s.into())).collect())
    }

    /// Short name of the variant, used in validation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::UInt(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of `Int`/`UInt`
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(i) => Some(*i as i128),
            Value::UInt(u) => Some(*u as i128),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    /// Numeric view of any integer or float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Normalized integer: `Int` when it fits in i64, otherwise `UInt`
    pub(crate) fn from_i128(v: i128) -> Option<Value> {
        if let Ok(i) = i64::try_from(v) {
            Some(Value::Int(i))
        } else {
            u64::try_from(v).ok().map(Value::UInt)
        }
    }

    /// Convert to a JSON value, encoding blobs as typed objects
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::UInt(u) => Json::from(*u),
            // Non-finite floats have no JSON form and become null
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Bytes(b) => {
                let mut obj = serde_json::Map::new();
                obj.insert(TYPE_KEY.to_string(), Json::String("bytes".to_string()));
                obj.insert(DATA_KEY.to_string(), Json::String(BASE64.encode(b)));
                Json::Object(obj)
            }
            Value::List(l) => Json::Array(l.iter().map(Value::to_json).collect()),
            Value::Map(m) => Json::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from a JSON value, decoding typed blob objects
    pub fn from_json(json: serde_json::Value) -> std::result::Result<Value, String> {
        use serde_json::Value as Json;
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    n.as_f64()
                        .filter(|f| f.is_finite())
                        .map(Value::Float)
                        .ok_or_else(|| format!("number {} is not representable", n))?
                }
            }
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Json::Object(obj) => {
                if let Some(Json::String(t)) = obj.get(TYPE_KEY) {
                    return match t.as_str() {
                        "bytes" => {
                            let data = obj
                                .get(DATA_KEY)
                                .and_then(Json::as_str)
                                .ok_or_else(|| "bytes object missing data".to_string())?;
                            BASE64
                                .decode(data)
                                .map(Value::Bytes)
                                .map_err(|e| format!("invalid base64 blob: {}", e))
                        }
                        other => Err(format!("unsupported typed value {:?}", other)),
                    };
                }
                Value::Map(
                    obj.into_iter()
                        .map(|(k, v)| Value::from_json(v).map(|v| (k, v)))
                        .collect::<std::result::Result<_, _>>()?,
                )
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! impl_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::from_i128(v as i128).unwrap_or(Value::UInt(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}
