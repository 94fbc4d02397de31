//! Topic metadata and value validation
//!
//! Every topic carries a [`Metadata`] record describing its data type,
//! UI text, default value, allowed range or enumerated options, format
//! hints and flags. Publishing runs the value through
//! [`Metadata::validate`], which either returns the canonical value to
//! retain or rejects it. Invalid values are never clamped.
//!
//! # Coercion
//!
//! Validation normalizes values into the declared type where the intent
//! is unambiguous:
//!
//! - integer dtypes accept integral floats and numeric strings
//! - `float` accepts integers and numeric strings
//! - `bool` accepts 0/1 and the usual spellings ("on", "yes", "enable", ...)
//! - option aliases resolve to the option's canonical value
//!
//! # Example
//!
//! ```
//! use jsui_pubsub::metadata::{DType, Metadata};
//! use jsui_pubsub::Value;
//!
//! let meta = Metadata::new(DType::U8, "Gain").with_range(0.0, 10.0);
//! assert_eq!(meta.validate(&Value::from("5")).unwrap(), Value::Int(5));
//! assert!(meta.validate(&Value::from(99)).is_err());
//! ```

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Value data type of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    /// Any value; retained but never persisted
    Obj,
    Str,
    #[serde(alias = "bin")]
    Bytes,
    #[serde(alias = "f32", alias = "f64")]
    Float,
    /// Unbounded integer
    Int,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Bool,
    /// Events without payload
    None,
    /// Structural node, holds no value
    Node,
    /// Ordered list of distinct strings
    UniqueStrings,
}

impl DType {
    /// Inclusive bounds for the fixed-width integer types
    pub fn int_bounds(self) -> Option<(i128, i128)> {
        Some(match self {
            DType::U8 => (0, u8::MAX as i128),
            DType::U16 => (0, u16::MAX as i128),
            DType::U32 => (0, u32::MAX as i128),
            DType::U64 => (0, u64::MAX as i128),
            DType::I8 => (i8::MIN as i128, i8::MAX as i128),
            DType::I16 => (i16::MIN as i128, i16::MAX as i128),
            DType::I32 => (i32::MIN as i128, i32::MAX as i128),
            DType::I64 => (i64::MIN as i128, i64::MAX as i128),
            DType::Int => (i64::MIN as i128, u64::MAX as i128),
            _ => return None,
        })
    }

    pub fn is_numeric(self) -> bool {
        self == DType::Float || self.int_bounds().is_some()
    }

    /// Convert a value into this dtype, or explain why it cannot be.
    pub fn coerce(self, value: &Value) -> Result<Value, String> {
        match self {
            DType::Obj => Ok(value.clone()),
            DType::Str => match value {
                Value::Str(_) => Ok(value.clone()),
                other => Err(format!("expected str, got {}", other.type_name())),
            },
            DType::Bytes => match value {
                Value::Bytes(_) => Ok(value.clone()),
                other => Err(format!("expected bytes, got {}", other.type_name())),
            },
            DType::Float => to_float(value).map(Value::Float),
            DType::Bool => to_bool(value).map(Value::Bool),
            DType::None => match value {
                Value::Null => Ok(Value::Null),
                other => Err(format!("expected no value, got {}", other.type_name())),
            },
            DType::Node => Err("node topics do not hold values".to_string()),
            DType::UniqueStrings => {
                let items = value
                    .as_list()
                    .ok_or_else(|| format!("expected list, got {}", value.type_name()))?;
                let mut seen = HashSet::new();
                for item in items {
                    let s = item
                        .as_str()
                        .ok_or_else(|| format!("expected str item, got {}", item.type_name()))?;
                    if !seen.insert(s) {
                        return Err(format!("duplicate entry {:?}", s));
                    }
                }
                Ok(value.clone())
            }
            int_type => {
                let (min, max) = int_type
                    .int_bounds()
                    .ok_or_else(|| format!("unsupported dtype {:?}", int_type))?;
                let v = to_integer(value)?;
                if v < min || v > max {
                    return Err(format!("{} out of {:?} bounds [{}, {}]", v, int_type, min, max));
                }
                Value::from_i128(v).ok_or_else(|| format!("{} not representable", v))
            }
        }
    }
}

fn to_integer(value: &Value) -> Result<i128, String> {
    match value {
        Value::Int(_) | Value::UInt(_) => value
            .as_i128()
            .ok_or_else(|| "integer conversion failed".to_string()),
        Value::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1.9e19 => Ok(*f as i128),
        Value::Float(f) => Err(format!("{} is not an integer", f)),
        Value::Bool(b) => Ok(*b as i128),
        Value::Str(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<i128>() {
                return Ok(v);
            }
            match s.parse::<f64>() {
                Ok(f) => to_integer(&Value::Float(f)),
                Err(_) => Err(format!("{:?} is not an integer", s)),
            }
        }
        other => Err(format!("expected int, got {}", other.type_name())),
    }
}

fn to_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{:?} is not a number", s)),
        other => other
            .as_f64()
            .ok_or_else(|| format!("expected float, got {}", other.type_name())),
    }
}

fn to_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Int(0) => Ok(false),
        Value::Int(1) => Ok(true),
        Value::Str(s) => match s.to_ascii_lowercase().as_str() {
            "" | "0" | "no" | "off" | "disable" | "disabled" | "false" | "inactive" => Ok(false),
            "1" | "yes" | "on" | "enable" | "enabled" | "true" | "active" => Ok(true),
            _ => Err(format!("{:?} is not a bool", s)),
        },
        other => Err(format!("expected bool, got {}", other)),
    }
}

/// Flags adjusting how a topic is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// Not user editable. Profile load and restore-defaults skip it.
    #[serde(rename = "ro")]
    ReadOnly,
    /// Not shown in the user interface
    Hide,
    /// Developer option
    Dev,
    /// Publishes are not added to the undo stack
    SkipUndo,
    /// Volatile value, never persisted
    Tmp,
    /// Not restored from profiles
    NoInit,
    /// Retained publishes of an unchanged value still notify
    NoDedup,
}

/// Allowed numeric range, inclusive, with an optional increment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Range {
    pub min: f64,
    pub max: f64,
    pub step: Option<f64>,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            step: None,
        }
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    fn check_definition(&self) -> Result<(), String> {
        if !(self.min <= self.max) {
            return Err(format!("range min {} exceeds max {}", self.min, self.max));
        }
        match self.step {
            Some(step) if !(step > 0.0) => Err(format!("range step {} must be positive", step)),
            _ => Ok(()),
        }
    }

    /// Check a numeric value against the range.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let x = value
            .as_f64()
            .ok_or_else(|| format!("range requires a number, got {}", value.type_name()))?;
        if x < self.min || x > self.max {
            return Err(format!("{} out of range [{}, {}]", value, self.min, self.max));
        }
        if let Some(step) = self.step {
            let n = (x - self.min) / step;
            if (n - n.round()).abs() > 1e-9 {
                return Err(format!("{} not on increment {} from {}", value, step, self.min));
            }
        }
        Ok(())
    }
}

impl TryFrom<Vec<f64>> for Range {
    type Error = String;

    fn try_from(v: Vec<f64>) -> Result<Self, Self::Error> {
        match v.as_slice() {
            [min, max] => Ok(Range::new(*min, *max)),
            [min, max, step] => Ok(Range::new(*min, *max).with_step(*step)),
            _ => Err(format!("range needs 2 or 3 entries, got {}", v.len())),
        }
    }
}

impl From<Range> for Vec<f64> {
    fn from(r: Range) -> Self {
        match r.step {
            Some(step) => vec![r.min, r.max, step],
            None => vec![r.min, r.max],
        }
    }
}

/// One enumerated choice: `[value, ui_label, alias...]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionEntry(pub Vec<Value>);

impl OptionEntry {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Option with a UI label
    pub fn labeled(value: impl Into<Value>, label: &str) -> Self {
        Self(vec![value.into(), Value::from(label)])
    }

    pub fn with_alias(mut self, alias: impl Into<Value>) -> Self {
        if self.0.len() == 1 {
            // The second slot is the UI label, keep it equal to the value
            let value = self.0[0].clone();
            self.0.push(value);
        }
        self.0.push(alias.into());
        self
    }

    /// Canonical value
    pub fn value(&self) -> &Value {
        &self.0[0]
    }

    /// Text for user interfaces
    pub fn label(&self) -> Option<&str> {
        self.0.get(1).and_then(Value::as_str)
    }

    fn matches(&self, candidate: &Value) -> bool {
        self.0.iter().any(|v| loosely_equal(v, candidate))
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a.as_i128(), b.as_i128()) {
        (Some(x), Some(y)) => x == y,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Schema of a single topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub dtype: DType,

    /// One-line description
    #[serde(default)]
    pub brief: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<OptionEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,

    /// Formatting hint, e.g. "version" for packed u32 versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<Flag>,

    /// Schema version; a higher version supersedes an existing definition
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u32,
}

impl Metadata {
    pub fn new(dtype: DType, brief: impl Into<String>) -> Self {
        Self {
            dtype,
            brief: brief.into(),
            detail: None,
            default: None,
            options: None,
            range: None,
            format: None,
            flags: Vec::new(),
            version: 0,
        }
    }

    /// Structural node metadata
    pub fn node(brief: impl Into<String>) -> Self {
        Self::new(DType::Node, brief)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(Range::new(min, max));
        self
    }

    pub fn with_range_step(mut self, min: f64, max: f64, step: f64) -> Self {
        self.range = Some(Range::new(min, max).with_step(step));
        self
    }

    pub fn with_options(mut self, options: impl IntoIterator<Item = OptionEntry>) -> Self {
        self.options = Some(options.into_iter().collect());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }

    pub fn with_flags(self, flags: &[Flag]) -> Self {
        flags.iter().fold(self, |meta, flag| meta.with_flag(*flag))
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// True when publishing an unchanged value is a no-op
    pub fn deduplicates(&self) -> bool {
        !self.has_flag(Flag::NoDedup)
    }

    /// True when the retained value belongs in a profile
    pub fn is_persistent(&self) -> bool {
        !self.has_flag(Flag::Tmp)
            && !matches!(self.dtype, DType::Obj | DType::Node | DType::None)
    }

    /// Check the definition itself: range sanity and the default value.
    pub fn check(&self) -> Result<(), String> {
        if let Some(range) = &self.range {
            range.check_definition()?;
            if !self.dtype.is_numeric() {
                return Err(format!("range given for non-numeric dtype {:?}", self.dtype));
            }
        }
        if let Some(options) = &self.options {
            if options.iter().any(|o| o.0.is_empty()) {
                return Err("empty option entry".to_string());
            }
        }
        if let Some(default) = &self.default {
            self.validate(default)
                .map_err(|reason| format!("invalid default: {}", reason))?;
        }
        Ok(())
    }

    /// Validate a value, returning the canonical value to retain.
    pub fn validate(&self, value: &Value) -> Result<Value, String> {
        let value = match &self.options {
            Some(options) if self.dtype == DType::UniqueStrings => {
                let items = value
                    .as_list()
                    .ok_or_else(|| format!("expected list, got {}", value.type_name()))?;
                Value::List(
                    items
                        .iter()
                        .map(|item| resolve_option(options, item))
                        .collect::<Result<_, _>>()?,
                )
            }
            Some(options) => resolve_option(options, value)?,
            None => value.clone(),
        };
        let value = self.dtype.coerce(&value)?;
        if let Some(range) = &self.range {
            range.check(&value)?;
        }
        Ok(value)
    }

    /// Default value converted to the declared dtype
    pub fn default_value(&self) -> Option<Value> {
        self.default.as_ref().and_then(|d| self.validate(d).ok())
    }

    /// The metadata as a value, as published on the `$` channel
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|json| Value::from_json(json).ok())
            .unwrap_or_default()
    }
}

fn resolve_option(options: &[OptionEntry], value: &Value) -> Result<Value, String> {
    options
        .iter()
        .find(|option| option.matches(value))
        .map(|option| option.value().clone())
        .ok_or_else(|| format!("{} not in options", value))
}
