//! Shared types for como components.
//!
//! A [`Source`] is a named, typed, timestamped value that an instrumented
//! process exposes to remote observers. This crate holds the data model only;
//! the wire encoding lives in `como-protocol` and the registry that announces
//! sources lives in `como-server`.

use std::convert::TryFrom;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Errors raised when a source would break its type invariant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("Value of type {actual} does not match source type {expected}")]
    TypeMismatch {
        expected: SourceType,
        actual: SourceType,
    },

    #[error("Unknown source type tag: {0:#04x}")]
    UnknownType(u8),
}

/// Type of the value carried by a source.
///
/// The discriminants are the tags used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SourceType {
    /// Source with a string value.
    String = 0x01,
    /// Source with a 64-bit integer value.
    Int = 0x02,
    /// Source with a double precision value.
    Double = 0x03,
}

impl SourceType {
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::String),
            0x02 => Some(Self::Int),
            0x03 => Some(Self::Double),
            _ => None,
        }
    }
}

impl TryFrom<u8> for SourceType {
    type Error = SourceError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::from_tag(tag).ok_or(SourceError::UnknownType(tag))
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::String => write!(f, "string"),
            SourceType::Int => write!(f, "int"),
            SourceType::Double => write!(f, "double"),
        }
    }
}

/// Value of a source, exactly one of text, integer or double.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceValue {
    String(String),
    Int(i64),
    Double(f64),
}

impl SourceValue {
    #[must_use]
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceValue::String(_) => SourceType::String,
            SourceValue::Int(_) => SourceType::Int,
            SourceValue::Double(_) => SourceType::Double,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SourceValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SourceValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            SourceValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceValue::String(s) => write!(f, "{s}"),
            SourceValue::Int(v) => write!(f, "{v}"),
            SourceValue::Double(v) => write!(f, "{v}"),
        }
    }
}

impl From<String> for SourceValue {
    fn from(s: String) -> Self {
        SourceValue::String(s)
    }
}

impl From<&str> for SourceValue {
    fn from(s: &str) -> Self {
        SourceValue::String(s.to_string())
    }
}

impl From<i64> for SourceValue {
    fn from(v: i64) -> Self {
        SourceValue::Int(v)
    }
}

impl From<i32> for SourceValue {
    fn from(v: i32) -> Self {
        SourceValue::Int(i64::from(v))
    }
}

impl From<f64> for SourceValue {
    fn from(v: f64) -> Self {
        SourceValue::Double(v)
    }
}

/// Current time at the resolution timestamps keep on the wire (milliseconds).
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Snapshot of a monitored value.
///
/// The value always matches `source_type`; setters that would break this are
/// no-ops, mirroring how a typed source ignores values of a foreign type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "SourceRaw")]
pub struct Source {
    #[serde(rename = "type")]
    source_type: SourceType,
    name: String,
    type_name: String,
    value: SourceValue,
    description: String,
    timestamp: DateTime<Utc>,
}

/// Unvalidated form used while deserializing a [`Source`]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceRaw {
    #[serde(rename = "type")]
    source_type: SourceType,
    name: String,
    #[serde(default)]
    type_name: String,
    value: SourceValue,
    #[serde(default)]
    description: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<SourceRaw> for Source {
    type Error = SourceError;

    // Integral doubles print without a fraction in some encoders, so accept them.
    #[allow(clippy::cast_precision_loss)]
    fn try_from(raw: SourceRaw) -> Result<Self, Self::Error> {
        let value = match (raw.source_type, raw.value) {
            (SourceType::Double, SourceValue::Int(v)) => SourceValue::Double(v as f64),
            (_, value) => value,
        };
        let mut source = Source::new(
            raw.source_type,
            raw.name,
            raw.type_name,
            value,
            raw.description,
        )?;
        source.timestamp = raw.timestamp.trunc_subsecs(3);
        Ok(source)
    }
}

impl Source {
    /// Create a source stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::TypeMismatch` if `value` is not of `source_type`.
    pub fn new(
        source_type: SourceType,
        name: impl Into<String>,
        type_name: impl Into<String>,
        value: impl Into<SourceValue>,
        description: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let value = value.into();
        if value.source_type() != source_type {
            return Err(SourceError::TypeMismatch {
                expected: source_type,
                actual: value.source_type(),
            });
        }

        Ok(Self {
            source_type,
            name: name.into(),
            type_name: type_name.into(),
            value,
            description: description.into(),
            timestamp: now_millis(),
        })
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(3);
        self
    }

    #[must_use]
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn value(&self) -> &SourceValue {
        &self.value
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_type_name(&mut self, type_name: impl Into<String>) {
        self.type_name = type_name.into();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = timestamp.trunc_subsecs(3);
    }

    /// Replace the value and refresh the timestamp.
    ///
    /// Returns `false` and leaves the source untouched when the value type
    /// differs from the source type. The timestamp never moves backwards.
    pub fn set_value(&mut self, value: impl Into<SourceValue>) -> bool {
        let value = value.into();
        if value.source_type() != self.source_type {
            return false;
        }
        self.value = value;
        self.timestamp = now_millis().max(self.timestamp);
        true
    }

    /// Ignored unless this is a string source.
    pub fn set_string(&mut self, value: impl Into<String>) -> bool {
        self.set_value(SourceValue::String(value.into()))
    }

    /// Ignored unless this is an integer source.
    pub fn set_int(&mut self, value: i64) -> bool {
        self.set_value(SourceValue::Int(value))
    }

    /// Ignored unless this is a double source.
    pub fn set_double(&mut self, value: f64) -> bool {
        self.set_value(SourceValue::Double(value))
    }
}
