//! Value model: typed values, origins and the key-value carriers exchanged
//! between the scheduler and descriptors.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::KvError;

/// Classification of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Something that exists in the southbound and is created through a descriptor.
    Object,
    /// Something executed when dependencies are met and reverted when they are not.
    Action,
    /// Something an object has and other values may depend on.
    ///
    /// Properties are always derived and never have a descriptor.
    Property,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Object => write!(f, "object"),
            ValueType::Action => write!(f, "action"),
            ValueType::Property => write!(f, "property"),
        }
    }
}

/// Who supplied the last write of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueOrigin {
    /// Returned by a dump when the descriptor cannot tell; resolved from history.
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
    /// Created by a northbound transaction.
    #[serde(rename = "from-NB")]
    FromNb,
    /// Not managed by NB, created automatically or externally in SB.
    #[serde(rename = "from-SB")]
    FromSb,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueOrigin::Unknown => write!(f, "unknown"),
            ValueOrigin::FromNb => write!(f, "from-NB"),
            ValueOrigin::FromSb => write!(f, "from-SB"),
        }
    }
}

/// A value managed by the scheduler.
///
/// `Display` gives the human-readable representation used for logging and
/// for the transaction history.
pub trait Value: fmt::Debug + fmt::Display + Send + Sync {
    /// Short label, unique among the values of one descriptor.
    fn label(&self) -> String;

    /// Classifies the value.
    fn value_type(&self) -> ValueType;

    /// Returns true if this value is effectively the same as `other` from
    /// the NB point of view. Equivalent values never trigger Modify.
    fn equivalent(&self, other: &dyn Value) -> bool;

    /// Access to the concrete type for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a value.
pub type ValueRef = Arc<dyn Value>;

/// Descriptor-owned runtime data carried alongside a non-derived object.
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Compares two optional values using [`Value::equivalent`].
pub fn values_equivalent(a: Option<&ValueRef>, b: Option<&ValueRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.value_type() == b.value_type() && a.equivalent(&**b),
        _ => false,
    }
}

/// Key with a value.
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    pub key: String,
    pub value: ValueRef,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: ValueRef) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Key with raw NB data to be built into a value.
///
/// `data == None` requests removal of the value.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValueDataPair {
    pub key: String,
    pub data: Option<serde_json::Value>,
}

impl KeyValueDataPair {
    pub fn new(key: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }
}

/// Error (or its absence) reported for one key.
///
/// `error == None` notifies that a previously failed value was restored.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyWithError {
    pub key: String,
    pub error: Option<KvError>,
}

impl KeyWithError {
    pub fn new(key: impl Into<String>, error: Option<KvError>) -> Self {
        Self {
            key: key.into(),
            error,
        }
    }
}

/// Key-value pair with metadata and the origin mark, as exchanged by Dump.
#[derive(Debug, Clone)]
pub struct KvWithMetadata {
    pub key: String,
    pub value: ValueRef,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

/// Value represented by a plain string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringValue {
    value_type: ValueType,
    label: String,
    value: String,
}

impl StringValue {
    pub fn new(value_type: ValueType, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value_type,
            label: label.into(),
            value: value.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for StringValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl Value for StringValue {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn equivalent(&self, other: &dyn Value) -> bool {
        other
            .as_any()
            .downcast_ref::<StringValue>()
            .is_some_and(|o| o.value_type == self.value_type && o.value == self.value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Value consisting of a list of items.
///
/// Descriptors typically derive one value per item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayValue {
    value_type: ValueType,
    label: String,
    items: Vec<String>,
}

impl ArrayValue {
    pub fn new<I, S>(value_type: ValueType, label: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            value_type,
            label: label.into(),
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }
}

impl fmt::Display for ArrayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.items.join(","))
    }
}

impl Value for ArrayValue {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn equivalent(&self, other: &dyn Value) -> bool {
        other
            .as_any()
            .downcast_ref::<ArrayValue>()
            .is_some_and(|o| o.value_type == self.value_type && o.items == self.items)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
