//! Dynamic field value type.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{CoreError, CoreResult};
use crate::id::ObjectId;

/// A dynamically typed field value.
///
/// Entities hold a mapping from field name to `Value`. Readers match on the
/// variant (or use the `as_*` accessors); values are never coerced between
/// kinds implicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Finite floating-point number.
    Number(f64),
    /// UTF-8 text.
    Text(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Pointer to another saved entity.
    Reference(EntityRef),
    /// Binary file attached to the entity.
    File(FileValue),
}

/// A reference to a saved entity of some class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Class of the referenced entity.
    pub class_name: String,
    /// Remote id of the referenced entity.
    pub object_id: ObjectId,
}

/// Binary content stored in a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileValue {
    /// File name, e.g. `taco.jpg`.
    pub name: String,
    /// MIME type of the content.
    pub content_type: String,
    /// Raw bytes.
    pub data: Vec<u8>,
}

impl FileValue {
    /// Creates a file value, rejecting empty names or content.
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> CoreResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::validation("file", "file name must not be empty"));
        }
        if data.is_empty() {
            return Err(CoreError::validation(
                "file",
                format!("{name} has no content"),
            ));
        }
        Ok(Self {
            name,
            content_type: content_type.into(),
            data,
        })
    }

    /// Size of the content in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the file has no content.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Reference(_) => "reference",
            Value::File(_) => "file",
        }
    }

    /// Checks that the value can be stored and sent to the remote.
    ///
    /// Numbers must be finite and files must have content; arrays are
    /// checked recursively.
    pub fn validate(&self, field: &str) -> CoreResult<()> {
        match self {
            Value::Number(n) if !n.is_finite() => Err(CoreError::validation(
                field,
                format!("number {n} is not finite"),
            )),
            Value::File(file) if file.is_empty() => Err(CoreError::validation(
                field,
                format!("file {} has no content", file.name),
            )),
            Value::Array(items) => items.iter().try_for_each(|item| item.validate(field)),
            _ => Ok(()),
        }
    }

    /// Compares two values of compatible kinds.
    ///
    /// Integers and numbers compare numerically with each other. Values of
    /// unrelated kinds are unordered and yield `None`.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Value::Integer(a), Value::Number(b)) => (*a as f64).partial_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Value::Number(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (Value::Reference(a), Value::Reference(b)) => Some(
                a.class_name
                    .cmp(&b.class_name)
                    .then_with(|| a.object_id.cmp(&b.object_id)),
            ),
            (Value::File(a), Value::File(b)) => Some(a.name.cmp(&b.name)),
            _ => None,
        }
    }

    /// Equality used by query filters (numeric kinds compare by value).
    pub fn loosely_equals(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal) && self.same_family(other)
    }

    fn same_family(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::File(a), Value::File(b)) => a == b,
            _ => true,
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float. Integers are not converted.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a string, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as an entity reference.
    pub fn as_reference(&self) -> Option<&EntityRef> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Get this value as a file.
    pub fn as_file(&self) -> Option<&FileValue> {
        match self {
            Value::File(f) => Some(f),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<EntityRef> for Value {
    fn from(r: EntityRef) -> Self {
        Value::Reference(r)
    }
}

impl From<FileValue> for Value {
    fn from(f: FileValue) -> Self {
        Value::File(f)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}
