//! Run-time values and shared object instances.
//!
//! [`Value`] is what the evaluation stack, locals, arguments, fields and wire envelopes
//! carry. Primitive values have value semantics; [`ObjectRef`] is a shared, lockable
//! instance whose fields can be read and written by reference, just like a heap object
//! on the host that created it.
//!
//! # Wire representation
//!
//! Objects serialize as a deep snapshot of their fields. Deserializing creates a fresh
//! instance, so object identity never crosses a host boundary; only state does.
//!
//! # Type names
//!
//! The declared type of a field, property, parameter or return value is a plain string.
//! The constants in this module name the built-in types; any other string names a
//! [`crate::ir::TypeDef`] by its full name.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Result;

/// Declared type name of [`Value::Bool`]
pub const BOOL: &str = "System.Boolean";
/// Declared type name of [`Value::I32`]
pub const INT32: &str = "System.Int32";
/// Declared type name of [`Value::I64`]
pub const INT64: &str = "System.Int64";
/// Declared type name of [`Value::F64`]
pub const FLOAT64: &str = "System.Double";
/// Declared type name of [`Value::Str`]
pub const STRING: &str = "System.String";
/// Declared type name of [`Value::List`]
pub const LIST: &str = "System.Collections.List";
/// Declared type that accepts every value
pub const OBJECT: &str = "System.Object";

/// A run-time value.
///
/// # Examples
///
/// ```rust
/// use nomad::ir::{Value, INT32};
///
/// let v = Value::I32(5);
/// assert_eq!(v.type_name(), INT32);
/// assert!(v.matches_type(INT32));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The null reference
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// 32-bit signed integer
    I32(i32),
    /// 64-bit signed integer
    I64(i64),
    /// 64-bit float
    F64(f64),
    /// UTF-8 string
    Str(String),
    /// Ordered list of values (value semantics)
    List(Vec<Value>),
    /// Shared object instance (reference semantics)
    Object(ObjectRef),
}

impl Value {
    /// Returns the default value for a declared type.
    ///
    /// Numeric types default to zero, booleans to `false`, everything else to [`Value::Null`].
    #[must_use]
    pub fn default_for(type_name: &str) -> Value {
        match type_name {
            BOOL => Value::Bool(false),
            INT32 => Value::I32(0),
            INT64 => Value::I64(0),
            FLOAT64 => Value::F64(0.0),
            _ => Value::Null,
        }
    }

    /// Returns the run-time type name of this value.
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => OBJECT.to_string(),
            Value::Bool(_) => BOOL.to_string(),
            Value::I32(_) => INT32.to_string(),
            Value::I64(_) => INT64.to_string(),
            Value::F64(_) => FLOAT64.to_string(),
            Value::Str(_) => STRING.to_string(),
            Value::List(_) => LIST.to_string(),
            Value::Object(object) => object.type_name(),
        }
    }

    /// Checks whether this value can be passed where `declared` is expected.
    ///
    /// `System.Object` accepts everything, null is accepted by every non-primitive type.
    #[must_use]
    pub fn matches_type(&self, declared: &str) -> bool {
        if declared == OBJECT {
            return true;
        }
        match self {
            Value::Null => !is_primitive(declared),
            Value::Object(object) => object.type_name() == declared,
            other => other.type_name() == declared,
        }
    }

    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Interprets the value as a branch condition.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for strings, lists and floats, which have no truth value.
    pub fn is_truthy(&self) -> Result<bool> {
        match self {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(*b),
            Value::I32(v) => Ok(*v != 0),
            Value::I64(v) => Ok(*v != 0),
            Value::Object(_) => Ok(true),
            other => Err(malformed_error!(
                "Value of type {} cannot be used as a condition",
                other.type_name()
            )),
        }
    }

    /// Returns the contained string, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value widened to `i64`, if it is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the contained object, if any.
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}L"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Object(object) => write!(f, "<{}>", object.type_name()),
        }
    }
}

/// Returns `true` if `type_name` names a primitive value type, which cannot hold null.
#[must_use]
pub fn is_primitive(type_name: &str) -> bool {
    matches!(type_name, BOOL | INT32 | INT64 | FLOAT64)
}

/// The state of one object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Full name of the instance's type
    pub type_name: String,
    /// Instance field values by name
    pub fields: BTreeMap<String, Value>,
}

/// A shared reference to an [`Object`].
///
/// Cloning an `ObjectRef` clones the reference, not the object. Equality compares
/// identity first and falls back to comparing state.
#[derive(Clone)]
pub struct ObjectRef {
    inner: Arc<RwLock<Object>>,
}

impl ObjectRef {
    /// Creates an empty instance of `type_name`.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self::from_object(Object {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        })
    }

    /// Wraps existing object state into a new shared instance.
    #[must_use]
    pub fn from_object(object: Object) -> Self {
        ObjectRef {
            inner: Arc::new(RwLock::new(object)),
        }
    }

    /// Full name of the instance's type.
    #[must_use]
    pub fn type_name(&self) -> String {
        read_lock!(self.inner).type_name.clone()
    }

    /// Reads a field, returning `None` if the instance never had it.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        read_lock!(self.inner).fields.get(name).cloned()
    }

    /// Writes a field, creating it if necessary.
    pub fn set_field(&self, name: impl Into<String>, value: Value) {
        write_lock!(self.inner).fields.insert(name.into(), value);
    }

    /// Returns a deep copy of the current object state.
    #[must_use]
    pub fn snapshot(&self) -> Object {
        read_lock!(self.inner).clone()
    }

    /// Checks whether two references point at the same instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.snapshot() == other.snapshot()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object = read_lock!(self.inner);
        f.debug_struct("ObjectRef")
            .field("type_name", &object.type_name)
            .field("fields", &object.fields)
            .finish()
    }
}

impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Object::deserialize(deserializer).map(ObjectRef::from_object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_matching() {
        assert!(Value::I32(1).matches_type(INT32));
        assert!(!Value::I32(1).matches_type(INT64));
        assert!(Value::Null.matches_type(STRING));
        assert!(!Value::Null.matches_type(INT32));
        assert!(Value::Str("x".into()).matches_type(OBJECT));

        let object = ObjectRef::new("Shop.Order");
        assert!(Value::Object(object).matches_type("Shop.Order"));
    }

    #[test]
    fn test_object_shares_state() {
        let a = ObjectRef::new("Shop.Order");
        let b = a.clone();
        b.set_field("total", Value::I32(10));
        assert_eq!(a.field("total"), Some(Value::I32(10)));
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_object_wire_form_is_a_snapshot() {
        let original = ObjectRef::new("Shop.Order");
        original.set_field("id", Value::I64(7));

        let bytes = bincode::serialize(&Value::Object(original.clone())).unwrap();
        let copy: Value = bincode::deserialize(&bytes).unwrap();

        let copy = copy.as_object().unwrap().clone();
        assert!(!copy.ptr_eq(&original));
        assert_eq!(copy, original);

        copy.set_field("id", Value::I64(8));
        assert_eq!(original.field("id"), Some(Value::I64(7)));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy().unwrap());
        assert!(Value::I32(3).is_truthy().unwrap());
        assert!(Value::Str("x".into()).is_truthy().is_err());
    }
}
