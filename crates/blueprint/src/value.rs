//! Dynamic values stored as configuration arguments.
//!
//! Arguments are loosely typed: setting a field never checks the value
//! against a declared type. Constructors read their arguments back through
//! [`FromValue`], which is where type mismatches surface.

use std::{any::Any, collections::BTreeMap, fmt, rc::Rc};

use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::{config::Config, target::Tag};

/// A single argument value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A nested configuration; built recursively.
    Config(Config),
    /// A slot that must be filled before building.
    Placeholder(Tag),
    /// An already-constructed object, shared by reference.
    Object(Object),
}

impl Value {
    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Config(_) => "config",
            Value::Placeholder(_) => "placeholder",
            Value::Object(_) => "object",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_config(&self) -> Option<&Config> {
        match self {
            Value::Config(config) => Some(config),
            _ => None,
        }
    }

    pub fn as_config_mut(&mut self) -> Option<&mut Config> {
        match self {
            Value::Config(config) => Some(config),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Builds a string-keyed map value from `(key, value)` pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Type-erased, reference-counted object produced by a constructor.
///
/// Equality is identity: two objects are equal only when they share the
/// same allocation.
#[derive(Clone)]
pub struct Object {
    type_name: &'static str,
    inner: Rc<dyn Any>,
}

impl Object {
    pub fn new<T: Any>(value: T) -> Self {
        Self::from_rc(Rc::new(value))
    }

    pub fn from_rc<T: Any>(value: Rc<T>) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: value,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the shared value when it has concrete type `T`.
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.inner), Rc::as_ptr(&other.inner))
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object>", self.type_name)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::None => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => items.serialize(serializer),
            Value::Map(entries) => entries.serialize(serializer),
            Value::Config(config) => config.serialize(serializer),
            Value::Placeholder(tag) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("__placeholder__", tag.name())?;
                map.end()
            }
            Value::Object(object) => serializer.serialize_str(&format!("{object:?}")),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $cast:ty),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value as $cast)
            }
        })*
    };
}

value_from! {
    i64 => Int as i64,
    i32 => Int as i64,
    u32 => Int as i64,
    usize => Int as i64,
    f64 => Float as f64,
    f32 => Float as f64,
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Config> for Value {
    fn from(value: Config) -> Self {
        Value::Config(value)
    }
}

impl From<Object> for Value {
    fn from(value: Object) -> Self {
        Value::Object(value)
    }
}

impl From<Tag> for Value {
    fn from(value: Tag) -> Self {
        Value::Placeholder(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::None, Into::into)
    }
}

/// Conversion from a built argument back into a concrete Rust type.
pub trait FromValue: Sized {
    /// Human-readable name used in type-mismatch errors.
    const EXPECTED: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    const EXPECTED: &'static str = "any value";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for bool {
    const EXPECTED: &'static str = "bool";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "int";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromValue for usize {
    const EXPECTED: &'static str = "non-negative int";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => usize::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "float";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(x) => Some(*x),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromValue for String {
    const EXPECTED: &'static str = "str";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FromValue for Config {
    const EXPECTED: &'static str = "config";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_config().cloned()
    }
}

impl FromValue for Object {
    const EXPECTED: &'static str = "object";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_object().cloned()
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::None => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    const EXPECTED: &'static str = "list";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::List(items) => items.iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    const EXPECTED: &'static str = "map";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k.clone(), v)))
                .collect(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_round_trip_through_from_value() {
        let list: Value = vec![1i64, 2, 3].into();
        assert_eq!(Vec::<usize>::from_value(&list), Some(vec![1, 2, 3]));
        assert_eq!(Option::<String>::from_value(&Value::None), Some(None));
        assert_eq!(f64::from_value(&Value::Int(2)), Some(2.0));
        assert_eq!(usize::from_value(&Value::Int(-1)), None);
        assert_eq!(bool::from_value(&Value::Str("true".into())), None);
    }

    #[test]
    fn objects_compare_by_identity() {
        let a = Object::new(5u32);
        let b = Object::new(5u32);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.downcast::<u32>().map(|v| *v), Some(5));
        assert!(a.downcast::<i32>().is_none());
    }
}
