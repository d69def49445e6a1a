use std::fmt;

use crate::error::{DbError, DbResult};

use super::ObjectId;

/// A single document value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Document(Document),
    /// Milliseconds since the Unix epoch
    DateTime(i64),
    ObjectId(ObjectId),
}

impl PartialEq for Value {
    /// Structural equality. Floats compare by bit pattern so that NaN equals
    /// itself; use the query layer for numeric comparisons across types.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Document(a), Value::Document(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Document(_) => "document",
            Value::DateTime(_) => "datetime",
            Value::ObjectId(_) => "objectid",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Whether the value may be used as a primary key.
    pub fn is_valid_key_type(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::String(_) | Value::ObjectId(_) | Value::Bool(_) | Value::DateTime(_)
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Document(doc) => write!(f, "{doc}"),
            Value::DateTime(ms) => write!(f, "DateTime({ms})"),
            Value::ObjectId(oid) => write!(f, "ObjectId(\"{oid}\")"),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f64 => Float,
    f32 => Float,
    String => String,
    &str => String,
    Vec<u8> => Binary,
    Vec<Value> => Array,
    Document => Document,
    ObjectId => ObjectId,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// An ordered map of field names to values. Field order is preserved as
/// inserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set a field, replacing the value in place if the name exists.
    /// Returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.get_mut(&key) {
            Some(existing) => Some(std::mem::replace(existing, value)),
            None => {
                self.fields.push((key, value));
                None
            }
        }
    }

    /// Insert a field at the front, removing any existing field of that name.
    pub fn insert_first(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.remove(&key);
        self.fields.insert(0, (key, value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// The primary key, if present
    pub fn id(&self) -> Option<&Value> {
        self.get("_id")
    }

    /// Look up a dotted path such as `"address.city"` or `"tags.0"`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Document(doc) => doc.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate documents as needed.
    pub fn set_path(&mut self, path: &str, value: Value) -> DbResult<Option<Value>> {
        match path.split_once('.') {
            None => Ok(self.insert(path, value)),
            Some((head, rest)) => {
                if !self.contains_key(head) {
                    self.insert(head, Document::new());
                }
                match self.get_mut(head) {
                    Some(Value::Document(inner)) => inner.set_path(rest, value),
                    Some(Value::Array(items)) => set_in_array(items, path, rest, value),
                    Some(other) => Err(DbError::type_mismatch(
                        format!("document at {head}"),
                        other.type_name(),
                    )),
                    None => Err(DbError::invalid(format!("cannot set {path}"))),
                }
            }
        }
    }

    /// Remove a dotted path. Missing intermediate fields are not an error.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head)? {
                Value::Document(inner) => inner.remove_path(rest),
                Value::Array(items) => {
                    let (index, tail) = match rest.split_once('.') {
                        Some((index, tail)) => (index, Some(tail)),
                        None => (rest, None),
                    };
                    let slot = items.get_mut(index.parse::<usize>().ok()?)?;
                    match tail {
                        // arrays keep their length; the element becomes null
                        None => Some(std::mem::replace(slot, Value::Null)),
                        Some(tail) => match slot {
                            Value::Document(inner) => inner.remove_path(tail),
                            _ => None,
                        },
                    }
                }
                _ => None,
            },
        }
    }
}

fn set_in_array(items: &mut [Value], path: &str, rest: &str, value: Value) -> DbResult<Option<Value>> {
    let (index, tail) = match rest.split_once('.') {
        Some((index, tail)) => (index, Some(tail)),
        None => (rest, None),
    };
    let index: usize = index
        .parse()
        .map_err(|_| DbError::invalid(format!("{path}: array segment {index} is not an index")))?;
    let len = items.len();
    let slot = items
        .get_mut(index)
        .ok_or_else(|| DbError::invalid(format!("{path}: index {index} out of bounds ({len})")))?;
    match tail {
        None => Ok(Some(std::mem::replace(slot, value))),
        Some(tail) => match slot {
            Value::Document(inner) => inner.set_path(tail, value),
            other => Err(DbError::type_mismatch("document", other.type_name())),
        },
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {key:?}: {value}")?;
        }
        if !self.fields.is_empty() {
            write!(f, " ")?;
        }
        write!(f, "}}")
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (key, value) in iter {
            doc.insert(key, value);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_insert_preserves_order_and_replaces() {
        let mut doc = doc! { "b" => 1, "a" => "x" };
        assert_eq!(doc.insert("b", 2), Some(Value::Int(1)));
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        doc.insert_first("_id", 7);
        assert_eq!(doc.keys().next(), Some("_id"));
    }

    #[test]
    fn test_dotted_paths() {
        let mut doc = doc! {
            "name" => "ann",
            "address" => doc! { "city" => "Oslo" },
            "tags" => vec![Value::from("a"), Value::from("b")],
        };
        assert_eq!(doc.get_path("address.city"), Some(&Value::from("Oslo")));
        assert_eq!(doc.get_path("tags.1"), Some(&Value::from("b")));
        assert_eq!(doc.get_path("address.zip"), None);
        assert_eq!(doc.get_path("name.first"), None);

        doc.set_path("address.zip", Value::Int(1234)).unwrap();
        doc.set_path("stats.logins", Value::Int(1)).unwrap();
        assert_eq!(doc.get_path("stats.logins"), Some(&Value::Int(1)));
        assert!(matches!(
            doc.set_path("name.first", Value::Null),
            Err(DbError::TypeMismatch { .. })
        ));

        assert_eq!(doc.remove_path("address.city"), Some(Value::from("Oslo")));
        assert_eq!(doc.remove_path("missing.field"), None);
        assert_eq!(doc.remove_path("tags.0"), Some(Value::from("a")));
        assert_eq!(doc.get_path("tags.0"), Some(&Value::Null));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_display() {
        let doc = doc! { "a" => 1, "b" => vec![Value::Null, Value::Bool(true)] };
        assert_eq!(doc.to_string(), r#"{ "a": 1, "b": [null, true] }"#);
    }
}
