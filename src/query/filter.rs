use std::{cmp::Ordering, fmt, ops::Bound};

use crate::{
    bson::{key, Document, Value, MAX_NESTING_DEPTH},
    error::{DbError, DbResult},
};

/// Comparison applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
}

impl Op {
    fn parse(name: &str, operand: &Value) -> DbResult<Self> {
        let op = match name {
            "$eq" => Op::Eq(operand.clone()),
            "$ne" => Op::Ne(operand.clone()),
            "$gt" => Op::Gt(operand.clone()),
            "$gte" => Op::Gte(operand.clone()),
            "$lt" => Op::Lt(operand.clone()),
            "$lte" => Op::Lte(operand.clone()),
            "$in" => match operand {
                Value::Array(items) => Op::In(items.clone()),
                other => return Err(DbError::type_mismatch("array for $in", other.type_name())),
            },
            other => return Err(DbError::invalid(format!("unknown filter operator {other}"))),
        };
        Ok(op)
    }

    fn matches(&self, actual: &Value) -> bool {
        let cmp = |expected: &Value| key::compare(actual, expected);
        match self {
            Op::Eq(expected) => cmp(expected) == Some(Ordering::Equal),
            Op::Ne(expected) => cmp(expected) != Some(Ordering::Equal),
            Op::Gt(bound) => cmp(bound) == Some(Ordering::Greater),
            Op::Gte(bound) => matches!(cmp(bound), Some(Ordering::Greater | Ordering::Equal)),
            Op::Lt(bound) => cmp(bound) == Some(Ordering::Less),
            Op::Lte(bound) => matches!(cmp(bound), Some(Ordering::Less | Ordering::Equal)),
            Op::In(candidates) => candidates
                .iter()
                .any(|candidate| cmp(candidate) == Some(Ordering::Equal)),
        }
    }
}

/// One `field op operand` term of a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: Op,
}

impl Predicate {
    pub fn matches(&self, doc: &Document) -> bool {
        let actual = doc.get_path(&self.field).unwrap_or(&Value::Null);
        self.op.matches(actual)
    }

    /// Whether an index range scan can drive this predicate.
    pub fn is_seekable(&self) -> bool {
        !matches!(self.op, Op::Ne(_) | Op::In(_))
    }

    /// Key range covering every key whose leading value satisfies this
    /// predicate. Holds for bare keys and for composite keys that start with
    /// the value. Range operators stay inside the operand's type bracket.
    pub fn key_range(&self) -> Option<KeyRange> {
        let (start, end) = match &self.op {
            Op::Eq(value) => {
                let encoded = key::encode(value);
                let end = key::after_prefix(&encoded);
                (encoded, end)
            }
            Op::Gt(value) => (
                key::after_prefix(&key::encode(value)),
                key::bracket_end(value),
            ),
            Op::Gte(value) => (key::encode(value), key::bracket_end(value)),
            Op::Lt(value) => (key::bracket_start(value), key::encode(value)),
            Op::Lte(value) => (
                key::bracket_start(value),
                key::after_prefix(&key::encode(value)),
            ),
            Op::Ne(_) | Op::In(_) => return None,
        };
        Some(KeyRange { start, end })
    }
}

/// Half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    /// The overlap of two ranges. May be empty.
    pub fn intersect(self, other: KeyRange) -> KeyRange {
        KeyRange {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_slice() <= key && key < self.end.as_slice()
    }

    pub fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (
            Bound::Included(self.start.as_slice()),
            Bound::Excluded(self.end.as_slice()),
        )
    }
}

/// A conjunction of field predicates.
///
/// Written as a document: `{field: value}` tests equality and
/// `{field: {$gt: 1, $lt: 9}}` applies each operator. A document operand
/// whose keys do not start with `$` is a literal embedded-document value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(doc: &Document) -> DbResult<Self> {
        let mut predicates = Vec::new();
        for (field, value) in doc.iter() {
            if field.is_empty() || field.starts_with('$') || field.split('.').any(str::is_empty) {
                return Err(DbError::invalid(format!("invalid filter field {field:?}")));
            }
            // operands are key-encoded recursively
            if nests_deeper_than(value, MAX_NESTING_DEPTH - 1) {
                return Err(DbError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            match value {
                Value::Document(ops) if is_operator_document(ops) => {
                    for (name, operand) in ops.iter() {
                        predicates.push(Predicate {
                            field: field.to_string(),
                            op: Op::parse(name, operand)?,
                        });
                    }
                }
                literal => predicates.push(Predicate {
                    field: field.to_string(),
                    op: Op::Eq(literal.clone()),
                }),
            }
        }
        Ok(Self { predicates })
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.predicates.iter().all(|predicate| predicate.matches(doc))
    }
}

/// Whether `value` holds more than `levels` nested documents or arrays.
/// Never descends past `levels`.
fn nests_deeper_than(value: &Value, levels: usize) -> bool {
    match value {
        Value::Document(doc) => {
            levels == 0 || doc.iter().any(|(_, child)| nests_deeper_than(child, levels - 1))
        }
        Value::Array(items) => {
            levels == 0 || items.iter().any(|child| nests_deeper_than(child, levels - 1))
        }
        _ => false,
    }
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|first| first.starts_with('$'))
}

impl TryFrom<&Document> for Filter {
    type Error = DbError;

    fn try_from(doc: &Document) -> DbResult<Self> {
        Self::parse(doc)
    }
}

impl TryFrom<Document> for Filter {
    type Error = DbError;

    fn try_from(doc: Document) -> DbResult<Self> {
        Self::parse(&doc)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Eq(v) => write!(f, "= {v}"),
            Op::Ne(v) => write!(f, "!= {v}"),
            Op::Gt(v) => write!(f, "> {v}"),
            Op::Gte(v) => write!(f, ">= {v}"),
            Op::Lt(v) => write!(f, "< {v}"),
            Op::Lte(v) => write!(f, "<= {v}"),
            Op::In(values) => write!(f, "in {}", Value::Array(values.clone())),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn filter(doc: Document) -> Filter {
        Filter::parse(&doc).unwrap()
    }

    #[test]
    fn test_equality_and_missing_fields() {
        let person = doc! { "name" => "ann", "age" => 30, "address" => doc! { "city" => "Oslo" } };
        assert!(filter(doc! { "name" => "ann" }).matches(&person));
        assert!(filter(doc! { "age" => 30.0 }).matches(&person));
        assert!(filter(doc! { "address.city" => "Oslo" }).matches(&person));
        assert!(!filter(doc! { "age" => "30" }).matches(&person));
        assert!(filter(doc! { "nickname" => Value::Null }).matches(&person));
        assert!(!filter(doc! { "nickname" => doc! { "$ne" => Value::Null } }).matches(&person));
        assert!(filter(doc! { "address" => doc! { "city" => "Oslo" } }).matches(&person));
        assert!(Filter::all().matches(&person));
    }

    #[test]
    fn test_ranges_are_type_bracketed() {
        let doc = doc! { "v" => 5 };
        assert!(filter(doc! { "v" => doc! { "$gt" => 4.5, "$lte" => 5 } }).matches(&doc));
        assert!(!filter(doc! { "v" => doc! { "$lt" => 5 } }).matches(&doc));
        assert!(!filter(doc! { "v" => doc! { "$lt" => "z" } }).matches(&doc));
        assert!(!filter(doc! { "v" => doc! { "$gt" => Value::Null } }).matches(&doc));
        assert!(filter(doc! { "v" => doc! { "$ne" => "5" } }).matches(&doc));
        assert!(filter(doc! { "v" => doc! { "$in" => vec![Value::from(1), Value::from(5)] } })
            .matches(&doc));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Filter::parse(&doc! { "v" => doc! { "$regex" => "a" } }),
            Err(DbError::InvalidArgument(_))
        ));
        assert!(matches!(
            Filter::parse(&doc! { "v" => doc! { "$in" => 3 } }),
            Err(DbError::TypeMismatch { .. })
        ));
        assert!(Filter::parse(&doc! { "$or" => 1 }).is_err());
        assert!(Filter::parse(&doc! { "a..b" => 1 }).is_err());
    }

    #[test]
    fn test_nesting_limit() {
        // the filter document itself is the first level
        let mut operand = Value::Null;
        for _ in 0..MAX_NESTING_DEPTH - 1 {
            operand = Value::Array(vec![operand]);
        }
        assert!(Filter::parse(&doc! { "v" => operand.clone() }).is_ok());
        assert!(matches!(
            Filter::parse(&doc! { "v" => Value::Array(vec![operand.clone()]) }),
            Err(DbError::NestingTooDeep(MAX_NESTING_DEPTH))
        ));
        assert!(matches!(
            Filter::parse(&doc! { "v" => doc! { "$in" => vec![operand] } }),
            Err(DbError::NestingTooDeep(_))
        ));
    }

    #[test]
    fn test_key_ranges() {
        let encode = |v: i64| key::encode(&Value::Int(v));
        let range = |f: Document| filter(f).predicates()[0].key_range().unwrap();

        let gte3 = range(doc! { "age" => doc! { "$gte" => 3 } });
        let composite = [encode(3), key::encode(&Value::from("pk"))].concat();
        assert!(gte3.contains(&composite));
        assert!(gte3.contains(&encode(9)));
        assert!(!gte3.contains(&encode(2)));
        assert!(!gte3.contains(&key::encode(&Value::from("x"))));

        let gt3 = range(doc! { "age" => doc! { "$gt" => 3 } });
        assert!(!gt3.contains(&composite));
        assert!(gt3.contains(&encode(4)));

        let lte3 = range(doc! { "age" => doc! { "$lte" => 3 } });
        assert!(lte3.contains(&composite));
        assert!(!lte3.contains(&key::encode(&Value::Null)));

        let band = gt3.intersect(range(doc! { "age" => doc! { "$lt" => 6 } }));
        assert!(band.contains(&encode(5)));
        assert!(!band.contains(&encode(6)));
        assert!(!band.contains(&encode(3)));

        let ne_filter = filter(doc! { "age" => doc! { "$ne" => 3 } });
        let ne = &ne_filter.predicates()[0];
        assert!(ne.key_range().is_none());
    }

    #[test]
    fn test_display() {
        let parsed = filter(doc! { "age" => doc! { "$gte" => 3 }, "name" => "ann" });
        let shown: Vec<String> = parsed.predicates().iter().map(ToString::to_string).collect();
        assert_eq!(shown, vec!["age >= 3", "name = \"ann\""]);
    }
}
