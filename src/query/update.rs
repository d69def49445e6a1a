use crate::{
    bson::{key, Document, Value},
    error::{DbError, DbResult},
};

/// One update operator applied to one field path.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(String, Value),
    Unset(String),
    Inc(String, Value),
    Mul(String, Value),
    Min(String, Value),
    Max(String, Value),
    Rename(String, String),
}

impl UpdateOp {
    fn touches(&self, path: &str) -> bool {
        let hits = |field: &str| field == path || field.starts_with(&format!("{path}."));
        match self {
            UpdateOp::Set(field, _)
            | UpdateOp::Unset(field)
            | UpdateOp::Inc(field, _)
            | UpdateOp::Mul(field, _)
            | UpdateOp::Min(field, _)
            | UpdateOp::Max(field, _) => hits(field),
            UpdateOp::Rename(from, to) => hits(from) || hits(to),
        }
    }
}

/// A parsed update document such as `{$set: {a: 1}, $inc: {n: 2}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

fn number_operand(op: &str, field: &str, value: &Value) -> DbResult<Value> {
    if value.is_number() {
        Ok(value.clone())
    } else {
        Err(DbError::type_mismatch(
            format!("number for {op} {field}"),
            value.type_name(),
        ))
    }
}

fn valid_path(path: &str) -> DbResult<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(DbError::invalid(format!("invalid update path {path:?}")));
    }
    Ok(())
}

impl Update {
    pub fn parse(doc: &Document) -> DbResult<Self> {
        let mut ops = Vec::new();
        for (operator, fields) in doc.iter() {
            let fields = fields.as_document().ok_or_else(|| {
                DbError::type_mismatch(format!("document for {operator}"), fields.type_name())
            })?;
            for (field, operand) in fields.iter() {
                valid_path(field)?;
                let field = field.to_string();
                let op = match operator {
                    "$set" => UpdateOp::Set(field, operand.clone()),
                    "$unset" => UpdateOp::Unset(field),
                    "$inc" => {
                        let amount = number_operand(operator, &field, operand)?;
                        UpdateOp::Inc(field, amount)
                    }
                    "$mul" => {
                        let factor = number_operand(operator, &field, operand)?;
                        UpdateOp::Mul(field, factor)
                    }
                    "$min" => UpdateOp::Min(field, operand.clone()),
                    "$max" => UpdateOp::Max(field, operand.clone()),
                    "$rename" => {
                        let to = operand.as_str().ok_or_else(|| {
                            DbError::type_mismatch("string for $rename", operand.type_name())
                        })?;
                        valid_path(to)?;
                        UpdateOp::Rename(field, to.to_string())
                    }
                    other => {
                        return Err(DbError::invalid(format!("unknown update operator {other}")))
                    }
                };
                ops.push(op);
            }
        }
        if ops.is_empty() {
            return Err(DbError::invalid("update has no operators"));
        }
        if ops.iter().any(|op| op.touches("_id")) {
            return Err(DbError::invalid("_id cannot be modified"));
        }
        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    /// Apply every operator in order.
    pub fn apply(&self, doc: &mut Document) -> DbResult<()> {
        for op in &self.ops {
            match op {
                UpdateOp::Set(field, value) => {
                    doc.set_path(field, value.clone())?;
                }
                UpdateOp::Unset(field) => {
                    doc.remove_path(field);
                }
                UpdateOp::Inc(field, amount) => {
                    let next = match doc.get_path(field) {
                        None => amount.clone(),
                        Some(current) => arithmetic(field, current, amount, i64::checked_add, |a, b| a + b)?,
                    };
                    doc.set_path(field, next)?;
                }
                UpdateOp::Mul(field, factor) => {
                    let next = match doc.get_path(field) {
                        // a missing field becomes zero of the factor's type
                        None => match factor {
                            Value::Float(_) => Value::Float(0.0),
                            _ => Value::Int(0),
                        },
                        Some(current) => arithmetic(field, current, factor, i64::checked_mul, |a, b| a * b)?,
                    };
                    doc.set_path(field, next)?;
                }
                UpdateOp::Min(field, value) => {
                    let replace = doc
                        .get_path(field)
                        .map_or(true, |current| key::encode(value) < key::encode(current));
                    if replace {
                        doc.set_path(field, value.clone())?;
                    }
                }
                UpdateOp::Max(field, value) => {
                    let replace = doc
                        .get_path(field)
                        .map_or(true, |current| key::encode(value) > key::encode(current));
                    if replace {
                        doc.set_path(field, value.clone())?;
                    }
                }
                UpdateOp::Rename(from, to) => {
                    if let Some(value) = doc.remove_path(from) {
                        doc.set_path(to, value)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn arithmetic(
    field: &str,
    current: &Value,
    operand: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> DbResult<Value> {
    match (current, operand) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or_else(|| DbError::invalid(format!("integer overflow updating {field}"))),
        (current, operand) => match (current.as_f64(), operand.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
            _ => Err(DbError::type_mismatch(
                format!("number at {field}"),
                current.type_name(),
            )),
        },
    }
}

impl TryFrom<&Document> for Update {
    type Error = DbError;

    fn try_from(doc: &Document) -> DbResult<Self> {
        Self::parse(doc)
    }
}

impl TryFrom<Document> for Update {
    type Error = DbError;

    fn try_from(doc: Document) -> DbResult<Self> {
        Self::parse(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn apply(doc: &mut Document, update: Document) -> DbResult<()> {
        Update::parse(&update)?.apply(doc)
    }

    #[test]
    fn test_set_unset_rename() {
        let mut doc = doc! { "_id" => 1, "a" => 1, "b" => doc! { "c" => 2 } };
        apply(
            &mut doc,
            doc! {
                "$set" => doc! { "a" => "x", "b.d" => 3, "e.f" => true },
                "$unset" => doc! { "b.c" => "" },
                "$rename" => doc! { "a" => "z" },
            },
        )
        .unwrap();
        assert_eq!(doc.get("a"), None);
        assert_eq!(doc.get("z"), Some(&Value::from("x")));
        assert_eq!(doc.get_path("b.c"), None);
        assert_eq!(doc.get_path("b.d"), Some(&Value::Int(3)));
        assert_eq!(doc.get_path("e.f"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_arithmetic() {
        let mut doc = doc! { "n" => 5, "f" => 1.5, "s" => "str" };
        apply(
            &mut doc,
            doc! {
                "$inc" => doc! { "n" => 2, "f" => 1, "new" => 4 },
                "$mul" => doc! { "absent" => 3 },
            },
        )
        .unwrap();
        assert_eq!(doc.get("n"), Some(&Value::Int(7)));
        assert_eq!(doc.get("f"), Some(&Value::Float(2.5)));
        assert_eq!(doc.get("new"), Some(&Value::Int(4)));
        assert_eq!(doc.get("absent"), Some(&Value::Int(0)));

        apply(&mut doc, doc! { "$mul" => doc! { "n" => 0.5 } }).unwrap();
        assert_eq!(doc.get("n"), Some(&Value::Float(3.5)));

        assert!(matches!(
            apply(&mut doc, doc! { "$inc" => doc! { "s" => 1 } }),
            Err(DbError::TypeMismatch { .. })
        ));
        let mut big = doc! { "n" => i64::MAX };
        assert!(apply(&mut big, doc! { "$inc" => doc! { "n" => 1 } }).is_err());
    }

    #[test]
    fn test_min_max() {
        let mut doc = doc! { "lo" => 5, "hi" => 5 };
        apply(
            &mut doc,
            doc! {
                "$min" => doc! { "lo" => 3, "fresh" => 9 },
                "$max" => doc! { "hi" => 4.5 },
            },
        )
        .unwrap();
        assert_eq!(doc.get("lo"), Some(&Value::Int(3)));
        assert_eq!(doc.get("hi"), Some(&Value::Int(5)));
        assert_eq!(doc.get("fresh"), Some(&Value::Int(9)));
    }

    #[test]
    fn test_rejected_updates() {
        let rejects = [
            doc! { "$set" => doc! { "_id" => 2 } },
            doc! { "$rename" => doc! { "a" => "_id" } },
            doc! { "$unset" => doc! { "_id.x" => "" } },
            doc! { "$push" => doc! { "a" => 1 } },
            doc! { "a" => 1 },
            doc! {},
            doc! { "$inc" => doc! { "a" => "one" } },
        ];
        for update in rejects {
            assert!(Update::parse(&update).is_err(), "{update}");
        }
        assert!(Update::parse(&doc! { "$set" => doc! { "_idx" => 1 } }).is_ok());
    }
}
