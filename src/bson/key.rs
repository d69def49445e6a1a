//! Order-preserving key encoding.
//!
//! Comparing two encoded keys with `memcmp` gives the same answer as
//! comparing the values: first by type bracket, then within the bracket.
//! Every encoding is self-delimiting, so keys can be concatenated into
//! composite keys (index value followed by primary key).
//!
//! | bracket  | tag  | payload                                         |
//! |----------|------|-------------------------------------------------|
//! | null     | 0x10 |                                                 |
//! | number   | 0x20 | ordered f64, then sign-flipped i64 residual     |
//! | string   | 0x30 | escaped bytes, `00 00`                          |
//! | document | 0x40 | (`01`, escaped name, value)*, `00`              |
//! | array    | 0x50 | value*, `00`                                    |
//! | binary   | 0x60 | escaped bytes, `00 00`                          |
//! | objectid | 0x70 | 12 bytes                                        |
//! | bool     | 0x80 | `00` or `01`                                    |
//! | datetime | 0x90 | sign-flipped i64                                |
//!
//! Escaping maps `00` to `00 FF`. No encoding starts with `0xFF`.

use std::cmp::Ordering;

use crate::error::{DbError, DbResult};

use super::Value;

const TAG_NULL: u8 = 0x10;
const TAG_NUMBER: u8 = 0x20;
const TAG_STRING: u8 = 0x30;
const TAG_DOCUMENT: u8 = 0x40;
const TAG_ARRAY: u8 = 0x50;
const TAG_BINARY: u8 = 0x60;
const TAG_OBJECT_ID: u8 = 0x70;
const TAG_BOOL: u8 = 0x80;
const TAG_DATETIME: u8 = 0x90;

const FIELD_MARKER: u8 = 0x01;
const END: u8 = 0x00;

/// Sorts after every encoded value.
pub const MAX_KEY: u8 = 0xFF;

/// Type bracket of a value. Ints and floats share one bracket.
pub fn bracket(value: &Value) -> u8 {
    match value {
        Value::Null => TAG_NULL,
        Value::Int(_) | Value::Float(_) => TAG_NUMBER,
        Value::String(_) => TAG_STRING,
        Value::Document(_) => TAG_DOCUMENT,
        Value::Array(_) => TAG_ARRAY,
        Value::Binary(_) => TAG_BINARY,
        Value::ObjectId(_) => TAG_OBJECT_ID,
        Value::Bool(_) => TAG_BOOL,
        Value::DateTime(_) => TAG_DATETIME,
    }
}

/// Smallest key in the value's bracket.
pub fn bracket_start(value: &Value) -> Vec<u8> {
    vec![bracket(value)]
}

/// First key past the value's bracket.
pub fn bracket_end(value: &Value) -> Vec<u8> {
    vec![bracket(value) + 1]
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    encode_into(value, &mut out);
    out
}

/// Encode a primary key, rejecting types that cannot serve as one.
pub fn encode_primary_key(value: &Value) -> DbResult<Vec<u8>> {
    if !value.is_valid_key_type() {
        return Err(DbError::invalid(format!(
            "_id of type {} cannot be a primary key",
            value.type_name()
        )));
    }
    Ok(encode(value))
}

/// Compare two values in key order, or `None` when they sit in different
/// brackets.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if bracket(a) != bracket(b) {
        return None;
    }
    Some(encode(a).cmp(&encode(b)))
}

/// `key` followed by the max sentinel: an exclusive upper bound for every
/// composite key that starts with `key`.
pub fn after_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(MAX_KEY);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    out.push(bracket(value));
    match value {
        Value::Null => {}
        Value::Int(v) => encode_number(*v as f64, residual(*v), out),
        Value::Float(v) => encode_number(*v, 0, out),
        Value::String(s) => encode_escaped(s.as_bytes(), out),
        Value::Binary(bytes) => encode_escaped(bytes, out),
        Value::Document(doc) => {
            for (name, value) in doc.iter() {
                out.push(FIELD_MARKER);
                encode_escaped(name.as_bytes(), out);
                encode_into(value, out);
            }
            out.push(END);
        }
        Value::Array(items) => {
            for item in items {
                encode_into(item, out);
            }
            out.push(END);
        }
        Value::ObjectId(oid) => out.extend_from_slice(&oid.bytes()),
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::DateTime(ms) => out.extend_from_slice(&flip_sign(*ms)),
    }
}

/// Difference between an int and its nearest f64, so that ints beyond 2^53
/// still order exactly.
fn residual(v: i64) -> i64 {
    let rounded = v as f64 as i128;
    (v as i128 - rounded) as i64
}

fn encode_number(v: f64, residual: i64, out: &mut Vec<u8>) {
    let v = if v == 0.0 {
        0.0
    } else if v.is_nan() {
        f64::NAN
    } else {
        v
    };
    let bits = v.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    out.extend_from_slice(&ordered.to_be_bytes());
    out.extend_from_slice(&flip_sign(residual));
}

fn flip_sign(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0 {
            out.push(0xFF);
        }
    }
    out.extend_from_slice(&[0, 0]);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{bson::ObjectId, doc};

    fn assert_ascending(values: &[Value]) {
        for pair in values.windows(2) {
            assert!(
                encode(&pair[0]) < encode(&pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_bracket_order() {
        assert_ascending(&[
            Value::Null,
            Value::Int(i64::MAX),
            Value::from("a"),
            Value::Document(doc! { "a" => 1 }),
            Value::Array(vec![]),
            Value::Binary(vec![]),
            Value::ObjectId(ObjectId::from_bytes([0; 12])),
            Value::Bool(false),
            Value::DateTime(i64::MIN),
        ]);
    }

    #[test]
    fn test_numbers_order_across_int_and_float() {
        assert_ascending(&[
            Value::Float(f64::NEG_INFINITY),
            Value::Int(i64::MIN),
            Value::Float(-1.5),
            Value::Int(-1),
            Value::Int(0),
            Value::Float(0.5),
            Value::Int(1),
            Value::Float(1.5),
            Value::Int(9_007_199_254_740_992),
            Value::Int(9_007_199_254_740_993),
            Value::Int(i64::MAX),
            Value::Float(f64::INFINITY),
            Value::Float(f64::NAN),
        ]);
        assert_eq!(encode(&Value::Int(1)), encode(&Value::Float(1.0)));
        assert_eq!(encode(&Value::Float(-0.0)), encode(&Value::Float(0.0)));
    }

    #[test]
    fn test_strings_with_nul_and_prefixes() {
        assert_ascending(&[
            Value::from(""),
            Value::from("\0"),
            Value::from("a"),
            Value::from("a\0"),
            Value::from("a\0b"),
            Value::from("ab"),
            Value::from("b"),
        ]);
    }

    #[test]
    fn test_composites_are_self_delimiting() {
        assert_ascending(&[
            Value::Array(vec![]),
            Value::Array(vec![Value::Int(1)]),
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
            Value::Array(vec![Value::Int(2)]),
        ]);
        assert_ascending(&[
            Value::Document(doc! {}),
            Value::Document(doc! { "a" => 1 }),
            Value::Document(doc! { "a" => 1, "b" => 1 }),
            Value::Document(doc! { "b" => 0 }),
        ]);
    }

    #[test]
    fn test_primary_key_types() {
        assert!(encode_primary_key(&Value::Int(1)).is_ok());
        assert!(encode_primary_key(&Value::ObjectId(ObjectId::new())).is_ok());
        assert!(matches!(
            encode_primary_key(&Value::Float(1.0)),
            Err(DbError::InvalidArgument(_))
        ));
        assert!(encode_primary_key(&Value::Null).is_err());
    }

    #[test]
    fn test_prefix_bounds() {
        let five = encode(&Value::Int(5));
        let composite = [five.clone(), encode(&Value::from("pk"))].concat();
        assert!(five < composite);
        assert!(composite < after_prefix(&five));
        assert!(after_prefix(&five) < encode(&Value::Int(6)));
        assert!(encode(&Value::Int(i64::MAX)) < bracket_end(&Value::Int(0)));
        assert_eq!(compare(&Value::Int(1), &Value::from("1")), None);
        assert_eq!(
            compare(&Value::Int(2), &Value::Float(1.5)),
            Some(Ordering::Greater)
        );
    }

    proptest! {
        #[test]
        fn prop_int_order_matches_key_order(a in any::<i64>(), b in any::<i64>()) {
            let (ka, kb) = (encode(&Value::Int(a)), encode(&Value::Int(b)));
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn prop_float_order_matches_key_order(a in -1e300f64..1e300, b in -1e300f64..1e300) {
            let (ka, kb) = (encode(&Value::Float(a)), encode(&Value::Float(b)));
            prop_assert_eq!(a.partial_cmp(&b), Some(ka.cmp(&kb)));
        }

        #[test]
        fn prop_string_order_matches_key_order(a in ".{0,8}", b in ".{0,8}") {
            let (ka, kb) = (encode(&Value::from(a.as_str())), encode(&Value::from(b.as_str())));
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ka.cmp(&kb));
        }
    }
}
