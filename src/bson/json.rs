//! Conversion between documents and `serde_json` values.
//!
//! Types without a JSON counterpart use single-key extended forms:
//! `{"$oid": "<24 hex>"}`, `{"$date": <millis>}` and `{"$binary": "<hex>"}`.
//! Integral JSON numbers become `Int`, everything else `Float`.

use serde_json::{Map, Number, Value as Json};

use crate::error::{DbError, DbResult};

use super::{Document, ObjectId, Value, MAX_NESTING_DEPTH};

pub fn to_json(doc: &Document) -> Json {
    Json::Object(document_to_map(doc))
}

fn document_to_map(doc: &Document) -> Map<String, Json> {
    doc.iter()
        .map(|(name, value)| (name.to_string(), value_to_json(value)))
        .collect()
}

fn tagged(tag: &str, value: Json) -> Json {
    let mut map = Map::new();
    map.insert(tag.to_string(), value);
    Json::Object(map)
}

pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(v) => Json::Number((*v).into()),
        // non-finite floats have no JSON form
        Value::Float(v) => Number::from_f64(*v).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.clone()),
        Value::Binary(bytes) => tagged("$binary", Json::String(to_hex(bytes))),
        Value::Array(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Document(doc) => to_json(doc),
        Value::DateTime(ms) => tagged("$date", Json::Number((*ms).into())),
        Value::ObjectId(oid) => tagged("$oid", Json::String(oid.to_hex())),
    }
}

/// Convert a JSON object into a document. Any other JSON type is rejected.
pub fn from_json(json: &Json) -> DbResult<Document> {
    match json {
        Json::Object(map) => map_to_document(map, 1),
        other => Err(DbError::type_mismatch("JSON object", json_type(other))),
    }
}

/// Parse JSON text into a document.
pub fn parse_document(text: &str) -> DbResult<Document> {
    let json: Json = serde_json::from_str(text)
        .map_err(|e| DbError::invalid(format!("malformed JSON: {e}")))?;
    from_json(&json)
}

fn json_type(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn map_to_document(map: &Map<String, Json>, depth: usize) -> DbResult<Document> {
    if depth > MAX_NESTING_DEPTH {
        return Err(DbError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    map.iter()
        .map(|(name, value)| Ok((name.clone(), json_to_value(value, depth)?)))
        .collect::<DbResult<Vec<_>>>()
        .map(|fields| fields.into_iter().collect())
}

fn json_to_value(json: &Json, depth: usize) -> DbResult<Value> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(v) => Value::Int(v),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => {
            if depth + 1 > MAX_NESTING_DEPTH {
                return Err(DbError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            Value::Array(
                items
                    .iter()
                    .map(|item| json_to_value(item, depth + 1))
                    .collect::<DbResult<_>>()?,
            )
        }
        Json::Object(map) => match extended(map)? {
            Some(value) => value,
            None => Value::Document(map_to_document(map, depth + 1)?),
        },
    })
}

/// Recognize `$oid`, `$date` and `$binary` wrappers.
fn extended(map: &Map<String, Json>) -> DbResult<Option<Value>> {
    if map.len() != 1 {
        return Ok(None);
    }
    let Some((tag, inner)) = map.iter().next() else {
        return Ok(None);
    };
    let value = match (tag.as_str(), inner) {
        ("$oid", Json::String(hex)) => Value::ObjectId(ObjectId::parse_str(hex)?),
        ("$date", Json::Number(ms)) => Value::DateTime(
            ms.as_i64()
                .ok_or_else(|| DbError::invalid(format!("$date {ms} is not an integer")))?,
        ),
        ("$binary", Json::String(hex)) => Value::Binary(from_hex(hex)?),
        ("$oid" | "$date" | "$binary", other) => {
            return Err(DbError::type_mismatch(
                format!("{tag} payload"),
                json_type(other),
            ))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(hex: &str) -> DbResult<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(DbError::invalid(format!("invalid hex string {hex:?}")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| DbError::invalid(format!("invalid hex string {hex:?}")))
        })
        .collect()
}
