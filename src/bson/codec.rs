//! Binary document format.
//!
//! ```text
//! document := [u32 total len][element]* [0x00]
//! element  := [u8 tag][u32 name len][name utf-8][payload]
//! array    := [u32 total len][u8 tag][payload]* [0x00]
//!
//! tag  payload
//! 0x01 f64 bits
//! 0x02 [u32 len][utf-8]
//! 0x03 document
//! 0x04 array
//! 0x05 [u32 len][bytes]
//! 0x07 12 bytes
//! 0x08 u8 (0 or 1)
//! 0x09 i64 milliseconds
//! 0x0A (none)
//! 0x12 i64
//! ```
//!
//! The total length of documents and arrays includes the length prefix and
//! the terminator, so a reader can skip a nested value without parsing it.

use crate::{
    error::{DbError, DbResult},
    page::ByteReader,
};

use super::{Document, ObjectId, Value, MAX_NESTING_DEPTH};

const TAG_FLOAT: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOCUMENT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_OBJECT_ID: u8 = 0x07;
const TAG_BOOL: u8 = 0x08;
const TAG_DATETIME: u8 = 0x09;
const TAG_NULL: u8 = 0x0A;
const TAG_INT: u8 = 0x12;
const TERMINATOR: u8 = 0x00;

/// Encode a document.
pub fn encode(doc: &Document) -> DbResult<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    encode_document(doc, &mut out, 1)?;
    Ok(out)
}

/// Decode a whole document. Trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> DbResult<Document> {
    let mut reader = ByteReader::new(bytes);
    let doc = decode_document(&mut reader, 1)?;
    if reader.remaining() != 0 {
        return Err(DbError::corrupt("trailing bytes after document"));
    }
    Ok(doc)
}

fn tag_of(value: &Value) -> u8 {
    match value {
        Value::Null => TAG_NULL,
        Value::Bool(_) => TAG_BOOL,
        Value::Int(_) => TAG_INT,
        Value::Float(_) => TAG_FLOAT,
        Value::String(_) => TAG_STRING,
        Value::Binary(_) => TAG_BINARY,
        Value::Array(_) => TAG_ARRAY,
        Value::Document(_) => TAG_DOCUMENT,
        Value::DateTime(_) => TAG_DATETIME,
        Value::ObjectId(_) => TAG_OBJECT_ID,
    }
}

fn put_len(out: &mut Vec<u8>, len: usize) -> DbResult<()> {
    let len = u32::try_from(len)
        .map_err(|_| DbError::invalid(format!("value of {len} bytes is too large to encode")))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Reserve a length slot, run `body`, then patch the slot with the byte count.
fn with_length_prefix(
    out: &mut Vec<u8>,
    body: impl FnOnce(&mut Vec<u8>) -> DbResult<()>,
) -> DbResult<()> {
    let start = out.len();
    out.extend_from_slice(&[0; 4]);
    body(out)?;
    out.push(TERMINATOR);
    let len = u32::try_from(out.len() - start)
        .map_err(|_| DbError::invalid("document is too large to encode"))?;
    out[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn encode_document(doc: &Document, out: &mut Vec<u8>, depth: usize) -> DbResult<()> {
    if depth > MAX_NESTING_DEPTH {
        return Err(DbError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    with_length_prefix(out, |out| {
        for (name, value) in doc.iter() {
            out.push(tag_of(value));
            put_len(out, name.len())?;
            out.extend_from_slice(name.as_bytes());
            encode_payload(value, out, depth)?;
        }
        Ok(())
    })
}

fn encode_payload(value: &Value, out: &mut Vec<u8>, depth: usize) -> DbResult<()> {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Int(v) | Value::DateTime(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Float(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::String(s) => {
            put_len(out, s.len())?;
            out.extend_from_slice(s.as_bytes());
        }
        Value::Binary(bytes) => {
            put_len(out, bytes.len())?;
            out.extend_from_slice(bytes);
        }
        Value::ObjectId(oid) => out.extend_from_slice(&oid.bytes()),
        Value::Document(doc) => encode_document(doc, out, depth + 1)?,
        Value::Array(items) => {
            if depth + 1 > MAX_NESTING_DEPTH {
                return Err(DbError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            with_length_prefix(out, |out| {
                for item in items {
                    out.push(tag_of(item));
                    encode_payload(item, out, depth + 1)?;
                }
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn read_string(reader: &mut ByteReader<'_>) -> DbResult<String> {
    let len = reader.u32()? as usize;
    let bytes = reader.take(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DbError::corrupt("invalid UTF-8 in document"))
}

/// Read a length-prefixed container and return a reader over its body
/// (excluding prefix and terminator).
fn container<'a>(reader: &mut ByteReader<'a>) -> DbResult<ByteReader<'a>> {
    let len = reader.u32()? as usize;
    if len < 5 {
        return Err(DbError::corrupt(format!("container length {len} is too small")));
    }
    let body = reader.take(len - 4)?;
    let (terminator, inner) = body
        .split_last()
        .ok_or_else(|| DbError::corrupt("empty container"))?;
    if *terminator != TERMINATOR {
        return Err(DbError::corrupt("container is missing its terminator"));
    }
    Ok(ByteReader::new(inner))
}

fn decode_document(reader: &mut ByteReader<'_>, depth: usize) -> DbResult<Document> {
    if depth > MAX_NESTING_DEPTH {
        return Err(DbError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    let mut body = container(reader)?;
    let mut doc = Document::new();
    while body.remaining() > 0 {
        let tag = body.u8()?;
        let name = read_string(&mut body)?;
        let value = decode_payload(tag, &mut body, depth)?;
        if doc.insert(name, value).is_some() {
            return Err(DbError::corrupt("duplicate field name in document"));
        }
    }
    Ok(doc)
}

fn decode_payload(tag: u8, reader: &mut ByteReader<'_>, depth: usize) -> DbResult<Value> {
    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => match reader.u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => return Err(DbError::corrupt(format!("invalid bool byte {other}"))),
        },
        TAG_INT => Value::Int(reader.i64()?),
        TAG_DATETIME => Value::DateTime(reader.i64()?),
        TAG_FLOAT => Value::Float(reader.f64()?),
        TAG_STRING => Value::String(read_string(reader)?),
        TAG_BINARY => {
            let len = reader.u32()? as usize;
            Value::Binary(reader.take(len)?.to_vec())
        }
        TAG_OBJECT_ID => {
            let mut bytes = [0u8; 12];
            bytes.copy_from_slice(reader.take(12)?);
            Value::ObjectId(ObjectId::from_bytes(bytes))
        }
        TAG_DOCUMENT => Value::Document(decode_document(reader, depth + 1)?),
        TAG_ARRAY => {
            if depth + 1 > MAX_NESTING_DEPTH {
                return Err(DbError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            let mut body = container(reader)?;
            let mut items = Vec::new();
            while body.remaining() > 0 {
                let tag = body.u8()?;
                items.push(decode_payload(tag, &mut body, depth + 1)?);
            }
            Value::Array(items)
        }
        other => return Err(DbError::corrupt(format!("unknown value tag {other:#04x}"))),
    };
    Ok(value)
}

/// Skip one payload without materializing it.
fn skip_payload(tag: u8, reader: &mut ByteReader<'_>) -> DbResult<()> {
    match tag {
        TAG_NULL => Ok(()),
        TAG_BOOL => reader.skip(1),
        TAG_INT | TAG_DATETIME | TAG_FLOAT => reader.skip(8),
        TAG_OBJECT_ID => reader.skip(12),
        TAG_STRING | TAG_BINARY => {
            let len = reader.u32()? as usize;
            reader.skip(len)
        }
        TAG_DOCUMENT | TAG_ARRAY => {
            let len = reader.u32()? as usize;
            if len < 5 {
                return Err(DbError::corrupt(format!("container length {len} is too small")));
            }
            reader.skip(len - 4)
        }
        other => Err(DbError::corrupt(format!("unknown value tag {other:#04x}"))),
    }
}

/// Read one (possibly dotted) field from an encoded document, skipping
/// unrelated values by their length prefixes. Numeric path segments index
/// into arrays.
pub fn extract_field(bytes: &[u8], path: &str) -> DbResult<Option<Value>> {
    let mut reader = ByteReader::new(bytes);
    let mut segments = path.split('.').peekable();
    let mut body = container(&mut reader)?;
    let mut in_array = false;
    let mut depth = 1;

    while let Some(segment) = segments.next() {
        let found_tag = if in_array {
            let Ok(index) = segment.parse::<usize>() else {
                return Ok(None);
            };
            let mut found = None;
            let mut position = 0;
            while body.remaining() > 0 {
                let tag = body.u8()?;
                if position == index {
                    found = Some(tag);
                    break;
                }
                skip_payload(tag, &mut body)?;
                position += 1;
            }
            found
        } else {
            let mut found = None;
            while body.remaining() > 0 {
                let tag = body.u8()?;
                let name_len = body.u32()? as usize;
                let name = body.take(name_len)?;
                if name == segment.as_bytes() {
                    found = Some(tag);
                    break;
                }
                skip_payload(tag, &mut body)?;
            }
            found
        };

        let Some(tag) = found_tag else {
            return Ok(None);
        };
        if segments.peek().is_none() {
            return decode_payload(tag, &mut body, depth).map(Some);
        }
        match tag {
            TAG_DOCUMENT => in_array = false,
            TAG_ARRAY => in_array = true,
            _ => return Ok(None),
        }
        body = container(&mut body)?;
        depth += 1;
    }
    Ok(None)
}
