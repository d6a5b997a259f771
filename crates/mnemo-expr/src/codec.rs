//! Tag-based codec for values and field rows.
//!
//! The encoding is self-describing: every value carries a one-byte tag, and
//! rows carry field names, so a row can be decoded without the class
//! definition at hand. The same encoding doubles as the canonical byte form
//! used for identity keys, set canonicalization, and state fingerprints.

use crate::error::Error;
use crate::value::{BigInt, Decimal, Value};

/// A decoded field row: name/value pairs in storage order.
pub type Row = Vec<(String, Value)>;

/// Type tag for encoded values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Null = 0,
    Bool = 1,
    Int = 2,
    BigInt = 3,
    Float = 4,
    Decimal = 5,
    Str = 6,
    Bytes = 7,
    Date = 8,
    Time = 9,
    DateTime = 10,
    Duration = 11,
    List = 12,
    Set = 13,
    Map = 14,
    Opaque = 15,
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Tag::Null),
            1 => Ok(Tag::Bool),
            2 => Ok(Tag::Int),
            3 => Ok(Tag::BigInt),
            4 => Ok(Tag::Float),
            5 => Ok(Tag::Decimal),
            6 => Ok(Tag::Str),
            7 => Ok(Tag::Bytes),
            8 => Ok(Tag::Date),
            9 => Ok(Tag::Time),
            10 => Ok(Tag::DateTime),
            11 => Ok(Tag::Duration),
            12 => Ok(Tag::List),
            13 => Ok(Tag::Set),
            14 => Ok(Tag::Map),
            15 => Ok(Tag::Opaque),
            other => Err(Error::UnknownTag(other)),
        }
    }
}

/// Encode one value into `buf`.
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(Tag::Null as u8),
        Value::Bool(b) => {
            buf.push(Tag::Bool as u8);
            buf.push(u8::from(*b));
        }
        Value::Int(i) => {
            buf.push(Tag::Int as u8);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        Value::BigInt(b) => {
            buf.push(Tag::BigInt as u8);
            buf.push(u8::from(b.is_negative()));
            write_bytes(buf, b.magnitude());
        }
        Value::Float(f) => {
            buf.push(Tag::Float as u8);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::Decimal(d) => {
            buf.push(Tag::Decimal as u8);
            buf.extend_from_slice(&d.unscaled.to_le_bytes());
            buf.push(d.scale);
        }
        Value::Str(s) => {
            buf.push(Tag::Str as u8);
            write_bytes(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(Tag::Bytes as u8);
            write_bytes(buf, b);
        }
        Value::Date(d) => {
            buf.push(Tag::Date as u8);
            buf.extend_from_slice(&d.to_le_bytes());
        }
        Value::Time(t) => {
            buf.push(Tag::Time as u8);
            buf.extend_from_slice(&t.to_le_bytes());
        }
        Value::DateTime(t) => {
            buf.push(Tag::DateTime as u8);
            buf.extend_from_slice(&t.to_le_bytes());
        }
        Value::Duration(d) => {
            buf.push(Tag::Duration as u8);
            buf.extend_from_slice(&d.to_le_bytes());
        }
        Value::List(items) => {
            buf.push(Tag::List as u8);
            write_seq(buf, items);
        }
        Value::Set(items) => {
            buf.push(Tag::Set as u8);
            write_seq(buf, items);
        }
        Value::Map(entries) => {
            buf.push(Tag::Map as u8);
            buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (key, value) in entries {
                write_name(buf, key);
                encode_value(buf, value);
            }
        }
        Value::Opaque(b) => {
            buf.push(Tag::Opaque as u8);
            write_bytes(buf, b);
        }
    }
}

/// Encode one value into a fresh buffer.
pub fn encode_single(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(&mut buf, value);
    buf
}

/// Decode one value from `data`, returning the value and bytes consumed.
pub fn decode_value(data: &[u8]) -> Result<(Value, usize), Error> {
    let tag = Tag::try_from(*data.first().ok_or_else(short)?)?;
    let mut cursor = 1;
    let value = match tag {
        Tag::Null => Value::Null,
        Tag::Bool => {
            let b = *data.get(cursor).ok_or_else(short)?;
            cursor += 1;
            Value::Bool(b != 0)
        }
        Tag::Int => Value::Int(read_i64(data, &mut cursor)?),
        Tag::BigInt => {
            let negative = *data.get(cursor).ok_or_else(short)? != 0;
            cursor += 1;
            let magnitude = read_bytes(data, &mut cursor)?;
            Value::BigInt(BigInt::new(negative, magnitude))
        }
        Tag::Float => {
            let raw = read_array::<8>(data, &mut cursor)?;
            Value::Float(f64::from_le_bytes(raw))
        }
        Tag::Decimal => {
            let unscaled = read_i64(data, &mut cursor)?;
            let scale = *data.get(cursor).ok_or_else(short)?;
            cursor += 1;
            Value::Decimal(Decimal::new(unscaled, scale))
        }
        Tag::Str => {
            let bytes = read_bytes(data, &mut cursor)?;
            let s = String::from_utf8(bytes)
                .map_err(|_| Error::InvalidEncoding("invalid utf-8 in string value".into()))?;
            Value::Str(s)
        }
        Tag::Bytes => Value::Bytes(read_bytes(data, &mut cursor)?),
        Tag::Date => {
            let raw = read_array::<4>(data, &mut cursor)?;
            Value::Date(i32::from_le_bytes(raw))
        }
        Tag::Time => Value::Time(read_i64(data, &mut cursor)?),
        Tag::DateTime => Value::DateTime(read_i64(data, &mut cursor)?),
        Tag::Duration => Value::Duration(read_i64(data, &mut cursor)?),
        Tag::List => Value::List(read_seq(data, &mut cursor)?),
        Tag::Set => Value::Set(read_seq(data, &mut cursor)?),
        Tag::Map => {
            let count = read_u32(data, &mut cursor)? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key = read_name(data, &mut cursor)?;
                let (value, used) = decode_value(&data[cursor..])?;
                cursor += used;
                entries.push((key, value));
            }
            Value::Map(entries)
        }
        Tag::Opaque => Value::Opaque(read_bytes(data, &mut cursor)?),
    };
    Ok((value, cursor))
}

/// Encode a field row.
///
/// Format: field count (4 bytes LE), then per field a name (2-byte LE length
/// + UTF-8 bytes) and a tagged value.
pub fn encode_row(row: &Row) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(row.len() as u32).to_le_bytes());
    for (name, value) in row {
        write_name(&mut buf, name);
        encode_value(&mut buf, value);
    }
    buf
}

/// Decode a field row.
pub fn decode_row(data: &[u8]) -> Result<Row, Error> {
    let mut cursor = 0;
    let count = read_u32(data, &mut cursor)? as usize;
    let mut row = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let name = read_name(data, &mut cursor)?;
        let (value, used) = decode_value(&data[cursor..])?;
        cursor += used;
        row.push((name, value));
    }
    if cursor != data.len() {
        return Err(Error::InvalidEncoding("trailing bytes after row".into()));
    }
    Ok(row)
}

/// Encode a value sequence, e.g. an identity tuple, as key bytes.
pub fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        encode_value(&mut buf, value);
    }
    buf
}

/// Decode a value sequence produced by [`encode_values`].
pub fn decode_values(data: &[u8]) -> Result<Vec<Value>, Error> {
    let mut cursor = 0;
    let count = read_u32(data, &mut cursor)? as usize;
    let mut values = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (value, used) = decode_value(&data[cursor..])?;
        cursor += used;
        values.push(value);
    }
    if cursor != data.len() {
        return Err(Error::InvalidEncoding("trailing bytes after values".into()));
    }
    Ok(values)
}

/// Look up a field value in a row by name.
pub fn get_field<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    row.iter()
        .find(|(field, _)| field == name)
        .map(|(_, value)| value)
}

fn short() -> Error {
    Error::InvalidEncoding("unexpected end of input".into())
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn write_name(buf: &mut Vec<u8>, name: &str) {
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
}

fn write_seq(buf: &mut Vec<u8>, items: &[Value]) {
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        encode_value(buf, item);
    }
}

fn read_seq(data: &[u8], cursor: &mut usize) -> Result<Vec<Value>, Error> {
    let count = read_u32(data, cursor)? as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (value, used) = decode_value(&data[*cursor..])?;
        *cursor += used;
        items.push(value);
    }
    Ok(items)
}

fn read_array<const N: usize>(data: &[u8], cursor: &mut usize) -> Result<[u8; N], Error> {
    let end = cursor.checked_add(N).ok_or_else(short)?;
    let slice = data.get(*cursor..end).ok_or_else(short)?;
    *cursor = end;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn read_i64(data: &[u8], cursor: &mut usize) -> Result<i64, Error> {
    Ok(i64::from_le_bytes(read_array::<8>(data, cursor)?))
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32, Error> {
    Ok(u32::from_le_bytes(read_array::<4>(data, cursor)?))
}

fn read_bytes(data: &[u8], cursor: &mut usize) -> Result<Vec<u8>, Error> {
    let len = read_u32(data, cursor)? as usize;
    let end = cursor.checked_add(len).ok_or_else(short)?;
    let slice = data.get(*cursor..end).ok_or_else(short)?;
    *cursor = end;
    Ok(slice.to_vec())
}

fn read_name(data: &[u8], cursor: &mut usize) -> Result<String, Error> {
    let len = {
        let raw = read_array::<2>(data, cursor)?;
        u16::from_le_bytes(raw) as usize
    };
    let end = cursor.checked_add(len).ok_or_else(short)?;
    let slice = data.get(*cursor..end).ok_or_else(short)?;
    *cursor = end;
    String::from_utf8(slice.to_vec())
        .map_err(|_| Error::InvalidEncoding("invalid utf-8 in field name".into()))
}
