//! The subset of AMF0 (Action Message Format v0) used by RTMP commands
//! and `onMetaData` script tags: number, boolean, string, object, null,
//! ECMA array and strict array.

use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use derive_more::{Display, From};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0a;

pub const SET_DATA_FRAME: &str = "@setDataFrame";

#[derive(Debug, Display, From)]
pub enum Amf0Error {
    #[display(fmt = "amf0: unexpected eof")]
    Io(io::Error),
    #[display(fmt = "amf0: unsupported type marker {_0:#x}")]
    UnsupportedMarker(u8),
    #[display(fmt = "amf0: malformed object (missing terminator)")]
    MalformedObject,
}

impl std::error::Error for Amf0Error {}

pub type Object = Vec<(String, Value)>;

/// A decoded AMF0 value. `Object` preserves insertion order, which is
/// immaterial to the protocol but keeps encode(decode(x)) == x for tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Object),
    Null,
    EcmaArray(Object),
    StrictArray(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) | Value::EcmaArray(o) => Some(o),
            _ => None,
        }
    }

    pub fn object_get<'a>(obj: &'a Object, key: &str) -> Option<&'a Value> {
        obj.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Encode a single value in AMF0 wire format.
pub fn encode_value(out: &mut BytesMut, value: &Value) -> Result<(), Amf0Error> {
    let mut w = out.writer();
    encode_value_to(&mut w, value)
}

fn encode_value_to<W: io::Write>(w: &mut W, value: &Value) -> Result<(), Amf0Error> {
    match value {
        Value::Number(n) => {
            w.write_u8(MARKER_NUMBER)?;
            w.write_f64::<BigEndian>(*n)?;
        }
        Value::Boolean(b) => {
            w.write_u8(MARKER_BOOLEAN)?;
            w.write_u8(if *b { 1 } else { 0 })?;
        }
        Value::String(s) => {
            w.write_u8(MARKER_STRING)?;
            encode_utf8(w, s)?;
        }
        Value::Object(pairs) => {
            w.write_u8(MARKER_OBJECT)?;
            encode_object_body(w, pairs)?;
        }
        Value::Null => {
            w.write_u8(MARKER_NULL)?;
        }
        Value::EcmaArray(pairs) => {
            w.write_u8(MARKER_ECMA_ARRAY)?;
            w.write_u32::<BigEndian>(pairs.len() as u32)?;
            encode_object_body(w, pairs)?;
        }
        Value::StrictArray(values) => {
            w.write_u8(MARKER_STRICT_ARRAY)?;
            w.write_u32::<BigEndian>(values.len() as u32)?;
            for v in values {
                encode_value_to(w, v)?;
            }
        }
    }
    Ok(())
}

fn encode_utf8<W: io::Write>(w: &mut W, s: &str) -> Result<(), Amf0Error> {
    w.write_u16::<BigEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn encode_object_body<W: io::Write>(w: &mut W, pairs: &Object) -> Result<(), Amf0Error> {
    for (key, value) in pairs {
        w.write_u16::<BigEndian>(key.len() as u16)?;
        w.write_all(key.as_bytes())?;
        encode_value_to(w, value)?;
    }
    w.write_u16::<BigEndian>(0)?;
    w.write_u8(MARKER_OBJECT_END)?;
    Ok(())
}

/// Encode a full command (e.g. `["connect", 1.0, {...}]`) into one AMF0 byte buffer.
pub fn encode_command(values: &[Value]) -> Result<Bytes, Amf0Error> {
    let mut out = BytesMut::new();
    for value in values {
        encode_value(&mut out, value)?;
    }
    Ok(out.freeze())
}

/// Decode one AMF0 value from `r`.
pub fn decode_value<R: Read>(r: &mut R) -> Result<Value, Amf0Error> {
    let marker = r.read_u8()?;
    decode_value_with_marker(r, marker)
}

fn decode_value_with_marker<R: Read>(r: &mut R, marker: u8) -> Result<Value, Amf0Error> {
    match marker {
        MARKER_NUMBER => Ok(Value::Number(r.read_f64::<BigEndian>()?)),
        MARKER_BOOLEAN => Ok(Value::Boolean(r.read_u8()? != 0)),
        MARKER_STRING => Ok(Value::String(decode_utf8(r)?)),
        MARKER_OBJECT => Ok(Value::Object(decode_object_body(r)?)),
        MARKER_NULL => Ok(Value::Null),
        MARKER_ECMA_ARRAY => {
            let _count = r.read_u32::<BigEndian>()?;
            Ok(Value::EcmaArray(decode_object_body(r)?))
        }
        MARKER_STRICT_ARRAY => {
            let count = r.read_u32::<BigEndian>()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(decode_value(r)?);
            }
            Ok(Value::StrictArray(values))
        }
        other => Err(Amf0Error::UnsupportedMarker(other)),
    }
}

fn decode_utf8<R: Read>(r: &mut R) -> Result<String, Amf0Error> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn decode_object_body<R: Read>(r: &mut R) -> Result<Object, Amf0Error> {
    let mut pairs = Vec::new();
    loop {
        let key_len = r.read_u16::<BigEndian>()?;
        if key_len == 0 {
            let marker = r.read_u8()?;
            if marker != MARKER_OBJECT_END {
                return Err(Amf0Error::MalformedObject);
            }
            return Ok(pairs);
        }
        let mut key_buf = vec![0u8; key_len as usize];
        r.read_exact(&mut key_buf)?;
        let key = String::from_utf8_lossy(&key_buf).into_owned();
        let value = decode_value(r)?;
        pairs.push((key, value));
    }
}

/// Decode values from `r` until EOF or an unrecognised type marker, which
/// is propagated as an error (matching the AMF0 command batch framing,
/// where a command message is just a back-to-back sequence of values).
pub fn decode_batch<R: Read>(r: &mut R) -> Result<Vec<Value>, Amf0Error> {
    let mut values = Vec::new();
    loop {
        let marker = match r.read_u8() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        values.push(decode_value_with_marker(r, marker)?);
    }
    Ok(values)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaDataMode {
    Add,
    Del,
}

/// Parse `data` as an AMF0 stream and, depending on `mode`, strip a
/// leading `"@setDataFrame"` string (Del) or prepend one (Add),
/// re-encoding the result.
pub fn reform_metadata(data: &[u8], mode: MetaDataMode) -> Result<Bytes, Amf0Error> {
    let mut cursor = io::Cursor::new(data);
    let values = decode_batch(&mut cursor)?;

    let mut values = values;
    let has_marker = matches!(values.first(), Some(Value::String(s)) if s == SET_DATA_FRAME);

    match mode {
        MetaDataMode::Del => {
            if has_marker {
                values.remove(0);
            }
        }
        MetaDataMode::Add => {
            if !has_marker {
                values.insert(0, Value::String(SET_DATA_FRAME.to_owned()));
            }
        }
    }

    encode_command(&values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_connect_command() {
        let values = vec![
            Value::from("connect"),
            Value::from(1.0),
            Value::Object(vec![
                ("app".to_owned(), Value::from("live")),
                ("tcUrl".to_owned(), Value::from("rtmp://h/live")),
            ]),
        ];

        let encoded = encode_command(&values).unwrap();
        let mut cursor = io::Cursor::new(&encoded[..]);
        let decoded = decode_batch(&mut cursor).unwrap();

        assert_eq!(decoded, values);
    }

    #[test]
    fn strips_and_adds_set_data_frame() {
        let values = vec![Value::from("@setDataFrame"), Value::from("onMetaData")];
        let encoded = encode_command(&values).unwrap();

        let stripped = reform_metadata(&encoded, MetaDataMode::Del).unwrap();
        let mut cursor = io::Cursor::new(&stripped[..]);
        let decoded = decode_batch(&mut cursor).unwrap();
        assert_eq!(decoded, vec![Value::from("onMetaData")]);

        let readded = reform_metadata(&stripped, MetaDataMode::Add).unwrap();
        let mut cursor = io::Cursor::new(&readded[..]);
        let decoded = decode_batch(&mut cursor).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn decode_batch_rejects_unknown_marker() {
        let bytes = [0x00u8, 0, 0, 0, 0, 0, 0, 0, 0, 0xff];
        let mut cursor = io::Cursor::new(&bytes[..]);
        assert!(decode_batch(&mut cursor).is_err());
    }
}
