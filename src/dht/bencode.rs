//! Bencode encoding and decoding for the KRPC wire format.
//!
//! The DHT is the only part of the crate that speaks bencode, so the
//! codec lives here rather than as a general-purpose module. Decoding is
//! strict: depth-capped, no trailing data, canonical dictionary order is
//! produced on encode (keys are held in a `BTreeMap`).

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidLength,

    #[error("unexpected byte {0:#04x} at offset {1}")]
    UnexpectedByte(u8, usize),

    #[error("nesting too deep")]
    NestingTooDeep,

    #[error("trailing data after value")]
    TrailingData,
}

/// A bencode value: integer, byte string, list, or dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for non-dicts and missing keys.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

/// Encodes a value into its canonical bencode bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, val) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

/// Decodes exactly one bencode value from `data`.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos, 0)?;
    if pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

fn decode_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::NestingTooDeep);
    }
    let &first = data.get(*pos).ok_or(BencodeError::UnexpectedEof)?;

    match first {
        b'i' => decode_integer(data, pos),
        b'l' => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match data.get(*pos) {
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Value::List(items));
                    }
                    Some(_) => items.push(decode_value(data, pos, depth + 1)?),
                    None => return Err(BencodeError::UnexpectedEof),
                }
            }
        }
        b'd' => {
            *pos += 1;
            let mut dict = BTreeMap::new();
            loop {
                match data.get(*pos) {
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Value::Dict(dict));
                    }
                    Some(_) => {
                        let key = decode_string(data, pos)?;
                        let value = decode_value(data, pos, depth + 1)?;
                        dict.insert(key, value);
                    }
                    None => return Err(BencodeError::UnexpectedEof),
                }
            }
        }
        b'0'..=b'9' => Ok(Value::Bytes(decode_string(data, pos)?)),
        other => Err(BencodeError::UnexpectedByte(other, *pos)),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    *pos += 1; // 'i'
    let start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let text = std::str::from_utf8(&data[start..*pos]).map_err(|_| BencodeError::InvalidInteger)?;
    if text.is_empty() || text == "-" || (text.len() > 1 && text.starts_with('0')) {
        return Err(BencodeError::InvalidInteger);
    }
    let n: i64 = text.parse().map_err(|_| BencodeError::InvalidInteger)?;

    *pos += 1; // 'e'
    Ok(Value::Integer(n))
}

fn decode_string(data: &[u8], pos: &mut usize) -> Result<Bytes, BencodeError> {
    let start = *pos;
    while *pos < data.len() && data[*pos].is_ascii_digit() {
        *pos += 1;
    }
    if *pos == start {
        return Err(BencodeError::InvalidLength);
    }
    if data.get(*pos) != Some(&b':') {
        return Err(BencodeError::InvalidLength);
    }

    let len: usize = std::str::from_utf8(&data[start..*pos])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidLength)?;
    *pos += 1; // ':'

    if *pos + len > data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let bytes = Bytes::copy_from_slice(&data[*pos..*pos + len]);
    *pos += len;
    Ok(bytes)
}
