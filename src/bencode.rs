//! Bencode codec (BEP-3) for KRPC datagrams.
//!
//! Bencode has four data types: integers, byte strings, lists, and
//! dictionaries. KRPC messages are always a single dictionary, so the
//! decoder enforces datagram-friendly limits: a nesting cap and no
//! trailing bytes after the value.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

/// Dictionaries keep their keys sorted, which is what the canonical
/// bencode encoding requires.
pub type Dict = BTreeMap<Bytes, Value>;

const MAX_DEPTH: usize = 32;

/// Errors produced while decoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("input ended mid-value")]
    Truncated,

    #[error("invalid integer")]
    BadInteger,

    #[error("invalid string length prefix")]
    BadLength,

    #[error("dictionary key is not a byte string")]
    BadKey,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("trailing bytes after value")]
    Trailing,
}

/// A bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    /// Byte-string value from anything byte-like.
    pub fn bytes(b: impl AsRef<[u8]>) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b.as_ref()))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
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

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` when the value is not a dictionary or
    /// the key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

/// Decodes exactly one bencode value from `buf`.
///
/// # Errors
///
/// Fails on truncated or syntactically invalid input, on nesting deeper
/// than 32 levels, and on trailing bytes after the value.
pub fn decode(buf: &[u8]) -> Result<Value, BencodeError> {
    let mut cursor = Cursor { buf, pos: 0 };
    let value = cursor.value(0)?;
    if cursor.pos != buf.len() {
        return Err(BencodeError::Trailing);
    }
    Ok(value)
}

/// Encodes a value into its canonical bencode form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
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

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.buf.get(self.pos).copied().ok_or(BencodeError::Truncated)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        self.pos += 1;

        // "i-0e", "i03e" and friends are not canonical bencode.
        let canonical = match digits {
            b"" | b"-" | b"-0" => false,
            [b'0', _, ..] => false,
            [b'-', b'0', ..] => false,
            _ => true,
        };
        if !canonical {
            return Err(BencodeError::BadInteger);
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Value::Int)
            .ok_or(BencodeError::BadInteger)
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.buf[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::BadLength)?;
        self.pos += 1;

        let end = self.pos.checked_add(len).ok_or(BencodeError::BadLength)?;
        if end > self.buf.len() {
            return Err(BencodeError::Truncated);
        }
        let bytes = Bytes::copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = Dict::new();
        while self.peek()? != b'e' {
            let key = match self.peek()? {
                b'0'..=b'9' => self.byte_string()?,
                _ => return Err(BencodeError::BadKey),
            };
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_integer() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn decode_rejects_non_canonical_integers() {
        assert!(matches!(decode(b"i007e"), Err(BencodeError::BadInteger)));
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::BadInteger)));
        assert!(matches!(decode(b"ie"), Err(BencodeError::BadInteger)));
    }

    #[test]
    fn decode_byte_string() {
        let v = decode(b"5:hello").unwrap();
        assert_eq!(v.as_str(), Some("hello"));
        assert_eq!(decode(b"0:").unwrap(), Value::bytes(b""));
    }

    #[test]
    fn decode_list_and_dict() {
        let v = decode(b"li1ei2ee").unwrap();
        assert_eq!(v.as_list().map(<[Value]>::len), Some(2));

        let v = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(v.get(b"cow").and_then(Value::as_str), Some("moo"));
        assert_eq!(v.get(b"spam").and_then(Value::as_str), Some("eggs"));
    }

    #[test]
    fn decode_rejects_truncated_input() {
        assert!(matches!(decode(b"i42"), Err(BencodeError::Truncated)));
        assert!(matches!(decode(b"5:hi"), Err(BencodeError::Truncated)));
        assert!(matches!(decode(b"li1e"), Err(BencodeError::Truncated)));
        assert!(matches!(decode(b""), Err(BencodeError::Truncated)));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        assert!(matches!(decode(b"i42ei2e"), Err(BencodeError::Trailing)));
    }

    #[test]
    fn decode_rejects_non_string_keys() {
        assert!(matches!(decode(b"di1ei2ee"), Err(BencodeError::BadKey)));
    }

    #[test]
    fn decode_rejects_deep_nesting() {
        let mut hostile = vec![b'l'; 64];
        hostile.extend(vec![b'e'; 64]);
        assert!(matches!(decode(&hostile), Err(BencodeError::TooDeep)));
    }

    #[test]
    fn encode_matches_canonical_form() {
        let mut dict = Dict::new();
        dict.insert(Bytes::from_static(b"b"), Value::Int(2));
        dict.insert(Bytes::from_static(b"a"), Value::bytes(b"x"));
        // keys come out sorted regardless of insertion order
        assert_eq!(encode(&Value::Dict(dict)), b"d1:a1:x1:bi2ee".to_vec());
    }

    #[test]
    fn roundtrip_nested() {
        let original = decode(b"d4:listli1e3:twoe3:inti-9ee").unwrap();
        assert_eq!(decode(&encode(&original)).unwrap(), original);
    }
}
