//! Attribute values and change events.

use super::Oid;
use crate::protocol::ProtocolError;
use std::fmt;

/// Typed value stored in an attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

const VALUE_NONE: u8 = 0x00;
const VALUE_BOOL: u8 = 0x01;
const VALUE_INTEGER: u8 = 0x02;
const VALUE_DOUBLE: u8 = 0x03;
const VALUE_TEXT: u8 = 0x04;
const VALUE_BYTES: u8 = 0x05;

impl AttributeValue {
    fn type_byte(&self) -> u8 {
        match self {
            AttributeValue::Bool(_) => VALUE_BOOL,
            AttributeValue::Integer(_) => VALUE_INTEGER,
            AttributeValue::Double(_) => VALUE_DOUBLE,
            AttributeValue::Text(_) => VALUE_TEXT,
            AttributeValue::Bytes(_) => VALUE_BYTES,
        }
    }

    /// Append the wire form of an optional value (`[type:1][data]`).
    ///
    /// Text and bytes carry a 4-byte LE length prefix; an absent value is
    /// the single type byte 0x00.
    pub fn encode_opt(value: Option<&AttributeValue>, buf: &mut Vec<u8>) {
        let Some(value) = value else {
            buf.push(VALUE_NONE);
            return;
        };
        buf.push(value.type_byte());
        match value {
            AttributeValue::Bool(b) => buf.push(u8::from(*b)),
            AttributeValue::Integer(i) => buf.extend_from_slice(&i.to_le_bytes()),
            AttributeValue::Double(d) => buf.extend_from_slice(&d.to_bits().to_le_bytes()),
            AttributeValue::Text(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            AttributeValue::Bytes(b) => {
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
        }
    }

    /// Decode an optional value from the start of `data`, returning the
    /// value and bytes consumed.
    pub fn decode_opt(data: &[u8]) -> Result<(Option<AttributeValue>, usize), ProtocolError> {
        let mut r = crate::protocol::Reader::new(data);
        let type_byte = r.u8()?;
        let value = match type_byte {
            VALUE_NONE => None,
            VALUE_BOOL => Some(AttributeValue::Bool(r.u8()? != 0)),
            VALUE_INTEGER => Some(AttributeValue::Integer(r.u64()? as i64)),
            VALUE_DOUBLE => Some(AttributeValue::Double(f64::from_bits(r.u64()?))),
            VALUE_TEXT => {
                let len = r.u32()? as usize;
                let bytes = r.take(len)?;
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|_| ProtocolError::Malformed("text value is not UTF-8".into()))?;
                Some(AttributeValue::Text(text))
            }
            VALUE_BYTES => {
                let len = r.u32()? as usize;
                Some(AttributeValue::Bytes(r.take(len)?.to_vec()))
            }
            other => return Err(ProtocolError::InvalidValueType(other)),
        };
        Ok((value, data.len() - r.remaining()))
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Integer(i) => write!(f, "{}", i),
            AttributeValue::Double(d) => write!(f, "{}", d),
            AttributeValue::Text(s) => write!(f, "{:?}", s),
            AttributeValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Double(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(v: Vec<u8>) -> Self {
        AttributeValue::Bytes(v)
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// Kind of structural or value change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChangeKind {
    /// An attribute's value changed.
    ValueChanged = 0x01,
    /// A collection member was added.
    Added = 0x02,
    /// A collection member was removed.
    Removed = 0x03,
}

impl ChangeKind {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(ChangeKind::ValueChanged),
            0x02 => Some(ChangeKind::Added),
            0x03 => Some(ChangeKind::Removed),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::ValueChanged => "VALUE_CHANGED",
            ChangeKind::Added => "ADDED",
            ChangeKind::Removed => "REMOVED",
        };
        write!(f, "{}", name)
    }
}

/// One change observed in the state tree.
///
/// ## Wire Format
///
/// | Offset | Field        | Size     |
/// |--------|--------------|----------|
/// | 0      | kind         | 1 byte   |
/// | 1      | revision     | 8 bytes  |
/// | 9      | timestamp_ms | 8 bytes  |
/// | 17     | oid          | variable |
/// | ...    | value        | variable |
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    /// Node that changed.
    pub oid: Oid,
    /// What happened.
    pub kind: ChangeKind,
    /// New value (value changes only).
    pub value: Option<AttributeValue>,
    /// Attribute revision after the change; 0 for structural changes.
    pub revision: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl ChangeEvent {
    /// Encode to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(self.kind.to_byte());
        buf.extend_from_slice(&self.revision.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        self.oid.encode_into(&mut buf);
        AttributeValue::encode_opt(self.value.as_ref(), &mut buf);
        buf
    }

    /// Decode from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = crate::protocol::Reader::new(data);
        let kind_byte = r.u8()?;
        let kind = ChangeKind::from_byte(kind_byte)
            .ok_or_else(|| ProtocolError::Malformed(format!("change kind 0x{:02x}", kind_byte)))?;
        let revision = r.u64()?;
        let timestamp_ms = r.u64()?;
        let rest = r.rest();
        let (oid, used) = Oid::decode(rest)?;
        let (value, _) = AttributeValue::decode_opt(&rest[used..])?;
        Ok(Self {
            oid,
            kind,
            value,
            revision,
            timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_codec_consumes_exactly() {
        let mut buf = Vec::new();
        AttributeValue::encode_opt(Some(&AttributeValue::Text("eth0".into())), &mut buf);
        AttributeValue::encode_opt(None, &mut buf);
        let (first, used) = AttributeValue::decode_opt(&buf).unwrap();
        assert_eq!(first, Some(AttributeValue::Text("eth0".into())));
        assert_eq!(used, 1 + 4 + 4);
        let (second, used2) = AttributeValue::decode_opt(&buf[used..]).unwrap();
        assert_eq!(second, None);
        assert_eq!(used2, 1);
    }

    #[test]
    fn test_value_negative_integer_and_double() {
        for value in [AttributeValue::Integer(-42), AttributeValue::Double(0.25)] {
            let mut buf = Vec::new();
            AttributeValue::encode_opt(Some(&value), &mut buf);
            assert_eq!(buf.len(), 9);
            assert_eq!(AttributeValue::decode_opt(&buf).unwrap().0, Some(value));
        }
    }

    #[test]
    fn test_value_unknown_type() {
        assert!(matches!(
            AttributeValue::decode_opt(&[0x7F]),
            Err(ProtocolError::InvalidValueType(0x7F))
        ));
    }

    #[test]
    fn test_change_event_codec() {
        let event = ChangeEvent {
            oid: Oid::from([1000, 1, 3]),
            kind: ChangeKind::ValueChanged,
            value: Some(AttributeValue::Integer(42)),
            revision: 1,
            timestamp_ms: 1_700_000_000_000,
        };
        assert_eq!(ChangeEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn test_change_event_bad_kind() {
        let mut bytes = ChangeEvent {
            oid: Oid::root(),
            kind: ChangeKind::Added,
            value: None,
            revision: 0,
            timestamp_ms: 0,
        }
        .encode();
        bytes[0] = 0x09;
        assert!(ChangeEvent::decode(&bytes).is_err());
    }
}
