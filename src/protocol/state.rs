//! Payloads of the core stream and state capabilities.

use super::wire::Reader;
use super::ProtocolError;
use crate::state::{AttributeSnapshot, AttributeValue, Oid};

/// STREAM_OPEN request: `[sink_id:4][oid]`.
///
/// The sink id is chosen by the subscriber before the request is sent and
/// is echoed in every event envelope of the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOpen {
    pub sink_id: u32,
    pub prefix: Oid,
}

impl StreamOpen {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.prefix.len() * 4);
        buf.extend_from_slice(&self.sink_id.to_le_bytes());
        self.prefix.encode_into(&mut buf);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let sink_id = r.u32()?;
        let (prefix, _) = Oid::decode(r.rest())?;
        Ok(Self { sink_id, prefix })
    }
}

/// STREAM_OPENED response and STREAM_CLOSE request: `[stream_id:4]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRef {
    pub stream_id: u32,
}

impl StreamRef {
    pub fn encode(&self) -> Vec<u8> {
        self.stream_id.to_le_bytes().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let stream_id = Reader::new(payload).u32()?;
        Ok(Self { stream_id })
    }
}

/// STATE_VALUE response: `[found:1][revision:8][modified_ms:8][value]`.
#[derive(Clone, Debug, PartialEq)]
pub struct StateValue {
    /// `None` if the attribute does not exist.
    pub snapshot: Option<AttributeSnapshot>,
}

impl StateValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18);
        match &self.snapshot {
            None => buf.push(0),
            Some(s) => {
                buf.push(1);
                buf.extend_from_slice(&s.revision.to_le_bytes());
                buf.extend_from_slice(&s.modified_ms.to_le_bytes());
                AttributeValue::encode_opt(s.value.as_ref(), &mut buf);
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        if r.u8()? == 0 {
            return Ok(Self { snapshot: None });
        }
        let revision = r.u64()?;
        let modified_ms = r.u64()?;
        let (value, _) = AttributeValue::decode_opt(r.rest())?;
        Ok(Self {
            snapshot: Some(AttributeSnapshot {
                value,
                revision,
                modified_ms,
            }),
        })
    }
}

/// STATE_SNAPSHOT request: `[prefix][count:2][oid]*`.
///
/// An empty whitelist copies the whole subtree. Otherwise only attributes
/// at or beneath a whitelisted OID are copied; every whitelisted OID must
/// lie under the prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub prefix: Oid,
    pub whitelist: Vec<Oid>,
}

impl SnapshotRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.prefix.len() * 4);
        self.prefix.encode_into(&mut buf);
        buf.extend_from_slice(&(self.whitelist.len() as u16).to_le_bytes());
        for oid in &self.whitelist {
            oid.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let prefix = read_oid(&mut r)?;
        let count = r.u16()?;
        let whitelist = (0..count)
            .map(|_| read_oid(&mut r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { prefix, whitelist })
    }
}

/// STATE_SUBTREE response: `[count:4]([oid][revision:8][modified_ms:8][value])*`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Subtree {
    pub entries: Vec<(Oid, AttributeSnapshot)>,
}

impl Subtree {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (oid, snapshot) in &self.entries {
            oid.encode_into(&mut buf);
            buf.extend_from_slice(&snapshot.revision.to_le_bytes());
            buf.extend_from_slice(&snapshot.modified_ms.to_le_bytes());
            AttributeValue::encode_opt(snapshot.value.as_ref(), &mut buf);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let count = r.u32()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let oid = read_oid(&mut r)?;
            let revision = r.u64()?;
            let modified_ms = r.u64()?;
            let (value, used) = AttributeValue::decode_opt(r.peek_rest())?;
            r.take(used)?;
            entries.push((
                oid,
                AttributeSnapshot {
                    value,
                    revision,
                    modified_ms,
                },
            ));
        }
        Ok(Self { entries })
    }
}

fn read_oid(r: &mut Reader<'_>) -> Result<Oid, ProtocolError> {
    let (oid, used) = Oid::decode(r.peek_rest())?;
    r.take(used)?;
    Ok(oid)
}
