//! Object identifiers addressing nodes of the state tree.

use crate::protocol::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// Maximum number of components in an OID.
pub const MAX_OID_LEN: usize = 255;

/// Ordered sequence of tags from the root of the state tree.
///
/// Rendered in dotted notation (`1000.1.3`). The empty OID is the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(Vec<u32>);

impl Oid {
    /// The root OID.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Create an OID from its components.
    pub fn new(components: Vec<u32>) -> Self {
        Self(components)
    }

    /// The path components.
    pub fn components(&self) -> &[u32] {
        &self.0
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the OID is shallow enough to address a tree node and to
    /// travel on the wire.
    pub fn is_valid_depth(&self) -> bool {
        self.0.len() <= MAX_OID_LEN
    }

    /// Whether this is the root OID.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First (leftmost) component.
    pub fn first(&self) -> Option<u32> {
        self.0.first().copied()
    }

    /// Last (rightmost) component.
    pub fn last(&self) -> Option<u32> {
        self.0.last().copied()
    }

    /// Extend the path by one component.
    pub fn child(&self, tag: u32) -> Oid {
        let mut components = self.0.clone();
        components.push(tag);
        Oid(components)
    }

    /// The parent OID, or `None` for the root.
    pub fn parent(&self) -> Option<Oid> {
        if self.0.is_empty() {
            None
        } else {
            Some(Oid(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Truncate to the first `len` components.
    pub fn head(&self, len: usize) -> Oid {
        Oid(self.0[..len.min(self.0.len())].to_vec())
    }

    /// Whether `self` equals `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Whether either OID is a prefix of the other.
    pub fn overlaps(&self, other: &Oid) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// Strip `ancestor` from the left, or `None` if it is not an ancestor.
    pub fn relativize(&self, ancestor: &Oid) -> Option<Oid> {
        self.0.strip_prefix(ancestor.0.as_slice()).map(|rest| Oid(rest.to_vec()))
    }

    /// Append the wire form (`[len:1][tag:4 LE]*`) to `buf`.
    ///
    /// Only OIDs passing [`is_valid_depth`](Self::is_valid_depth) reach the
    /// wire: the tree refuses deeper nodes and listeners, and requests
    /// check their OIDs before sending.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let len = self.0.len().min(MAX_OID_LEN);
        buf.push(len as u8);
        for tag in &self.0[..len] {
            buf.extend_from_slice(&tag.to_le_bytes());
        }
    }

    /// Encode to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.0.len() * 4);
        self.encode_into(&mut buf);
        buf
    }

    /// Decode from the start of `data`, returning the OID and bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Oid, usize), ProtocolError> {
        let (&len, rest) = data.split_first().ok_or(ProtocolError::MessageTooShort {
            expected: 1,
            got: 0,
        })?;
        let len = len as usize;
        if rest.len() < len * 4 {
            return Err(ProtocolError::MessageTooShort {
                expected: 1 + len * 4,
                got: data.len(),
            });
        }
        let components = rest[..len * 4]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok((Oid(components), 1 + len * 4))
    }
}

impl From<Vec<u32>> for Oid {
    fn from(components: Vec<u32>) -> Self {
        Oid(components)
    }
}

impl From<&[u32]> for Oid {
    fn from(components: &[u32]) -> Self {
        Oid(components.to_vec())
    }
}

impl<const N: usize> From<[u32; N]> for Oid {
    fn from(components: [u32; N]) -> Self {
        Oid(components.to_vec())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", tag)?;
        }
        Ok(())
    }
}

/// Error parsing a dotted OID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid OID component {0:?}")]
pub struct ParseOidError(String);

impl FromStr for Oid {
    type Err = ParseOidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Oid::root());
        }
        s.split('.')
            .map(|part| part.parse::<u32>().map_err(|_| ParseOidError(part.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .map(Oid)
    }
}
