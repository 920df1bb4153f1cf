//! State Tree
//!
//! Hierarchical document/collection/attribute tree addressed by OIDs. Every
//! value change bumps the attribute's revision and is delivered, in order,
//! to listeners whose prefix covers it. Listeners are the hook the stream
//! manager uses to forward changes to remote subscribers.

mod oid;
mod tree;
mod value;

pub use oid::{Oid, ParseOidError, MAX_OID_LEN};
pub use tree::{
    Attribute, AttributeSnapshot, Collection, Document, HistoryEntry, Listener, Node, StateTree,
};
pub use value::{AttributeValue, ChangeEvent, ChangeKind};

use std::fmt;
use thiserror::Error;

/// Errors related to state tree access.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid OID '{0}'")]
    InvalidOid(Oid),

    #[error("node {oid} is a {found}, expected a {expected}")]
    KindMismatch {
        oid: Oid,
        expected: NodeKind,
        found: NodeKind,
    },

    #[error("node {0} is an attribute and cannot have children")]
    NotAContainer(Oid),

    #[error("schema fragment '{name}' overlaps '{owner}' at {oid}")]
    OverlappingSchema { name: String, owner: String, oid: Oid },

    #[error("schema fragment '{name}' declares {oid} outside its subtrees")]
    OutsideSchema { name: String, oid: Oid },
}

/// Kind of state tree node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Document,
    Collection,
    Attribute,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Document => "document",
            NodeKind::Collection => "collection",
            NodeKind::Attribute => "attribute",
        };
        write!(f, "{}", name)
    }
}

/// Subtrees a plugin owns, registered at load time.
///
/// Ownership never migrates: once registered, no other fragment may claim
/// an overlapping subtree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaFragment {
    /// Owning plugin name.
    pub name: String,
    /// Roots of the owned subtrees.
    pub subtrees: Vec<Oid>,
    /// Collections inside the owned subtrees, materialized on registration.
    pub collections: Vec<Oid>,
}

impl SchemaFragment {
    /// Create an empty fragment.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subtrees: Vec::new(),
            collections: Vec::new(),
        }
    }

    /// Claim a subtree.
    pub fn subtree(mut self, oid: Oid) -> Self {
        self.subtrees.push(oid);
        self
    }

    /// Declare a collection.
    pub fn collection(mut self, oid: Oid) -> Self {
        self.collections.push(oid);
        self
    }
}
