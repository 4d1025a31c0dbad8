//! Postings, their stored encoding, the versioned posting list and its cache.

use xxhash_rust::xxh64::xxh64;

use crate::types::{Attr, Uid, Value};

pub mod cache;
pub mod codec;
pub mod list;

pub use cache::PostingCache;
pub use list::PostingList;

/// Identity used for an untagged value of a single-valued scalar predicate.
pub const SINGLE_VALUE_ID: u64 = u64::MAX;

/// Operation carried by a posting.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PostingOp {
    /// Adds or replaces the posting.
    Set,
    /// Removes the posting.
    Del,
}

impl PostingOp {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            PostingOp::Set => 1,
            PostingOp::Del => 2,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PostingOp::Set),
            2 => Some(PostingOp::Del),
            _ => None,
        }
    }
}

/// One edge or value attached to an entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Posting {
    /// Identity within the list; at most one live posting per identity.
    pub id: u64,
    /// Target value or entity.
    pub value: Value,
    /// Language tag, empty when untagged.
    pub lang: String,
    /// Operation.
    pub op: PostingOp,
    /// Opaque facet blob.
    pub facets: Vec<u8>,
}

impl Posting {
    /// Posting pointing at an entity; used for edges and for index lists.
    pub fn uid(uid: Uid, op: PostingOp) -> Self {
        Self {
            id: uid.0,
            value: Value::Uid(uid),
            lang: String::new(),
            op,
            facets: Vec::new(),
        }
    }

    /// Target entity when the posting is an edge.
    pub fn target(&self) -> Option<Uid> {
        match self.value {
            Value::Uid(uid) => Some(uid),
            _ => None,
        }
    }
}

/// Computes the identity of a value posting.
///
/// Edges use their target; list scalars hash the value; single-valued scalars
/// hash the language tag, or use [`SINGLE_VALUE_ID`] when untagged.
pub fn posting_id(value: &Value, lang: &str, is_list: bool) -> u64 {
    match value {
        Value::Uid(uid) => uid.0,
        _ if is_list => xxh64(&value.payload_bytes(), 0),
        _ if !lang.is_empty() => xxh64(lang.as_bytes(), 0),
        _ => SINGLE_VALUE_ID,
    }
}

/// A mutation submitted by a caller.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectedEdge {
    /// Source entity.
    pub entity: Uid,
    /// Predicate.
    pub attr: Attr,
    /// Value or target entity; `*` with [`PostingOp::Del`] deletes everything.
    pub value: Value,
    /// Language tag, empty when untagged.
    pub lang: String,
    /// Operation.
    pub op: PostingOp,
    /// Opaque facet blob.
    pub facets: Vec<u8>,
}

impl DirectedEdge {
    /// Sets `value` on `entity`.
    pub fn set(entity: Uid, attr: Attr, value: impl Into<Value>) -> Self {
        Self {
            entity,
            attr,
            value: value.into(),
            lang: String::new(),
            op: PostingOp::Set,
            facets: Vec::new(),
        }
    }

    /// Deletes `value` from `entity`.
    pub fn del(entity: Uid, attr: Attr, value: impl Into<Value>) -> Self {
        Self {
            op: PostingOp::Del,
            ..Self::set(entity, attr, value)
        }
    }

    /// Deletes every value of `attr` from `entity`.
    pub fn del_all(entity: Uid, attr: Attr) -> Self {
        Self::del(entity, attr, Value::Default("*".to_owned()))
    }

    /// Adds an edge from `entity` to `target`.
    pub fn set_edge(entity: Uid, attr: Attr, target: Uid) -> Self {
        Self::set(entity, attr, Value::Uid(target))
    }

    /// Tags the value with a language.
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Attaches a facet blob.
    pub fn with_facets(mut self, facets: Vec<u8>) -> Self {
        self.facets = facets;
        self
    }

    /// Returns `true` for a delete-everything mutation.
    pub fn is_delete_all(&self) -> bool {
        self.op == PostingOp::Del && self.value.as_text() == Some("*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rules() {
        assert_eq!(posting_id(&Value::Uid(Uid(9)), "", false), 9);
        assert_eq!(posting_id(&Value::Int(1), "", false), SINGLE_VALUE_ID);
        assert_ne!(
            posting_id(&Value::String("a".into()), "en", false),
            posting_id(&Value::String("a".into()), "fr", false)
        );
        assert_ne!(
            posting_id(&Value::Int(1), "", true),
            posting_id(&Value::Int(2), "", true)
        );
    }

    #[test]
    fn delete_all_is_detected() {
        let attr = Attr::root("friend");
        assert!(DirectedEdge::del_all(Uid(1), attr.clone()).is_delete_all());
        assert!(!DirectedEdge::del(Uid(1), attr.clone(), "x").is_delete_all());
        assert!(!DirectedEdge::set(Uid(1), attr, "*").is_delete_all());
    }
}
