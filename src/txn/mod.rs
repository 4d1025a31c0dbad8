//! Transactions and the transaction oracle.

use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use xxhash_rust::xxh64::xxh64;

use crate::posting::cache::ListHandle;
use crate::types::{Attr, Ts, Uid, UmbraError};

mod oracle;

pub use oracle::{CommitRequest, Oracle, TxnStatus};

/// Fingerprint of a key in conflict history.
pub fn conflict_fingerprint(key: &[u8]) -> u64 {
    xxh64(key, 0)
}

/// A unique value a transaction assigns to an entity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UniqueClaim {
    /// Predicate carrying `@unique`.
    pub attr: Attr,
    /// Token the value is indexed under.
    pub token: Vec<u8>,
    /// Base language of the value, empty when untagged.
    pub lang: String,
    /// Entity receiving the value.
    pub entity: Uid,
    /// Rendered value for error messages.
    pub value: String,
}

impl UniqueClaim {
    /// Fingerprint shared by every claim of the same value on the same predicate.
    pub fn fingerprint(&self) -> u64 {
        let mut buf = Vec::with_capacity(self.token.len() + 24);
        buf.extend_from_slice(self.attr.qualified().as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.token);
        buf.push(0);
        buf.extend_from_slice(self.lang.as_bytes());
        xxh64(&buf, 0)
    }

    /// Whether `other` claims the same value on the same predicate.
    pub fn same_value(&self, other: &UniqueClaim) -> bool {
        self.attr == other.attr && self.token == other.token && self.lang == other.lang
    }

    /// Error reported when the value already belongs to another entity.
    pub fn duplicate_error(&self) -> UmbraError {
        UmbraError::DuplicateValue {
            predicate: self.attr.to_string(),
            value: self.value.clone(),
        }
    }
}

/// Client-side state of one transaction.
///
/// Holds the lists it staged mutations in (keeping them pinned in the
/// cache), its conflict keys and its unique claims.
pub struct Txn {
    start_ts: Ts,
    started_at: Instant,
    lists: FxHashMap<Vec<u8>, ListHandle>,
    conflict_keys: FxHashSet<u64>,
    claims: Vec<UniqueClaim>,
}

impl Txn {
    /// New transaction reading at `start_ts`.
    pub fn new(start_ts: Ts) -> Self {
        Self {
            start_ts,
            started_at: Instant::now(),
            lists: FxHashMap::default(),
            conflict_keys: FxHashSet::default(),
            claims: Vec::new(),
        }
    }

    /// Snapshot timestamp.
    pub fn start_ts(&self) -> Ts {
        self.start_ts
    }

    /// When the transaction began.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Pins a list the transaction staged a mutation in.
    pub fn touch(&mut self, key: &[u8], list: &ListHandle) {
        if !self.lists.contains_key(key) {
            self.lists.insert(key.to_vec(), ListHandle::clone(list));
        }
    }

    /// Adds a key to the write set checked at commit.
    pub fn add_conflict_key(&mut self, key: &[u8]) {
        self.conflict_keys.insert(conflict_fingerprint(key));
    }

    /// Write-set fingerprints.
    pub fn conflict_keys(&self) -> &FxHashSet<u64> {
        &self.conflict_keys
    }

    /// Records a unique value claim; a repeated claim is ignored.
    ///
    /// Claims are only judged at commit, over the final state of the
    /// transaction, so values may move between entities within it.
    pub fn claim_unique(&mut self, claim: UniqueClaim) {
        let known = self
            .claims
            .iter()
            .any(|c| c.same_value(&claim) && c.entity == claim.entity);
        if !known {
            self.claims.push(claim);
        }
    }

    /// First claim whose value is also claimed by another entity.
    pub fn contested_claim(&self) -> Option<&UniqueClaim> {
        self.claims.iter().find(|claim| {
            self.claims
                .iter()
                .any(|other| other.same_value(claim) && other.entity != claim.entity)
        })
    }

    /// Drops the claim matching `released`, whose value `entity` no longer holds.
    pub fn release_unique(&mut self, released: &UniqueClaim) {
        self.claims
            .retain(|c| !(c.same_value(released) && c.entity == released.entity));
    }

    /// Claims made so far.
    pub fn claims(&self) -> &[UniqueClaim] {
        &self.claims
    }

    /// Lists the transaction staged mutations in, ordered by key.
    pub fn lists(&self) -> Vec<(&[u8], &ListHandle)> {
        let mut lists: Vec<_> = self
            .lists
            .iter()
            .map(|(key, list)| (key.as_slice(), list))
            .collect();
        lists.sort_by(|a, b| a.0.cmp(b.0));
        lists
    }

    /// Releases every pinned list.
    pub fn into_lists(self) -> Vec<ListHandle> {
        self.lists.into_values().collect()
    }
}
