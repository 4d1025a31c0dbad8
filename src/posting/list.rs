use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::codec::{decode_postings, encode_postings};
use super::{Posting, PostingOp};
use crate::storage::{KvStore, TxnWriter, BIT_DELTA};
use crate::types::{Result, Ts, Uid, UmbraError};

/// Outcome of staging one mutation in a transaction's layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationEffect {
    /// Postings that were live for the transaction and no longer are.
    pub displaced: Vec<Posting>,
    /// Whether the layer changed at all.
    pub applied: bool,
    /// Live postings before the mutation.
    pub count_before: usize,
    /// Live postings after the mutation.
    pub count_after: usize,
}

/// Versioned postings of one key.
///
/// Holds a committed complete base, committed deltas above it (ascending by
/// commit timestamp) and one uncommitted layer per writing transaction.
#[derive(Debug)]
pub struct PostingList {
    key: Vec<u8>,
    base: Vec<Posting>,
    base_ts: Ts,
    deltas: Vec<(Ts, Vec<Posting>)>,
    layers: FxHashMap<Ts, Vec<Posting>>,
    gc_watermark: Ts,
}

impl PostingList {
    /// Empty list for `key` with no stored versions.
    pub fn empty(key: Vec<u8>) -> Self {
        Self {
            key,
            base: Vec::new(),
            base_ts: 0,
            deltas: Vec::new(),
            layers: FxHashMap::default(),
            gc_watermark: 0,
        }
    }

    /// Loads every committed version needed to read `key`.
    pub fn load(key: Vec<u8>, kv: &dyn KvStore) -> Result<Self> {
        let mut list = Self::empty(key);
        for (ts, record) in kv.versions(&list.key, Ts::MAX)? {
            if record.is_complete() {
                if !record.is_empty_marker() {
                    list.base = decode_postings(&record.value)?;
                    if list.base.iter().any(|p| p.op != PostingOp::Set) {
                        return Err(UmbraError::Corruption("complete record holds a delete"));
                    }
                }
                list.base_ts = ts;
                break;
            }
            if record.meta & BIT_DELTA == 0 {
                return Err(UmbraError::Corruption("posting key holds a non-posting record"));
            }
            list.deltas.push((ts, decode_postings(&record.value)?));
        }
        list.deltas.reverse();
        Ok(list)
    }

    /// Key this list belongs to.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Oldest timestamp this list can still answer reads for.
    pub fn read_floor(&self) -> Ts {
        self.gc_watermark.max(self.base_ts)
    }

    /// Returns `true` while any transaction has an uncommitted layer.
    pub fn has_pending(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Live postings at `read_ts`, ordered by identity.
    ///
    /// Committed versions with timestamps `<= read_ts` are replayed over the
    /// base; the owner's uncommitted layer is applied last.
    pub fn read(&self, read_ts: Ts, owner: Option<Ts>) -> Result<Vec<Posting>> {
        let floor = self.read_floor();
        if read_ts < floor {
            return Err(UmbraError::StaleRead {
                read_ts,
                watermark: floor,
            });
        }
        let mut live: BTreeMap<u64, Posting> =
            self.base.iter().map(|p| (p.id, p.clone())).collect();
        for (ts, delta) in &self.deltas {
            if *ts > read_ts {
                break;
            }
            apply(&mut live, delta);
        }
        if let Some(layer) = owner.and_then(|start_ts| self.layers.get(&start_ts)) {
            apply(&mut live, layer);
        }
        Ok(live.into_values().collect())
    }

    /// Entity targets of the live postings at `read_ts`.
    pub fn uids(&self, read_ts: Ts, owner: Option<Ts>) -> Result<Vec<Uid>> {
        Ok(self
            .read(read_ts, owner)?
            .iter()
            .filter_map(Posting::target)
            .collect())
    }

    /// Stages `posting` in the layer of `start_ts`.
    ///
    /// With `single` set, a SET displaces every other live posting so the
    /// entity keeps one value. Deleting a posting that is not live is a no-op.
    pub fn add_mutation(
        &mut self,
        start_ts: Ts,
        posting: Posting,
        single: bool,
    ) -> Result<MutationEffect> {
        let current = self.read(start_ts, Some(start_ts))?;
        let mut effect = MutationEffect {
            count_before: current.len(),
            ..MutationEffect::default()
        };
        let existing = current.iter().find(|p| p.id == posting.id);
        match posting.op {
            PostingOp::Set => {
                if single {
                    for other in current.iter().filter(|p| p.id != posting.id) {
                        self.stage(start_ts, deletion_of(other));
                        effect.displaced.push(other.clone());
                    }
                }
                let unchanged = existing.map_or(false, |prev| {
                    prev.value == posting.value
                        && prev.lang == posting.lang
                        && prev.facets == posting.facets
                });
                if let Some(prev) = existing {
                    if prev.value != posting.value || prev.lang != posting.lang {
                        effect.displaced.push(prev.clone());
                    }
                }
                if !unchanged {
                    self.stage(start_ts, posting);
                    effect.applied = true;
                }
                effect.applied |= !effect.displaced.is_empty();
            }
            PostingOp::Del => {
                if let Some(prev) = existing {
                    if prev.value == posting.value {
                        effect.displaced.push(prev.clone());
                        self.stage(start_ts, deletion_of(prev));
                        effect.applied = true;
                    }
                }
            }
        }
        effect.count_after = self.read(start_ts, Some(start_ts))?.len();
        Ok(effect)
    }

    /// Stages deletion of every live posting in the layer of `start_ts`.
    pub fn delete_all(&mut self, start_ts: Ts) -> Result<MutationEffect> {
        let current = self.read(start_ts, Some(start_ts))?;
        for posting in &current {
            self.stage(start_ts, deletion_of(posting));
        }
        Ok(MutationEffect {
            applied: !current.is_empty(),
            count_before: current.len(),
            count_after: 0,
            displaced: current,
        })
    }

    fn stage(&mut self, start_ts: Ts, posting: Posting) {
        let layer = self.layers.entry(start_ts).or_default();
        match layer.binary_search_by_key(&posting.id, |p| p.id) {
            Ok(idx) => layer[idx] = posting,
            Err(idx) => layer.insert(idx, posting),
        }
    }

    /// Writes the layer of `start_ts` as a delta record into `writer`.
    ///
    /// Returns `false` when the transaction staged nothing here.
    pub fn commit_to_disk(&self, start_ts: Ts, writer: &mut TxnWriter<'_>) -> bool {
        match self.layers.get(&start_ts) {
            Some(layer) if !layer.is_empty() => {
                writer.put(self.key.clone(), BIT_DELTA, encode_postings(layer));
                true
            }
            _ => false,
        }
    }

    /// Turns the layer of `start_ts` into the committed delta at `commit_ts`.
    ///
    /// Skips the delta if it was already loaded from the store.
    pub fn promote(&mut self, start_ts: Ts, commit_ts: Ts) {
        let Some(layer) = self.layers.remove(&start_ts) else {
            return;
        };
        if layer.is_empty() || commit_ts <= self.base_ts {
            return;
        }
        match self.deltas.binary_search_by_key(&commit_ts, |(ts, _)| *ts) {
            Ok(_) => {}
            Err(idx) => self.deltas.insert(idx, (commit_ts, layer)),
        }
    }

    /// Discards the layer of `start_ts`.
    pub fn rollback(&mut self, start_ts: Ts) {
        self.layers.remove(&start_ts);
    }

    /// Folds committed deltas at or below `watermark` into the base.
    ///
    /// Returns the timestamp and content of the new complete version when
    /// anything was folded; reads below `watermark` fail afterwards.
    pub fn rollup(&mut self, watermark: Ts) -> Option<(Ts, Vec<Posting>)> {
        let split = self.deltas.partition_point(|(ts, _)| *ts <= watermark);
        self.gc_watermark = self.gc_watermark.max(watermark);
        if split == 0 {
            return None;
        }
        let mut live: BTreeMap<u64, Posting> =
            self.base.iter().map(|p| (p.id, p.clone())).collect();
        let folded: Vec<_> = self.deltas.drain(..split).collect();
        for (_, delta) in &folded {
            apply(&mut live, delta);
        }
        self.base = live.into_values().collect();
        self.base_ts = folded.last().map(|(ts, _)| *ts).unwrap_or(self.base_ts);
        Some((self.base_ts, self.base.clone()))
    }
}

fn deletion_of(posting: &Posting) -> Posting {
    Posting {
        op: PostingOp::Del,
        facets: Vec::new(),
        ..posting.clone()
    }
}

fn apply(live: &mut BTreeMap<u64, Posting>, postings: &[Posting]) {
    for posting in postings {
        match posting.op {
            PostingOp::Set => {
                live.insert(posting.id, posting.clone());
            }
            PostingOp::Del => {
                live.remove(&posting.id);
            }
        }
    }
}
