//! Reindexing after a schema change.
//!
//! A rebuild scans the data of one predicate at its start timestamp, derives
//! the index, reverse and count entries the new descriptor calls for and
//! writes them in a single batch. Keys that no longer hold anything get an
//! empty marker in the same batch, so a failed rebuild leaves the previous
//! state intact and can simply be rerun.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use tracing::{debug, info};

use super::{count_u32, tokens_for};
use crate::posting::codec::encode_postings;
use crate::posting::{posting_id, Posting, PostingCache, PostingOp};
use crate::primitives::concurrency::CancelToken;
use crate::schema::SchemaDescriptor;
use crate::storage::keys::{self, ParsedKey};
use crate::storage::{KvStore, TxnWriter, BIT_COMPLETE};
use crate::tok::TokenizerRegistry;
use crate::types::{Attr, Result, Ts, Uid, UmbraError};

/// What a rebuild does to one kind of derived data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexOp {
    /// Nothing changed.
    Noop,
    /// Derived data must be recomputed.
    Rebuild,
    /// Derived data must be dropped.
    Delete,
}

/// Decision for the token index of a predicate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokIndexRebuildInfo {
    /// Overall action.
    pub op: IndexOp,
    /// Tokenizers whose entries must go.
    pub tokenizers_to_delete: Vec<String>,
    /// Tokenizers whose entries must be recomputed.
    pub tokenizers_to_rebuild: Vec<String>,
}

impl TokIndexRebuildInfo {
    fn noop() -> Self {
        Self {
            op: IndexOp::Noop,
            tokenizers_to_delete: Vec::new(),
            tokenizers_to_rebuild: Vec::new(),
        }
    }
}

/// Plan for reindexing one predicate.
#[derive(Clone, Debug)]
pub struct IndexRebuild {
    /// Namespace-qualified predicate name.
    pub attr: String,
    /// Snapshot the rebuild reads.
    pub start_ts: Ts,
    /// Descriptor before the change; `None` for a new predicate.
    pub old_schema: Option<SchemaDescriptor>,
    /// Descriptor after the change.
    pub new_schema: SchemaDescriptor,
}

/// Counters reported by [`IndexRebuild::execute`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RebuildStats {
    /// Data keys scanned.
    pub scanned: usize,
    /// Derived keys written with content.
    pub written: usize,
    /// Derived keys cleared.
    pub cleared: usize,
}

impl RebuildStats {
    fn merge(&mut self, other: RebuildStats) {
        self.written += other.written;
        self.cleared += other.cleared;
    }
}

/// Collaborators of a rebuild.
pub struct RebuildContext<'a> {
    /// Durable store.
    pub kv: &'a dyn KvStore,
    /// Posting list cache, used to read data lists.
    pub cache: &'a PostingCache,
    /// Tokenizers named by schemas.
    pub registry: &'a TokenizerRegistry,
    /// Data keys scanned between cancellation checks.
    pub batch_size: usize,
    /// Cooperative cancellation.
    pub cancel: &'a CancelToken,
}

/// Live postings of one entity.
pub type EntityPostings = (Uid, Vec<Posting>);

impl IndexRebuild {
    fn old(&self) -> SchemaDescriptor {
        self.old_schema.clone().unwrap_or_default()
    }

    fn parsed_attr(&self) -> Result<Attr> {
        Attr::parse(&self.attr)
    }

    /// Decides what happens to the token index.
    pub fn needs_tok_index_rebuild(&self) -> TokIndexRebuildInfo {
        let old = self.old();
        let new = &self.new_schema;
        if !old.index && !new.index {
            return TokIndexRebuildInfo::noop();
        }
        if !new.index {
            return TokIndexRebuildInfo {
                op: IndexOp::Delete,
                tokenizers_to_delete: old.tokenizers,
                tokenizers_to_rebuild: Vec::new(),
            };
        }
        if old.value_type != new.value_type {
            return TokIndexRebuildInfo {
                op: IndexOp::Rebuild,
                tokenizers_to_delete: old.tokenizers,
                tokenizers_to_rebuild: new.tokenizers.clone(),
            };
        }
        let to_delete: Vec<String> = old
            .tokenizers
            .iter()
            .filter(|t| !new.tokenizers.contains(t))
            .cloned()
            .collect();
        let to_rebuild: Vec<String> = new
            .tokenizers
            .iter()
            .filter(|t| !old.tokenizers.contains(t))
            .cloned()
            .collect();
        if to_delete.is_empty() && to_rebuild.is_empty() {
            return TokIndexRebuildInfo::noop();
        }
        TokIndexRebuildInfo {
            op: IndexOp::Rebuild,
            tokenizers_to_delete: to_delete,
            tokenizers_to_rebuild: to_rebuild,
        }
    }

    /// Decides what happens to the count index.
    pub fn needs_count_index_rebuild(&self) -> IndexOp {
        let old = self.old();
        match (old.count, self.new_schema.count) {
            (a, b) if a == b => IndexOp::Noop,
            (_, false) => IndexOp::Delete,
            _ => IndexOp::Rebuild,
        }
    }

    /// Decides what happens to reverse edges.
    pub fn needs_reverse_edges_rebuild(&self) -> IndexOp {
        let old = self.old();
        match (old.reverse, self.new_schema.reverse) {
            (a, b) if a == b => IndexOp::Noop,
            (_, false) => IndexOp::Delete,
            _ => IndexOp::Rebuild,
        }
    }

    /// Whether stored postings must be re-identified for a cardinality change.
    pub fn needs_list_type_rebuild(&self) -> Result<bool> {
        self.parsed_attr()?;
        Ok(match &self.old_schema {
            Some(old) => old.list != self.new_schema.list,
            None => false,
        })
    }

    /// Whether stored values must be converted to a new value type.
    pub fn needs_value_type_rebuild(&self) -> bool {
        self.old_schema
            .as_ref()
            .map_or(false, |old| old.value_type != self.new_schema.value_type)
    }

    /// Key prefixes whose content the token index rebuild replaces.
    pub fn prefixes_for_tok_indexes(&self, registry: &TokenizerRegistry) -> Result<Vec<Vec<u8>>> {
        let attr = self.parsed_attr()?;
        let info = self.needs_tok_index_rebuild();
        match info.op {
            IndexOp::Noop => Ok(Vec::new()),
            IndexOp::Delete => Ok(vec![keys::index_prefix(&attr)]),
            IndexOp::Rebuild => {
                let mut prefixes = Vec::new();
                for name in info
                    .tokenizers_to_delete
                    .iter()
                    .chain(&info.tokenizers_to_rebuild)
                {
                    let tokenizer = registry.get(name).ok_or_else(|| {
                        UmbraError::SchemaViolation(format!("unknown tokenizer [{name}]"))
                    })?;
                    let prefix = keys::tokenizer_prefix(&attr, tokenizer.identifier());
                    if !prefixes.contains(&prefix) {
                        prefixes.push(prefix);
                    }
                }
                Ok(prefixes)
            }
        }
    }

    /// Whether the change touches any derived data.
    pub fn is_noop(&self) -> Result<bool> {
        Ok(self.needs_tok_index_rebuild().op == IndexOp::Noop
            && self.needs_count_index_rebuild() == IndexOp::Noop
            && self.needs_reverse_edges_rebuild() == IndexOp::Noop
            && !self.needs_value_type_rebuild()
            && !self.needs_list_type_rebuild()?)
    }

    /// Reads the live postings of every entity of the predicate at `start_ts`.
    pub fn scan_data(&self, ctx: &RebuildContext<'_>) -> Result<Vec<EntityPostings>> {
        let attr = self.parsed_attr()?;
        let batch = ctx.batch_size.max(1);
        let mut keys_seen = Vec::new();
        ctx.kv
            .scan(&keys::data_prefix(&attr), self.start_ts, &mut |key, _, _| {
                match ParsedKey::parse(key)? {
                    ParsedKey::Data { uid, .. } => keys_seen.push((uid, key.to_vec())),
                    _ => return Err(UmbraError::Corruption("non-data key under data prefix")),
                }
                if keys_seen.len() % batch == 0 {
                    ctx.cancel.check()?;
                }
                Ok(ControlFlow::Continue(()))
            })?;
        let mut out = Vec::with_capacity(keys_seen.len());
        for (i, (uid, key)) in keys_seen.into_iter().enumerate() {
            if i % batch == 0 {
                ctx.cancel.check()?;
            }
            let postings = ctx
                .cache
                .get_or_load(&key, ctx.kv)?
                .read()
                .read(self.start_ts, None)?;
            if !postings.is_empty() {
                out.push((uid, postings));
            }
        }
        Ok(out)
    }

    /// Converts scanned values to the new value type.
    ///
    /// Fails with [`UmbraError::SchemaViolation`] on the first value that
    /// does not convert. Values that become equal collapse into one posting.
    pub fn convert_values(&self, data: Vec<EntityPostings>) -> Result<Vec<EntityPostings>> {
        if !self.needs_value_type_rebuild() {
            return Ok(data);
        }
        let attr = self.parsed_attr()?;
        let target = self.new_schema.value_type;
        let mut out = Vec::with_capacity(data.len());
        for (uid, postings) in data {
            let mut converted = Vec::with_capacity(postings.len());
            for posting in postings {
                let value = posting.value.convert_to(target).map_err(|_| {
                    UmbraError::SchemaViolation(format!(
                        "entity {uid} holds [{}] for [{attr}], which cannot become {target}",
                        posting.value
                    ))
                })?;
                converted.push(Posting {
                    id: posting_id(&value, &posting.lang, self.new_schema.list),
                    value,
                    ..posting
                });
            }
            converted.sort_by_key(|p| p.id);
            converted.dedup_by_key(|p| p.id);
            out.push((uid, converted));
        }
        Ok(out)
    }

    /// Stages the token index of the new descriptor.
    pub fn rebuild_tok_index(
        &self,
        ctx: &RebuildContext<'_>,
        data: &[EntityPostings],
        writer: &mut TxnWriter<'_>,
    ) -> Result<RebuildStats> {
        let info = self.needs_tok_index_rebuild();
        if info.op == IndexOp::Noop {
            return Ok(RebuildStats::default());
        }
        let attr = self.parsed_attr()?;
        let mut desired: BTreeMap<Vec<u8>, BTreeSet<Uid>> = BTreeMap::new();
        if info.op == IndexOp::Rebuild {
            for (uid, postings) in data {
                for posting in postings {
                    let tokens = tokens_for(
                        ctx.registry,
                        &self.new_schema,
                        &info.tokenizers_to_rebuild,
                        posting,
                    )?;
                    for token in tokens {
                        desired
                            .entry(keys::index_key(&attr, &token))
                            .or_default()
                            .insert(*uid);
                    }
                }
            }
        }
        let prefixes = self.prefixes_for_tok_indexes(ctx.registry)?;
        stage_replacement(ctx, self.start_ts, &prefixes, desired, writer)
    }

    /// Stages reverse edges of the new descriptor.
    pub fn rebuild_reverse_edges(
        &self,
        ctx: &RebuildContext<'_>,
        data: &[EntityPostings],
        writer: &mut TxnWriter<'_>,
    ) -> Result<RebuildStats> {
        let op = self.needs_reverse_edges_rebuild();
        if op == IndexOp::Noop {
            return Ok(RebuildStats::default());
        }
        let attr = self.parsed_attr()?;
        let mut desired: BTreeMap<Vec<u8>, BTreeSet<Uid>> = BTreeMap::new();
        if op == IndexOp::Rebuild && self.new_schema.is_uid() {
            for (uid, target) in edges(data) {
                desired
                    .entry(keys::reverse_key(&attr, target))
                    .or_default()
                    .insert(uid);
            }
        }
        stage_replacement(
            ctx,
            self.start_ts,
            &[keys::reverse_prefix(&attr)],
            desired,
            writer,
        )
    }

    /// Stages the forward and reverse count indexes of the new descriptor.
    ///
    /// Also runs when reverse edges are toggled on a counted predicate, since
    /// reverse counts follow them.
    pub fn rebuild_count_index(
        &self,
        ctx: &RebuildContext<'_>,
        data: &[EntityPostings],
        writer: &mut TxnWriter<'_>,
    ) -> Result<RebuildStats> {
        let op = self.needs_count_index_rebuild();
        let reverse_changed = self.needs_reverse_edges_rebuild() != IndexOp::Noop;
        if op == IndexOp::Noop && !(reverse_changed && self.new_schema.count) {
            return Ok(RebuildStats::default());
        }
        let attr = self.parsed_attr()?;
        let mut desired: BTreeMap<Vec<u8>, BTreeSet<Uid>> = BTreeMap::new();
        if self.new_schema.count {
            for (uid, postings) in data {
                desired
                    .entry(keys::count_key(&attr, count_u32(postings.len()), false))
                    .or_default()
                    .insert(*uid);
            }
            if self.new_schema.counts_reverse() {
                let mut sources: BTreeMap<Uid, usize> = BTreeMap::new();
                for (_, target) in edges(data) {
                    *sources.entry(target).or_default() += 1;
                }
                for (target, n) in sources {
                    desired
                        .entry(keys::count_key(&attr, count_u32(n), true))
                        .or_default()
                        .insert(target);
                }
            }
        }
        let prefixes = [
            keys::count_prefix(&attr, false),
            keys::count_prefix(&attr, true),
        ];
        stage_replacement(ctx, self.start_ts, &prefixes, desired, writer)
    }

    /// Rewrites stored postings after a scalar/list or value type change.
    ///
    /// Moving to a scalar fails when an entity holds more than one value
    /// (per language for tagged values).
    pub fn rewrite_data(
        &self,
        data: &[EntityPostings],
        writer: &mut TxnWriter<'_>,
    ) -> Result<RebuildStats> {
        if !self.needs_list_type_rebuild()? && !self.needs_value_type_rebuild() {
            return Ok(RebuildStats::default());
        }
        let attr = self.parsed_attr()?;
        let list = self.new_schema.list;
        let mut stats = RebuildStats::default();
        for (uid, postings) in data {
            if !list {
                let mut langs = BTreeSet::new();
                for posting in postings {
                    let slot = if posting.target().is_some() {
                        ""
                    } else {
                        posting.lang.as_str()
                    };
                    if !langs.insert(slot) {
                        return Err(UmbraError::SchemaViolation(format!(
                            "entity {uid} holds several values for [{attr}], which cannot become scalar"
                        )));
                    }
                }
            }
            if self.new_schema.is_uid() {
                continue;
            }
            let mut rewritten: Vec<Posting> = postings
                .iter()
                .map(|p| Posting {
                    id: posting_id(&p.value, &p.lang, list),
                    op: PostingOp::Set,
                    ..p.clone()
                })
                .collect();
            rewritten.sort_by_key(|p| p.id);
            writer.put(
                keys::data_key(&attr, *uid),
                BIT_COMPLETE,
                encode_postings(&rewritten),
            );
            stats.written += 1;
        }
        Ok(stats)
    }

    /// Runs every part of the plan into `writer`.
    ///
    /// Value conversion and cardinality go first since they may reject the
    /// change outright; derived data is computed from the converted values.
    pub fn execute(
        &self,
        ctx: &RebuildContext<'_>,
        writer: &mut TxnWriter<'_>,
    ) -> Result<RebuildStats> {
        let span = tracing::info_span!("index_rebuild", attr = %self.attr, start_ts = self.start_ts);
        let _guard = span.enter();
        if self.is_noop()? {
            debug!("schema change needs no reindexing");
            return Ok(RebuildStats::default());
        }
        let data = self.convert_values(self.scan_data(ctx)?)?;
        let mut stats = RebuildStats {
            scanned: data.len(),
            ..RebuildStats::default()
        };
        stats.merge(self.rewrite_data(&data, writer)?);
        ctx.cancel.check()?;
        stats.merge(self.rebuild_tok_index(ctx, &data, writer)?);
        ctx.cancel.check()?;
        stats.merge(self.rebuild_reverse_edges(ctx, &data, writer)?);
        ctx.cancel.check()?;
        stats.merge(self.rebuild_count_index(ctx, &data, writer)?);
        info!(
            scanned = stats.scanned,
            written = stats.written,
            cleared = stats.cleared,
            "rebuild staged"
        );
        Ok(stats)
    }
}

fn edges(data: &[EntityPostings]) -> impl Iterator<Item = (Uid, Uid)> + '_ {
    data.iter().flat_map(|(uid, postings)| {
        postings
            .iter()
            .filter_map(move |p| p.target().map(|target| (*uid, target)))
    })
}

/// Live keys under `prefix` at `at`.
fn existing_keys(kv: &dyn KvStore, prefix: &[u8], at: Ts) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    kv.scan(prefix, at, &mut |key, _, record| {
        ParsedKey::parse(key)?;
        if !record.is_empty_marker() {
            out.push(key.to_vec());
        }
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(out)
}

/// Writes `desired` as complete lists and clears every other live key under
/// `prefixes`.
fn stage_replacement(
    ctx: &RebuildContext<'_>,
    start_ts: Ts,
    prefixes: &[Vec<u8>],
    desired: BTreeMap<Vec<u8>, BTreeSet<Uid>>,
    writer: &mut TxnWriter<'_>,
) -> Result<RebuildStats> {
    let mut stats = RebuildStats::default();
    for prefix in prefixes {
        for key in existing_keys(ctx.kv, prefix, start_ts)? {
            if !desired.contains_key(&key) {
                writer.put_empty(key);
                stats.cleared += 1;
            }
        }
    }
    for (key, uids) in desired {
        let postings: Vec<Posting> = uids
            .into_iter()
            .map(|uid| Posting::uid(uid, PostingOp::Set))
            .collect();
        writer.put(key, BIT_COMPLETE, encode_postings(&postings));
        stats.written += 1;
    }
    debug!(written = stats.written, cleared = stats.cleared, "derived keys staged");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Value, ValueType};

    fn plan(old: Option<SchemaDescriptor>, new: SchemaDescriptor) -> IndexRebuild {
        IndexRebuild {
            attr: Attr::root("name").qualified(),
            start_ts: 5,
            old_schema: old,
            new_schema: new,
        }
    }

    fn string() -> SchemaDescriptor {
        SchemaDescriptor::new(ValueType::String)
    }

    #[test]
    fn tok_index_decisions() {
        let none = plan(Some(string()), string()).needs_tok_index_rebuild();
        assert_eq!(none.op, IndexOp::Noop);

        let added = plan(Some(string()), string().indexed(["exact"])).needs_tok_index_rebuild();
        assert_eq!(added.op, IndexOp::Rebuild);
        assert_eq!(added.tokenizers_to_rebuild, vec!["exact"]);
        assert!(added.tokenizers_to_delete.is_empty());

        let dropped = plan(Some(string().indexed(["exact", "term"])), string())
            .needs_tok_index_rebuild();
        assert_eq!(dropped.op, IndexOp::Delete);
        assert_eq!(dropped.tokenizers_to_delete, vec!["exact", "term"]);

        let swapped = plan(
            Some(string().indexed(["exact", "term"])),
            string().indexed(["term", "trigram"]),
        )
        .needs_tok_index_rebuild();
        assert_eq!(swapped.op, IndexOp::Rebuild);
        assert_eq!(swapped.tokenizers_to_delete, vec!["exact"]);
        assert_eq!(swapped.tokenizers_to_rebuild, vec!["trigram"]);

        let same = plan(
            Some(string().indexed(["term", "exact"])),
            string().indexed(["exact", "term"]),
        )
        .needs_tok_index_rebuild();
        assert_eq!(same.op, IndexOp::Noop);
    }

    #[test]
    fn type_change_rebuilds_every_tokenizer() {
        let info = plan(
            Some(string().indexed(["exact"])),
            SchemaDescriptor::new(ValueType::Int).indexed(["int"]),
        )
        .needs_tok_index_rebuild();
        assert_eq!(info.op, IndexOp::Rebuild);
        assert_eq!(info.tokenizers_to_delete, vec!["exact"]);
        assert_eq!(info.tokenizers_to_rebuild, vec!["int"]);
    }

    #[test]
    fn values_are_converted_to_the_new_type() -> Result<()> {
        let p = plan(
            Some(string().list()),
            SchemaDescriptor::new(ValueType::Int).list(),
        );
        assert!(p.needs_value_type_rebuild());
        assert!(!p.is_noop()?);
        let text = |s: &str| Posting {
            id: posting_id(&Value::from(s), "", true),
            value: Value::String(s.to_owned()),
            lang: String::new(),
            op: PostingOp::Set,
            facets: Vec::new(),
        };
        let converted = p.convert_values(vec![(Uid(1), vec![text("10"), text("010"), text("7")])])?;
        let values: Vec<Value> = converted[0].1.iter().map(|p| p.value.clone()).collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&Value::Int(10)));
        assert!(values.contains(&Value::Int(7)));

        let err = p
            .convert_values(vec![(Uid(2), vec![text("ten")])])
            .unwrap_err();
        assert!(matches!(err, UmbraError::SchemaViolation(_)));
        assert!(!plan(Some(string()), string().indexed(["exact"])).needs_value_type_rebuild());
        Ok(())
    }

    #[test]
    fn new_predicate_compares_against_default() {
        let p = plan(None, SchemaDescriptor::new(ValueType::Uid).reverse().count());
        assert_eq!(p.needs_tok_index_rebuild().op, IndexOp::Noop);
        assert_eq!(p.needs_reverse_edges_rebuild(), IndexOp::Rebuild);
        assert_eq!(p.needs_count_index_rebuild(), IndexOp::Rebuild);
        assert!(!p.needs_list_type_rebuild().unwrap());
    }

    #[test]
    fn count_and_reverse_toggles() {
        let uid = SchemaDescriptor::new(ValueType::Uid);
        let p = plan(Some(uid.clone().reverse().count()), uid.clone());
        assert_eq!(p.needs_reverse_edges_rebuild(), IndexOp::Delete);
        assert_eq!(p.needs_count_index_rebuild(), IndexOp::Delete);
        let p = plan(Some(uid.clone().count()), uid.count());
        assert_eq!(p.needs_count_index_rebuild(), IndexOp::Noop);
    }

    #[test]
    fn list_type_change_in_both_directions() {
        assert!(plan(Some(string()), string().list())
            .needs_list_type_rebuild()
            .unwrap());
        assert!(plan(Some(string().list()), string())
            .needs_list_type_rebuild()
            .unwrap());
        let mut bad = plan(Some(string()), string().list());
        bad.attr = "not-qualified".into();
        assert!(bad.needs_list_type_rebuild().is_err());
    }

    #[test]
    fn prefixes_cover_deleted_and_rebuilt_tokenizers() -> Result<()> {
        let registry = TokenizerRegistry::with_builtins();
        let attr = Attr::root("name");
        let p = plan(
            Some(string().indexed(["exact"])),
            string().indexed(["term"]),
        );
        assert_eq!(
            p.prefixes_for_tok_indexes(&registry)?,
            vec![
                keys::tokenizer_prefix(&attr, crate::tok::ids::EXACT),
                keys::tokenizer_prefix(&attr, crate::tok::ids::TERM),
            ]
        );
        let p = plan(Some(string().indexed(["exact"])), string());
        assert_eq!(p.prefixes_for_tok_indexes(&registry)?, vec![keys::index_prefix(&attr)]);
        assert!(plan(Some(string()), string())
            .prefixes_for_tok_indexes(&registry)?
            .is_empty());
        Ok(())
    }
}
