use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use crate::index::{
    apply_edge, verify_unique, IndexOp, IndexRebuild, MutationContext, RebuildContext,
    RebuildStats,
};
use crate::posting::codec::encode_postings;
use crate::posting::{DirectedEdge, Posting, PostingCache};
use crate::primitives::concurrency::CancelToken;
use crate::schema::{encode_descriptor, parse_schema, SchemaDescriptor, SchemaState};
use crate::storage::keys;
use crate::storage::{default_metrics, EngineMetrics, KvStore, TxnWriter, BIT_COMPLETE};
use crate::tok::{build_tokens, Tokenizer, TokenizerRegistry};
use crate::txn::{CommitRequest, Oracle, Txn};
use crate::types::{Attr, Result, Ts, Uid, UmbraError, Value};

type TxnHandle = Arc<Mutex<Txn>>;

/// Outcome of one [`Engine::run_gc`] pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GcStats {
    /// Watermark the pass folded versions up to.
    pub watermark: Ts,
    /// Lists whose deltas were folded into a complete version.
    pub lists_rolled_up: usize,
    /// Conflict history and unique claim entries forgotten.
    pub history_pruned: usize,
}

/// The storage core: posting lists, transactions, schema and indexes over
/// one durable store.
///
/// Every piece of process-wide state lives here, so several engines can
/// coexist in one process.
pub struct Engine {
    kv: Arc<dyn KvStore>,
    config: EngineConfig,
    metrics: Arc<dyn EngineMetrics>,
    registry: TokenizerRegistry,
    schema: SchemaState,
    oracle: Oracle,
    cache: PostingCache,
    txns: Mutex<FxHashMap<Ts, TxnHandle>>,
}

impl Engine {
    /// Opens an engine over `kv` with no-op metrics.
    pub fn open(kv: Arc<dyn KvStore>, config: EngineConfig) -> Result<Self> {
        Self::open_with_metrics(kv, config, None)
    }

    /// Opens an engine over `kv`, reporting to `metrics` when given.
    ///
    /// Timestamps resume after the newest version in the store and the
    /// schema is loaded from it.
    pub fn open_with_metrics(
        kv: Arc<dyn KvStore>,
        config: EngineConfig,
        metrics: Option<Arc<dyn EngineMetrics>>,
    ) -> Result<Self> {
        let metrics = metrics.unwrap_or_else(default_metrics);
        let last_ts = kv.max_version()?;
        let schema = SchemaState::load(kv.as_ref(), last_ts)?;
        let cache = PostingCache::new(
            config.cache_shards,
            config.cache_capacity,
            Arc::clone(&metrics),
        );
        info!(
            last_ts,
            predicates = schema.predicates().len(),
            "engine opened"
        );
        Ok(Self {
            kv,
            config,
            metrics,
            registry: TokenizerRegistry::with_builtins(),
            schema,
            oracle: Oracle::new(last_ts),
            cache,
            txns: Mutex::new(FxHashMap::default()),
        })
    }

    /// Adds a tokenizer schemas may name.
    pub fn register_tokenizer(&mut self, tokenizer: Arc<dyn Tokenizer>) -> Result<()> {
        self.registry.register(tokenizer)
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Transaction oracle.
    pub fn oracle(&self) -> &Oracle {
        &self.oracle
    }

    /// Posting list cache.
    pub fn cache(&self) -> &PostingCache {
        &self.cache
    }

    /// Tokenizers known to the engine.
    pub fn registry(&self) -> &TokenizerRegistry {
        &self.registry
    }

    /// Descriptor of `attr`, if declared.
    pub fn schema_of(&self, attr: &Attr) -> Option<SchemaDescriptor> {
        self.schema.get(attr)
    }

    /// Starts a transaction and returns its snapshot timestamp.
    pub fn begin_txn(&self) -> Ts {
        let start_ts = self.oracle.register_start_ts();
        self.oracle.wait_for_ts(start_ts);
        self.txns
            .lock()
            .insert(start_ts, Arc::new(Mutex::new(Txn::new(start_ts))));
        self.metrics.txn_started();
        debug!(start_ts, "transaction started");
        start_ts
    }

    fn txn(&self, start_ts: Ts) -> Result<TxnHandle> {
        self.txns
            .lock()
            .get(&start_ts)
            .cloned()
            .ok_or(UmbraError::TxnNotActive(start_ts))
    }

    fn mutation_ctx(&self) -> MutationContext<'_> {
        MutationContext {
            kv: self.kv.as_ref(),
            cache: &self.cache,
            registry: &self.registry,
        }
    }

    fn owner(&self, read_ts: Ts) -> Option<Ts> {
        self.txns.lock().contains_key(&read_ts).then_some(read_ts)
    }

    /// Live postings of `key` at `start_ts`, including the caller's own
    /// uncommitted writes when `start_ts` is an active transaction.
    pub fn read(&self, key: &[u8], start_ts: Ts) -> Result<Vec<Posting>> {
        self.oracle.wait_for_ts(start_ts);
        let owner = self.owner(start_ts);
        self.cache
            .get_or_load(key, self.kv.as_ref())?
            .read()
            .read(start_ts, owner)
    }

    /// Live postings of `attr` on `entity` at `start_ts`.
    pub fn read_attr(&self, attr: &Attr, entity: Uid, start_ts: Ts) -> Result<Vec<Posting>> {
        self.read(&keys::data_key(attr, entity), start_ts)
    }

    /// Stages `edge` and its index deltas in the transaction `start_ts`.
    ///
    /// After an error other than a validation failure the transaction should
    /// be aborted.
    pub fn mutate(&self, start_ts: Ts, edge: DirectedEdge) -> Result<()> {
        let handle = self.txn(start_ts)?;
        let mut txn = handle.lock();
        self.oracle.track_attr(start_ts, &edge.attr)?;
        if self.schema.is_rebuilding(&edge.attr) {
            return Err(UmbraError::PredicateBusy(edge.attr.to_string()));
        }
        let schema = self.schema.get(&edge.attr).ok_or_else(|| {
            UmbraError::SchemaViolation(format!("predicate [{}] has no schema", edge.attr))
        })?;
        apply_edge(&self.mutation_ctx(), &mut txn, &schema, &edge)?;
        Ok(())
    }

    /// Commits `start_ts`, returning its commit timestamp.
    ///
    /// Conflicts and duplicate unique values abort the transaction. The
    /// commit is durable once this returns.
    pub fn commit(&self, start_ts: Ts) -> Result<Ts> {
        let handle = self
            .txns
            .lock()
            .remove(&start_ts)
            .ok_or(UmbraError::TxnNotActive(start_ts))?;
        let txn = handle.lock();
        let decided = verify_unique(&self.mutation_ctx(), &txn).and_then(|()| {
            self.oracle.commit(CommitRequest {
                start_ts,
                conflict_keys: txn.conflict_keys(),
                claims: txn.claims(),
            })
        });
        let commit_ts = match decided {
            Ok(ts) => ts,
            Err(err) => {
                match &err {
                    UmbraError::Conflict { .. } => self.metrics.conflict(),
                    UmbraError::DuplicateValue { .. } => self.metrics.duplicate_value(),
                    _ => {}
                }
                self.oracle.abort(start_ts);
                rollback(&txn);
                self.metrics.txn_aborted();
                debug!(start_ts, error = %err, "commit rejected");
                return Err(err);
            }
        };

        let persisted = TxnWriter::try_new(
            self.kv.as_ref(),
            self.metrics.as_ref(),
            commit_ts,
            self.config.writer_options(),
        )
        .and_then(|mut writer| {
            for (_, list) in txn.lists() {
                list.read().commit_to_disk(start_ts, &mut writer);
            }
            writer.flush()
        });
        match persisted {
            Ok(stats) => {
                for (_, list) in txn.lists() {
                    list.write().promote(start_ts, commit_ts);
                }
                self.oracle.done(start_ts, commit_ts);
                self.metrics.txn_committed();
                debug!(start_ts, commit_ts, keys = stats.keys, "transaction committed");
                Ok(commit_ts)
            }
            Err(err) => {
                rollback(&txn);
                self.oracle.commit_failed(start_ts, commit_ts);
                self.metrics.txn_aborted();
                warn!(start_ts, commit_ts, error = %err, "commit could not be persisted");
                Err(err)
            }
        }
    }

    /// Discards every staged write of `start_ts`.
    pub fn abort(&self, start_ts: Ts) -> Result<()> {
        let handle = self
            .txns
            .lock()
            .remove(&start_ts)
            .ok_or(UmbraError::TxnNotActive(start_ts))?;
        rollback(&handle.lock());
        self.oracle.abort(start_ts);
        self.metrics.txn_aborted();
        debug!(start_ts, "transaction aborted");
        Ok(())
    }

    /// Aborts transactions older than `max_age` and returns their start
    /// timestamps.
    pub fn abort_stale(&self, max_age: Duration) -> Vec<Ts> {
        let mut aborted = Vec::new();
        for start_ts in self.oracle.stale(max_age) {
            if self.abort(start_ts).is_ok() {
                aborted.push(start_ts);
            }
        }
        if !aborted.is_empty() {
            info!(count = aborted.len(), "reclaimed stale transactions");
        }
        aborted
    }

    /// Aborts transactions older than the configured time to live.
    pub fn abort_expired(&self) -> Vec<Ts> {
        match self.config.txn_ttl_duration() {
            Some(ttl) => self.abort_stale(ttl),
            None => Vec::new(),
        }
    }

    /// Starts changing the schema of `attr` to `new`.
    ///
    /// Validates the descriptor, blocks mutations on `attr`, aborts active
    /// transactions that wrote it and returns the rebuild plan, compared
    /// against the live descriptor and reading at a fresh snapshot. The plan
    /// must be passed to [`Engine::execute_rebuild`], which installs the new
    /// descriptor.
    pub fn apply_schema_change(
        &self,
        attr: &Attr,
        new_schema: SchemaDescriptor,
    ) -> Result<IndexRebuild> {
        new_schema.validate(attr, &self.registry)?;
        self.schema.begin_rebuild(attr);
        for writer in self.oracle.mark_rebuilding(attr) {
            if self.abort(writer).is_ok() {
                info!(attr = %attr, start_ts = writer, "aborted writer for schema change");
            }
        }
        let start_ts = self.oracle.register_start_ts();
        self.oracle.wait_for_ts(start_ts);
        let plan = IndexRebuild {
            attr: attr.qualified(),
            start_ts,
            old_schema: self.schema.get(attr),
            new_schema,
        };
        info!(attr = %attr, start_ts, "schema change planned");
        Ok(plan)
    }

    /// Carries out `plan`, writing the new derived data and descriptor in one
    /// batch.
    ///
    /// On any failure the previous schema and indexes stay in effect and the
    /// change can be applied again.
    pub fn execute_rebuild(&self, plan: IndexRebuild, cancel: &CancelToken) -> Result<RebuildStats> {
        let attr = match Attr::parse(&plan.attr) {
            Ok(attr) => attr,
            Err(err) => {
                self.oracle.abort(plan.start_ts);
                return Err(err);
            }
        };
        let result = self.run_rebuild(&plan, &attr, cancel);
        self.oracle.abort(plan.start_ts);
        self.oracle.clear_rebuilding(&attr);
        self.schema.finish_rebuild(&attr);
        match result {
            Ok(stats) => Ok(stats),
            Err(UmbraError::Cancelled) => {
                info!(attr = %attr, "rebuild cancelled");
                Err(UmbraError::Cancelled)
            }
            Err(err @ UmbraError::Io(_)) => {
                warn!(attr = %attr, error = %err, "rebuild failed");
                Err(UmbraError::Rebuild {
                    attr: attr.to_string(),
                    source: Box::new(err),
                })
            }
            Err(err) => {
                warn!(attr = %attr, error = %err, "rebuild failed");
                Err(err)
            }
        }
    }

    fn run_rebuild(
        &self,
        plan: &IndexRebuild,
        attr: &Attr,
        cancel: &CancelToken,
    ) -> Result<RebuildStats> {
        let ctx = RebuildContext {
            kv: self.kv.as_ref(),
            cache: &self.cache,
            registry: &self.registry,
            batch_size: self.config.rebuild_batch_size,
            cancel,
        };
        let mut writer = TxnWriter::try_new(
            self.kv.as_ref(),
            self.metrics.as_ref(),
            plan.start_ts,
            self.config.writer_options(),
        )?;
        let stats = plan.execute(&ctx, &mut writer)?;
        let record = encode_descriptor(&plan.new_schema)?;
        writer.put(keys::schema_key(attr), record.meta, record.value);
        cancel.check()?;

        let write_ts = self.oracle.begin_internal();
        let applied = writer
            .advance_to(write_ts)
            .and_then(|()| writer.flush())
            .and_then(|_| self.drop_deleted_ranges(plan, attr));
        if applied.is_ok() {
            self.cache.invalidate_prefix(&keys::predicate_prefix(attr));
            self.schema.set(attr.clone(), plan.new_schema.clone());
        }
        self.oracle.finish_internal(write_ts);
        applied?;

        self.report_rebuilt(plan)?;
        info!(
            attr = %attr,
            write_ts,
            scanned = stats.scanned,
            written = stats.written,
            cleared = stats.cleared,
            "rebuild finished"
        );
        Ok(stats)
    }

    fn drop_deleted_ranges(&self, plan: &IndexRebuild, attr: &Attr) -> Result<()> {
        let tok = plan.needs_tok_index_rebuild();
        match tok.op {
            IndexOp::Delete => self.kv.drop_prefix(&keys::index_prefix(attr))?,
            IndexOp::Rebuild => {
                for name in &tok.tokenizers_to_delete {
                    if tok.tokenizers_to_rebuild.contains(name) {
                        continue;
                    }
                    if let Some(tokenizer) = self.registry.get(name) {
                        self.kv
                            .drop_prefix(&keys::tokenizer_prefix(attr, tokenizer.identifier()))?;
                    }
                }
            }
            IndexOp::Noop => {}
        }
        if plan.needs_reverse_edges_rebuild() == IndexOp::Delete {
            self.kv.drop_prefix(&keys::reverse_prefix(attr))?;
            self.kv.drop_prefix(&keys::count_prefix(attr, true))?;
        }
        if plan.needs_count_index_rebuild() == IndexOp::Delete {
            self.kv.drop_prefix(&keys::count_prefix(attr, false))?;
            self.kv.drop_prefix(&keys::count_prefix(attr, true))?;
        }
        Ok(())
    }

    fn report_rebuilt(&self, plan: &IndexRebuild) -> Result<()> {
        if plan.needs_tok_index_rebuild().op != IndexOp::Noop {
            self.metrics.rebuild_finished("token");
        }
        if plan.needs_reverse_edges_rebuild() != IndexOp::Noop {
            self.metrics.rebuild_finished("reverse");
        }
        if plan.needs_count_index_rebuild() != IndexOp::Noop {
            self.metrics.rebuild_finished("count");
        }
        if plan.needs_list_type_rebuild()? {
            self.metrics.rebuild_finished("list");
        }
        if plan.needs_value_type_rebuild() {
            self.metrics.rebuild_finished("type");
        }
        Ok(())
    }

    /// Applies a schema change and runs its rebuild to completion.
    pub fn alter(&self, attr: &Attr, new_schema: SchemaDescriptor) -> Result<RebuildStats> {
        let plan = self.apply_schema_change(attr, new_schema)?;
        self.execute_rebuild(plan, &CancelToken::new())
    }

    /// Parses schema text and applies every predicate it declares.
    pub fn alter_schema_text(&self, text: &str) -> Result<()> {
        for (attr, descriptor) in parse_schema(text, self.config.default_namespace)? {
            if self.schema.get(&attr).as_ref() == Some(&descriptor) {
                continue;
            }
            self.alter(&attr, descriptor)?;
        }
        Ok(())
    }

    /// Folds committed deltas below the watermark into complete versions,
    /// writes them back and forgets conflict history nobody can hit anymore.
    pub fn run_gc(&self) -> Result<GcStats> {
        let watermark = self.oracle.watermark();
        let mut stats = GcStats {
            watermark,
            ..GcStats::default()
        };
        for list in self.cache.lists_with_prefix(&[]) {
            let mut list = list.write();
            let Some((ts, postings)) = list.rollup(watermark) else {
                continue;
            };
            let mut writer = TxnWriter::try_new(
                self.kv.as_ref(),
                self.metrics.as_ref(),
                ts,
                self.config.writer_options(),
            )?;
            if postings.is_empty() {
                writer.put_empty(list.key().to_vec());
            } else {
                writer.put(list.key().to_vec(), BIT_COMPLETE, encode_postings(&postings));
            }
            writer.flush()?;
            self.kv.discard_below(list.key(), ts)?;
            stats.lists_rolled_up += 1;
        }
        stats.history_pruned = self.oracle.prune(watermark);
        debug!(
            watermark,
            lists = stats.lists_rolled_up,
            pruned = stats.history_pruned,
            "gc pass finished"
        );
        Ok(stats)
    }

    /// Entities indexed under `token` for `attr` at `read_ts`.
    pub fn uids_for_token(&self, attr: &Attr, token: &[u8], read_ts: Ts) -> Result<Vec<Uid>> {
        self.oracle.wait_for_ts(read_ts);
        let owner = self.owner(read_ts);
        self.cache
            .get_or_load(&keys::index_key(attr, token), self.kv.as_ref())?
            .read()
            .uids(read_ts, owner)
    }

    /// Entities whose value of `attr` equals `value` at `read_ts`, found
    /// through the predicate's index.
    pub fn eq(&self, attr: &Attr, value: impl Into<Value>, read_ts: Ts) -> Result<Vec<Uid>> {
        let schema = self.schema.get(attr).ok_or_else(|| {
            UmbraError::SchemaViolation(format!("predicate [{attr}] has no schema"))
        })?;
        let tokenizer = schema
            .tokenizers
            .iter()
            .filter_map(|name| self.registry.get(name))
            .min_by_key(|t| t.is_lossy())
            .filter(|_| schema.index)
            .ok_or_else(|| {
                UmbraError::SchemaViolation(format!("predicate [{attr}] is not indexed"))
            })?;
        let wanted: Value = value.into();
        let wanted = wanted.convert_to(schema.value_type)?;
        let mut candidates: Option<Vec<Uid>> = None;
        for token in build_tokens(tokenizer.as_ref(), &wanted, "")? {
            let uids = self.uids_for_token(attr, &token, read_ts)?;
            candidates = Some(match candidates {
                None => uids,
                Some(prev) => prev.into_iter().filter(|u| uids.contains(u)).collect(),
            });
        }
        let mut matches = Vec::new();
        for uid in candidates.unwrap_or_default() {
            let postings = self.read_attr(attr, uid, read_ts)?;
            if postings.iter().any(|p| p.value == wanted) {
                matches.push(uid);
            }
        }
        Ok(matches)
    }

    /// Aborts every active transaction and syncs the store.
    pub fn close(self) -> Result<()> {
        let active: Vec<Ts> = self.txns.lock().keys().copied().collect();
        for start_ts in active {
            self.abort(start_ts)?;
        }
        self.kv.sync()?;
        info!("engine closed");
        Ok(())
    }
}

fn rollback(txn: &Txn) {
    for (_, list) in txn.lists() {
        list.write().rollback(txn.start_ts());
    }
}
