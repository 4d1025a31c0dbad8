//! Index maintenance: live deltas for every mutation and full rebuilds after
//! schema changes.

use tracing::trace;

use crate::posting::list::MutationEffect;
use crate::posting::{posting_id, DirectedEdge, Posting, PostingCache, PostingOp};
use crate::schema::SchemaDescriptor;
use crate::storage::keys;
use crate::storage::KvStore;
use crate::tok::{build_tokens, lang, Tokens, TokenizerRegistry};
use crate::txn::{Txn, UniqueClaim};
use crate::types::{Attr, Result, Uid, UmbraError, Value};

pub mod rebuild;

pub use rebuild::{IndexOp, IndexRebuild, RebuildContext, RebuildStats, TokIndexRebuildInfo};

/// Collaborators needed to stage one mutation.
pub struct MutationContext<'a> {
    /// Durable store backing cache misses.
    pub kv: &'a dyn KvStore,
    /// Shared posting list cache.
    pub cache: &'a PostingCache,
    /// Tokenizers named by schemas.
    pub registry: &'a TokenizerRegistry,
}

/// Converts and checks `edge` against `schema`, returning the stored value.
pub fn validate_edge(edge: &DirectedEdge, schema: &SchemaDescriptor) -> Result<Value> {
    let attr = &edge.attr;
    if !edge.lang.is_empty() && !schema.lang {
        return Err(UmbraError::SchemaViolation(format!(
            "predicate [{attr}] does not accept language tags"
        )));
    }
    match (&edge.value, schema.is_uid()) {
        (Value::Uid(_), true) => Ok(edge.value.clone()),
        (_, true) => Err(UmbraError::SchemaViolation(format!(
            "predicate [{attr}] expects a uid, got [{}]",
            edge.value
        ))),
        (Value::Uid(_), false) => Err(UmbraError::SchemaViolation(format!(
            "predicate [{attr}] expects a {} value, got a uid",
            schema.value_type
        ))),
        (value, false) => value.convert_to(schema.value_type),
    }
}

/// Stages `edge` and every index delta it implies in `txn`'s layers.
pub fn apply_edge(
    ctx: &MutationContext<'_>,
    txn: &mut Txn,
    schema: &SchemaDescriptor,
    edge: &DirectedEdge,
) -> Result<MutationEffect> {
    let start_ts = txn.start_ts();
    let attr = &edge.attr;
    let data_key = keys::data_key(attr, edge.entity);
    let list = ctx.cache.get_or_load(&data_key, ctx.kv)?;
    txn.touch(&data_key, &list);
    txn.add_conflict_key(&data_key);

    let (effect, added) = if edge.is_delete_all() {
        (list.write().delete_all(start_ts)?, None)
    } else {
        let value = validate_edge(edge, schema)?;
        let posting = Posting {
            id: posting_id(&value, &edge.lang, schema.list),
            value,
            lang: edge.lang.clone(),
            op: edge.op,
            facets: edge.facets.clone(),
        };
        if posting.op == PostingOp::Set && schema.unique {
            if let Some(claim) = unique_claim(ctx.registry, schema, attr, edge.entity, &posting)? {
                txn.claim_unique(claim);
            }
        }
        let added = (posting.op == PostingOp::Set).then(|| posting.clone());
        (
            list.write()
                .add_mutation(start_ts, posting, schema.is_single_uid())?,
            added,
        )
    };
    trace!(
        attr = %attr,
        entity = %edge.entity,
        displaced = effect.displaced.len(),
        "staged mutation"
    );
    if !effect.applied {
        return Ok(effect);
    }

    for old in &effect.displaced {
        if schema.unique {
            if let Some(claim) = unique_claim(ctx.registry, schema, attr, edge.entity, old)? {
                txn.release_unique(&claim);
            }
        }
        update_derived(ctx, txn, schema, attr, edge.entity, old, PostingOp::Del)?;
    }
    if let Some(new) = &added {
        update_derived(ctx, txn, schema, attr, edge.entity, new, PostingOp::Set)?;
    }
    if schema.count && effect.count_before != effect.count_after {
        update_count(ctx, txn, attr, edge.entity, &effect, false)?;
    }
    Ok(effect)
}

/// Index tokens of `posting` for every tokenizer of `schema`.
pub fn tokens_for(
    registry: &TokenizerRegistry,
    schema: &SchemaDescriptor,
    tokenizers: &[String],
    posting: &Posting,
) -> Result<Tokens> {
    let mut all = Tokens::new();
    if schema.is_uid() {
        return Ok(all);
    }
    for name in tokenizers {
        let tokenizer = registry.get(name).ok_or_else(|| {
            UmbraError::SchemaViolation(format!("unknown tokenizer [{name}]"))
        })?;
        all.extend(build_tokens(tokenizer.as_ref(), &posting.value, &posting.lang)?);
    }
    Ok(all)
}

/// The claim `entity` makes by holding `posting` on a unique predicate.
///
/// Tagged values are claimed per base language, so one text may be held
/// once under each language.
fn unique_claim(
    registry: &TokenizerRegistry,
    schema: &SchemaDescriptor,
    attr: &Attr,
    entity: Uid,
    posting: &Posting,
) -> Result<Option<UniqueClaim>> {
    let Some(name) = schema.unique_tokenizer() else {
        return Ok(None);
    };
    let tokenizer = registry
        .get(name)
        .ok_or(UmbraError::Invalid("unique tokenizer missing from registry"))?;
    let token = build_tokens(tokenizer.as_ref(), &posting.value, &posting.lang)?
        .into_iter()
        .next();
    Ok(token.map(|token| UniqueClaim {
        attr: attr.clone(),
        token,
        lang: lang::base(&posting.lang),
        entity,
        value: posting.value.to_string(),
    }))
}

/// Checks the unique claims of `txn` against its final staged state.
///
/// A value may be claimed by one entity only, and no other entity indexed
/// under a claimed token, read with the transaction's own deltas, may hold
/// the value in the same language. Values committed by others after the
/// snapshot are left to the oracle.
pub fn verify_unique(ctx: &MutationContext<'_>, txn: &Txn) -> Result<()> {
    if let Some(claim) = txn.contested_claim() {
        return Err(claim.duplicate_error());
    }
    let start_ts = txn.start_ts();
    for claim in txn.claims() {
        let owners = ctx
            .cache
            .get_or_load(&keys::index_key(&claim.attr, &claim.token), ctx.kv)?
            .read()
            .uids(start_ts, Some(start_ts))?;
        for owner in owners.into_iter().filter(|owner| *owner != claim.entity) {
            let held = ctx
                .cache
                .get_or_load(&keys::data_key(&claim.attr, owner), ctx.kv)?
                .read()
                .read(start_ts, Some(start_ts))?;
            let same = held.iter().any(|posting| {
                lang::base(&posting.lang) == claim.lang && posting.value.to_string() == claim.value
            });
            if same {
                return Err(claim.duplicate_error());
            }
        }
    }
    Ok(())
}

fn stage_uid(
    ctx: &MutationContext<'_>,
    txn: &mut Txn,
    key: Vec<u8>,
    uid: Uid,
    op: PostingOp,
    conflict: bool,
) -> Result<MutationEffect> {
    let list = ctx.cache.get_or_load(&key, ctx.kv)?;
    let effect = list
        .write()
        .add_mutation(txn.start_ts(), Posting::uid(uid, op), false)?;
    txn.touch(&key, &list);
    if conflict {
        txn.add_conflict_key(&key);
    }
    Ok(effect)
}

fn update_derived(
    ctx: &MutationContext<'_>,
    txn: &mut Txn,
    schema: &SchemaDescriptor,
    attr: &Attr,
    entity: Uid,
    posting: &Posting,
    op: PostingOp,
) -> Result<()> {
    if schema.index {
        for token in tokens_for(ctx.registry, schema, &schema.tokenizers, posting)? {
            let key = keys::index_key(attr, &token);
            stage_uid(ctx, txn, key, entity, op, schema.upsert)?;
        }
    }
    if schema.reverse {
        if let Some(target) = posting.target() {
            let key = keys::reverse_key(attr, target);
            let effect = stage_uid(ctx, txn, key, entity, op, false)?;
            if schema.counts_reverse() && effect.count_before != effect.count_after {
                update_count(ctx, txn, attr, target, &effect, true)?;
            }
        }
    }
    Ok(())
}

fn update_count(
    ctx: &MutationContext<'_>,
    txn: &mut Txn,
    attr: &Attr,
    uid: Uid,
    effect: &MutationEffect,
    reverse: bool,
) -> Result<()> {
    if effect.count_before > 0 {
        let key = keys::count_key(attr, count_u32(effect.count_before), reverse);
        stage_uid(ctx, txn, key, uid, PostingOp::Del, false)?;
    }
    if effect.count_after > 0 {
        let key = keys::count_key(attr, count_u32(effect.count_after), reverse);
        stage_uid(ctx, txn, key, uid, PostingOp::Set, false)?;
    }
    Ok(())
}

pub(crate) fn count_u32(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
