use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use super::UniqueClaim;
use crate::primitives::concurrency::AtomicCounter;
use crate::types::{Attr, Result, Ts, Uid, UmbraError};

/// Lifecycle state of a transaction known to the oracle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnStatus {
    /// Accepting reads and mutations.
    Active,
    /// Passed the commit check; its writes are being persisted.
    Committing(Ts),
}

#[derive(Debug)]
struct ActiveTxn {
    started: Instant,
    status: TxnStatus,
    attrs: FxHashSet<Attr>,
}

#[derive(Clone, Debug)]
struct ClaimRecord {
    commit_ts: Ts,
    entity: Uid,
}

#[derive(Debug, Default)]
struct OracleState {
    active: BTreeMap<Ts, ActiveTxn>,
    history: FxHashMap<u64, Ts>,
    claims: FxHashMap<u64, ClaimRecord>,
    pending: BTreeSet<Ts>,
    rebuilding: FxHashSet<Attr>,
}

/// Input to [`Oracle::commit`].
#[derive(Clone, Copy, Debug)]
pub struct CommitRequest<'a> {
    /// Start timestamp of the committing transaction.
    pub start_ts: Ts,
    /// Fingerprints of every key the transaction wrote that can conflict.
    pub conflict_keys: &'a FxHashSet<u64>,
    /// Unique values the transaction claims.
    pub claims: &'a [UniqueClaim],
}

/// Issues timestamps, arbitrates commits and tracks the gc watermark.
///
/// Start and commit timestamps come from one counter. The conflict check,
/// the uniqueness check and commit timestamp allocation happen under a single
/// lock that never covers I/O; persisting a commit happens afterwards, between
/// [`Oracle::commit`] and [`Oracle::done`].
#[derive(Debug)]
pub struct Oracle {
    clock: AtomicCounter,
    state: Mutex<OracleState>,
    applied: Condvar,
}

impl Oracle {
    /// Oracle whose first timestamp follows `last_ts`.
    pub fn new(last_ts: Ts) -> Self {
        Self {
            clock: AtomicCounter::new(last_ts),
            state: Mutex::new(OracleState::default()),
            applied: Condvar::new(),
        }
    }

    /// Allocates a start timestamp and records an active transaction.
    pub fn register_start_ts(&self) -> Ts {
        let mut state = self.state.lock();
        let ts = self.clock.next();
        state.active.insert(
            ts,
            ActiveTxn {
                started: Instant::now(),
                status: TxnStatus::Active,
                attrs: FxHashSet::default(),
            },
        );
        ts
    }

    /// Status of the transaction started at `start_ts`.
    pub fn status(&self, start_ts: Ts) -> Option<TxnStatus> {
        self.state.lock().active.get(&start_ts).map(|t| t.status)
    }

    /// Records that `start_ts` wrote to `attr`.
    ///
    /// Fails with [`UmbraError::PredicateBusy`] while `attr` is being rebuilt.
    pub fn track_attr(&self, start_ts: Ts, attr: &Attr) -> Result<()> {
        let mut state = self.state.lock();
        if state.rebuilding.contains(attr) {
            return Err(UmbraError::PredicateBusy(attr.to_string()));
        }
        match state.active.get_mut(&start_ts) {
            Some(txn) if txn.status == TxnStatus::Active => {
                if !txn.attrs.contains(attr) {
                    txn.attrs.insert(attr.clone());
                }
                Ok(())
            }
            _ => Err(UmbraError::TxnNotActive(start_ts)),
        }
    }

    /// Decides the commit of one transaction.
    ///
    /// Fails with [`UmbraError::PredicateBusy`] when the transaction wrote a
    /// predicate marked by [`Oracle::mark_rebuilding`], with
    /// [`UmbraError::DuplicateValue`] when a claimed unique value was committed
    /// for another entity after `start_ts`, and otherwise with
    /// [`UmbraError::Conflict`] when any conflict key was committed after
    /// `start_ts` (first committer wins). Every failure removes the
    /// transaction. On success the commit timestamp stays pending until
    /// [`Oracle::done`] or [`Oracle::commit_failed`].
    pub fn commit(&self, req: CommitRequest<'_>) -> Result<Ts> {
        let mut state = self.state.lock();
        let busy = match state.active.get(&req.start_ts) {
            Some(txn) if txn.status == TxnStatus::Active => txn
                .attrs
                .iter()
                .find(|attr| state.rebuilding.contains(*attr))
                .cloned(),
            _ => return Err(UmbraError::TxnNotActive(req.start_ts)),
        };
        if let Some(attr) = busy {
            state.active.remove(&req.start_ts);
            debug!(start_ts = req.start_ts, %attr, "commit blocked by index rebuild");
            return Err(UmbraError::PredicateBusy(attr.to_string()));
        }
        for claim in req.claims {
            if let Some(existing) = state.claims.get(&claim.fingerprint()) {
                if existing.commit_ts > req.start_ts && existing.entity != claim.entity {
                    state.active.remove(&req.start_ts);
                    return Err(claim.duplicate_error());
                }
            }
        }
        let conflicted = req
            .conflict_keys
            .iter()
            .any(|key| state.history.get(key).map_or(false, |&ts| ts > req.start_ts));
        if conflicted {
            state.active.remove(&req.start_ts);
            debug!(start_ts = req.start_ts, "commit conflict");
            return Err(UmbraError::Conflict {
                start_ts: req.start_ts,
            });
        }
        let commit_ts = self.clock.next();
        for key in req.conflict_keys {
            state.history.insert(*key, commit_ts);
        }
        for claim in req.claims {
            state.claims.insert(
                claim.fingerprint(),
                ClaimRecord {
                    commit_ts,
                    entity: claim.entity,
                },
            );
        }
        state.pending.insert(commit_ts);
        if let Some(txn) = state.active.get_mut(&req.start_ts) {
            txn.status = TxnStatus::Committing(commit_ts);
        }
        Ok(commit_ts)
    }

    /// Marks the commit at `commit_ts` applied and retires its transaction.
    pub fn done(&self, start_ts: Ts, commit_ts: Ts) {
        let mut state = self.state.lock();
        state.active.remove(&start_ts);
        state.pending.remove(&commit_ts);
        self.applied.notify_all();
    }

    /// Retires a transaction whose commit could not be persisted.
    ///
    /// Unique claims made by the commit are withdrawn.
    pub fn commit_failed(&self, start_ts: Ts, commit_ts: Ts) {
        let mut state = self.state.lock();
        state.claims.retain(|_, claim| claim.commit_ts != commit_ts);
        state.active.remove(&start_ts);
        state.pending.remove(&commit_ts);
        self.applied.notify_all();
    }

    /// Retires an active transaction; returns `false` if it was not active.
    pub fn abort(&self, start_ts: Ts) -> bool {
        let mut state = self.state.lock();
        match state.active.get(&start_ts).map(|t| t.status) {
            Some(TxnStatus::Active) => {
                state.active.remove(&start_ts);
                true
            }
            _ => false,
        }
    }

    /// Allocates a timestamp for an engine-internal write, pending until
    /// [`Oracle::finish_internal`].
    pub fn begin_internal(&self) -> Ts {
        let mut state = self.state.lock();
        let ts = self.clock.next();
        state.pending.insert(ts);
        ts
    }

    /// Releases a timestamp from [`Oracle::begin_internal`].
    pub fn finish_internal(&self, ts: Ts) {
        self.state.lock().pending.remove(&ts);
        self.applied.notify_all();
    }

    /// Blocks until every commit with a timestamp `<= read_ts` is applied.
    pub fn wait_for_ts(&self, read_ts: Ts) {
        let mut state = self.state.lock();
        while state
            .pending
            .first()
            .map_or(false, |&pending| pending <= read_ts)
        {
            self.applied.wait(&mut state);
        }
    }

    /// Oldest start timestamp among active transactions, or the last issued
    /// timestamp when none is active.
    pub fn watermark(&self) -> Ts {
        let state = self.state.lock();
        state
            .active
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.clock.current())
    }

    /// Forgets conflict history and unique claims at or below `watermark`.
    pub fn prune(&self, watermark: Ts) -> usize {
        let mut state = self.state.lock();
        let before = state.history.len() + state.claims.len();
        state.history.retain(|_, ts| *ts > watermark);
        state.claims.retain(|_, claim| claim.commit_ts > watermark);
        before - state.history.len() - state.claims.len()
    }

    /// Active transactions older than `max_age` that have not started committing.
    pub fn stale(&self, max_age: Duration) -> Vec<Ts> {
        let state = self.state.lock();
        state
            .active
            .iter()
            .filter(|(_, txn)| txn.status == TxnStatus::Active && txn.started.elapsed() >= max_age)
            .map(|(ts, _)| *ts)
            .collect()
    }

    /// Marks `attr` as under rebuild and returns the active transactions that
    /// wrote it.
    ///
    /// Until [`Oracle::clear_rebuilding`], those writers and any new ones fail
    /// to commit. Transactions already committing are left alone; their
    /// timestamps stay pending, so a later [`Oracle::wait_for_ts`] drains them.
    pub fn mark_rebuilding(&self, attr: &Attr) -> Vec<Ts> {
        let mut state = self.state.lock();
        state.rebuilding.insert(attr.clone());
        state
            .active
            .iter()
            .filter(|(_, txn)| txn.status == TxnStatus::Active && txn.attrs.contains(attr))
            .map(|(ts, _)| *ts)
            .collect()
    }

    /// Lifts the mark set by [`Oracle::mark_rebuilding`].
    pub fn clear_rebuilding(&self, attr: &Attr) {
        self.state.lock().rebuilding.remove(attr);
    }

    /// Number of active transactions.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Last timestamp handed out.
    pub fn max_assigned(&self) -> Ts {
        self.clock.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn keys(items: &[u64]) -> FxHashSet<u64> {
        items.iter().copied().collect()
    }

    fn request<'a>(start_ts: Ts, keys: &'a FxHashSet<u64>) -> CommitRequest<'a> {
        CommitRequest {
            start_ts,
            conflict_keys: keys,
            claims: &[],
        }
    }

    #[test]
    fn first_committer_wins_on_shared_key() -> Result<()> {
        let oracle = Oracle::new(0);
        let a = oracle.register_start_ts();
        let b = oracle.register_start_ts();
        let shared = keys(&[7]);
        let commit_a = oracle.commit(request(a, &shared))?;
        oracle.done(a, commit_a);
        assert!(matches!(
            oracle.commit(request(b, &shared)),
            Err(UmbraError::Conflict { .. })
        ));
        assert_eq!(oracle.active_count(), 0);
        Ok(())
    }

    #[test]
    fn disjoint_keys_both_commit() -> Result<()> {
        let oracle = Oracle::new(0);
        let a = oracle.register_start_ts();
        let b = oracle.register_start_ts();
        let ka = keys(&[1]);
        let kb = keys(&[2]);
        let ca = oracle.commit(request(a, &ka))?;
        let cb = oracle.commit(request(b, &kb))?;
        assert!(cb > ca);
        oracle.done(b, cb);
        oracle.done(a, ca);
        Ok(())
    }

    #[test]
    fn later_start_does_not_conflict_with_earlier_commit() -> Result<()> {
        let oracle = Oracle::new(0);
        let a = oracle.register_start_ts();
        let k = keys(&[1]);
        let ca = oracle.commit(request(a, &k))?;
        oracle.done(a, ca);
        let b = oracle.register_start_ts();
        assert!(oracle.commit(request(b, &k)).is_ok());
        Ok(())
    }

    #[test]
    fn unique_claims_are_checked_with_conflicts() -> Result<()> {
        let oracle = Oracle::new(0);
        let a = oracle.register_start_ts();
        let b = oracle.register_start_ts();
        let claim = |entity| UniqueClaim {
            attr: Attr::root("email"),
            token: b"\x02x@example.com".to_vec(),
            lang: String::new(),
            entity: Uid(entity),
            value: "x@example.com".into(),
        };
        let none = FxHashSet::default();
        let ca = oracle.commit(CommitRequest {
            start_ts: a,
            conflict_keys: &none,
            claims: &[claim(1)],
        })?;
        oracle.done(a, ca);
        let err = oracle
            .commit(CommitRequest {
                start_ts: b,
                conflict_keys: &none,
                claims: &[claim(2)],
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "could not insert duplicate value [x@example.com] for predicate [email]"
        );
        Ok(())
    }

    #[test]
    fn watermark_tracks_oldest_active() {
        let oracle = Oracle::new(10);
        let a = oracle.register_start_ts();
        let b = oracle.register_start_ts();
        assert_eq!(oracle.watermark(), a);
        oracle.abort(a);
        assert_eq!(oracle.watermark(), b);
        oracle.abort(b);
        assert_eq!(oracle.watermark(), oracle.max_assigned());
        assert!(!oracle.abort(b));
    }

    #[test]
    fn wait_for_ts_blocks_until_applied() -> Result<()> {
        let oracle = Arc::new(Oracle::new(0));
        let a = oracle.register_start_ts();
        let k = keys(&[1]);
        let commit_ts = oracle.commit(request(a, &k))?;
        let reader = {
            let oracle = Arc::clone(&oracle);
            thread::spawn(move || {
                oracle.wait_for_ts(commit_ts);
                oracle.status(a)
            })
        };
        thread::sleep(Duration::from_millis(20));
        oracle.done(a, commit_ts);
        assert_eq!(reader.join().expect("reader"), None);
        Ok(())
    }

    #[test]
    fn prune_drops_old_history() -> Result<()> {
        let oracle = Oracle::new(0);
        let a = oracle.register_start_ts();
        let k = keys(&[1, 2]);
        let ca = oracle.commit(request(a, &k))?;
        oracle.done(a, ca);
        assert_eq!(oracle.prune(oracle.watermark()), 2);
        Ok(())
    }

    #[test]
    fn mark_rebuilding_reports_active_writers() -> Result<()> {
        let oracle = Oracle::new(0);
        let a = oracle.register_start_ts();
        let attr = Attr::root("name");
        oracle.track_attr(a, &attr)?;
        assert_eq!(oracle.mark_rebuilding(&attr), vec![a]);
        assert!(oracle.stale(Duration::ZERO).contains(&a));
        oracle.clear_rebuilding(&attr);
        oracle.abort(a);
        assert!(oracle.track_attr(a, &attr).is_err());
        Ok(())
    }

    #[test]
    fn writer_of_a_rebuilding_predicate_cannot_commit() -> Result<()> {
        let oracle = Oracle::new(0);
        let attr = Attr::root("name");
        let early = oracle.register_start_ts();
        let late = oracle.register_start_ts();
        let bystander = oracle.register_start_ts();
        oracle.track_attr(early, &attr)?;
        oracle.track_attr(bystander, &Attr::root("age"))?;

        oracle.mark_rebuilding(&attr);
        let none = FxHashSet::default();
        assert!(matches!(
            oracle.commit(request(early, &none)),
            Err(UmbraError::PredicateBusy(_))
        ));
        assert_eq!(oracle.status(early), None);
        assert!(matches!(
            oracle.track_attr(late, &attr),
            Err(UmbraError::PredicateBusy(_))
        ));
        let ts = oracle.commit(request(bystander, &none))?;
        oracle.done(bystander, ts);

        oracle.clear_rebuilding(&attr);
        oracle.track_attr(late, &attr)?;
        let ts = oracle.commit(request(late, &none))?;
        oracle.done(late, ts);
        Ok(())
    }

    #[test]
    fn commit_that_passed_before_the_mark_is_drained() -> Result<()> {
        let oracle = Arc::new(Oracle::new(0));
        let attr = Attr::root("name");
        let writer = oracle.register_start_ts();
        oracle.track_attr(writer, &attr)?;
        let none = FxHashSet::default();
        let commit_ts = oracle.commit(request(writer, &none))?;

        assert!(oracle.mark_rebuilding(&attr).is_empty());
        let rebuild_ts = oracle.register_start_ts();
        assert!(rebuild_ts > commit_ts);
        let waiter = {
            let oracle = Arc::clone(&oracle);
            thread::spawn(move || {
                oracle.wait_for_ts(rebuild_ts);
                oracle.status(writer)
            })
        };
        thread::sleep(Duration::from_millis(20));
        oracle.done(writer, commit_ts);
        assert_eq!(waiter.join().expect("waiter"), None);
        Ok(())
    }
}
