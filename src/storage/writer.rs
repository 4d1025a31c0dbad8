use std::thread;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::warn;

use super::keys::display_key;
use super::kv::{KvEntry, KvStore, StoredRecord, BIT_EMPTY};
use super::metrics::EngineMetrics;
use crate::types::{Result, Ts, UmbraError};

/// Options controlling how [`TxnWriter`] persists a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriterOptions {
    /// Retries after a transient I/O failure before the error surfaces.
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub retry_backoff: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

/// Aggregate statistics captured by [`TxnWriter::flush`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriterStats {
    /// Distinct keys written.
    pub keys: usize,
    /// Retries performed before the batch landed.
    pub retries: u32,
}

/// Batched writer that persists every record of one commit at a single timestamp.
pub struct TxnWriter<'a> {
    kv: &'a dyn KvStore,
    metrics: &'a dyn EngineMetrics,
    commit_ts: Ts,
    opts: WriterOptions,
    entries: Vec<KvEntry>,
    slots: FxHashMap<Vec<u8>, usize>,
}

impl<'a> TxnWriter<'a> {
    /// Creates a writer stamping every record with `commit_ts`.
    pub fn try_new(
        kv: &'a dyn KvStore,
        metrics: &'a dyn EngineMetrics,
        commit_ts: Ts,
        opts: WriterOptions,
    ) -> Result<Self> {
        if commit_ts == 0 {
            return Err(UmbraError::Invalid("commit timestamp zero is reserved"));
        }
        Ok(Self {
            kv,
            metrics,
            commit_ts,
            opts,
            entries: Vec::new(),
            slots: FxHashMap::default(),
        })
    }

    /// Timestamp every record in the batch is written at.
    pub fn commit_ts(&self) -> Ts {
        self.commit_ts
    }

    /// Moves the staged batch to a later timestamp before it is flushed.
    pub fn advance_to(&mut self, commit_ts: Ts) -> Result<()> {
        if commit_ts < self.commit_ts {
            return Err(UmbraError::Invalid("writer timestamp cannot move backwards"));
        }
        self.commit_ts = commit_ts;
        Ok(())
    }

    /// Stages a record; a later record for the same key replaces it.
    pub fn put(&mut self, key: Vec<u8>, meta: u8, value: Vec<u8>) {
        let record = StoredRecord { meta, value };
        if let Some(&slot) = self.slots.get(&key) {
            self.entries[slot].record = record;
            return;
        }
        self.slots.insert(key.clone(), self.entries.len());
        self.entries.push(KvEntry { key, record });
    }

    /// Stages an empty-list marker for `key`.
    pub fn put_empty(&mut self, key: Vec<u8>) {
        self.put(key, BIT_EMPTY, Vec::new());
    }

    /// Number of staged keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the batch atomically and waits for durability, retrying
    /// transient I/O failures with exponential backoff.
    pub fn flush(self) -> Result<WriterStats> {
        let mut stats = WriterStats {
            keys: self.entries.len(),
            retries: 0,
        };
        if self.entries.is_empty() {
            return Ok(stats);
        }
        let first_key = display_key(&self.entries[0].key);
        stats.retries += self.retrying("write_batch", &first_key, || {
            self.kv.write_batch(&self.entries, self.commit_ts)
        })?;
        stats.retries += self.retrying("sync", &first_key, || self.kv.sync())?;
        Ok(stats)
    }

    fn retrying(
        &self,
        op: &'static str,
        first_key: &str,
        mut f: impl FnMut() -> Result<()>,
    ) -> Result<u32> {
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(()) => return Ok(attempt),
                Err(err) if err.is_transient_io() && attempt < self.opts.retry_attempts => {
                    let delay = self
                        .opts
                        .retry_backoff
                        .saturating_mul(1u32 << attempt.min(16));
                    warn!(
                        op,
                        commit_ts = self.commit_ts,
                        attempt = attempt + 1,
                        first_key,
                        error = %err,
                        "retrying store write"
                    );
                    self.metrics.write_retry();
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
