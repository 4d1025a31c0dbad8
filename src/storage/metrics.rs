use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking transaction, index and cache activity in the engine.
///
/// Implementations collect statistics about commits, conflicts, write retries
/// and cache behaviour. The engine calls these hooks from hot paths, so
/// implementations must be cheap and thread-safe.
pub trait EngineMetrics: Send + Sync {
    /// Records a transaction receiving its start timestamp.
    fn txn_started(&self);

    /// Records a successful commit.
    fn txn_committed(&self);

    /// Records an explicit, stale or failed-commit abort.
    fn txn_aborted(&self);

    /// Records a write-write conflict detected at commit.
    fn conflict(&self);

    /// Records a uniqueness violation.
    fn duplicate_value(&self);

    /// Records a retried durable-store write.
    fn write_retry(&self);

    /// Records a completed index rebuild.
    ///
    /// # Parameters
    /// * `kind` - Which index was rebuilt: "token", "reverse", "count" or "list".
    fn rebuild_finished(&self, kind: &'static str);

    /// Records a posting list cache lookup.
    fn cache_lookup(&self, hit: bool);
}

/// A no-op implementation of [`EngineMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl EngineMetrics for NoopMetrics {
    fn txn_started(&self) {}
    fn txn_committed(&self) {}
    fn txn_aborted(&self) {}
    fn conflict(&self) {}
    fn duplicate_value(&self) {}
    fn write_retry(&self) {}
    fn rebuild_finished(&self, _kind: &'static str) {}
    fn cache_lookup(&self, _hit: bool) {}
}

/// A thread-safe counter-based implementation of [`EngineMetrics`].
///
/// All counters use relaxed atomics and can be read concurrently while the
/// engine runs.
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of transactions started.
    pub txns_started: AtomicU64,

    /// Number of transactions committed.
    pub txns_committed: AtomicU64,

    /// Number of transactions aborted.
    pub txns_aborted: AtomicU64,

    /// Number of commits rejected with a conflict.
    pub conflicts: AtomicU64,

    /// Number of uniqueness violations.
    pub duplicate_values: AtomicU64,

    /// Number of retried store writes.
    pub write_retries: AtomicU64,

    /// Number of token index rebuilds.
    pub token_rebuilds: AtomicU64,

    /// Number of reverse edge rebuilds.
    pub reverse_rebuilds: AtomicU64,

    /// Number of count index rebuilds.
    pub count_rebuilds: AtomicU64,

    /// Number of list-type rebuilds.
    pub list_rebuilds: AtomicU64,

    /// Number of cache hits.
    pub cache_hits: AtomicU64,

    /// Number of cache misses.
    pub cache_misses: AtomicU64,
}

impl EngineMetrics for CounterMetrics {
    fn txn_started(&self) {
        self.txns_started.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_committed(&self) {
        self.txns_committed.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_aborted(&self) {
        self.txns_aborted.fetch_add(1, Ordering::Relaxed);
    }

    fn conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn duplicate_value(&self) {
        self.duplicate_values.fetch_add(1, Ordering::Relaxed);
    }

    fn write_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn rebuild_finished(&self, kind: &'static str) {
        match kind {
            "token" => {
                self.token_rebuilds.fetch_add(1, Ordering::Relaxed);
            }
            "reverse" => {
                self.reverse_rebuilds.fetch_add(1, Ordering::Relaxed);
            }
            "count" => {
                self.count_rebuilds.fetch_add(1, Ordering::Relaxed);
            }
            "list" => {
                self.list_rebuilds.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn EngineMetrics> {
    Arc::new(NoopMetrics)
}
