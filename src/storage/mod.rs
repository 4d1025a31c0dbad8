//! Durable storage plumbing.
//!
//! Defines the byte-comparable key layout, the multi-version key-value
//! collaborator, the batched commit writer and engine metrics.

/// Key layout and key parsing.
pub mod keys;

/// Durable key-value collaborator.
///
/// The [`KvStore`] trait plus an in-memory versioned implementation.
pub mod kv;

mod metrics;
mod writer;

/// Metrics and instrumentation.
pub use metrics::{default_metrics, CounterMetrics, EngineMetrics, NoopMetrics};

/// Store records and the collaborator trait.
pub use kv::{
    KvEntry, KvStore, MemKvStore, ScanVisitor, StoredRecord, BIT_COMPLETE, BIT_DELTA, BIT_EMPTY,
    BIT_SCHEMA,
};

/// Batched commit writer.
pub use writer::{TxnWriter, WriterOptions, WriterStats};
