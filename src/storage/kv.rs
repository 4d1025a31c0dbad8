//! Durable key-value collaborator and its in-memory versioned implementation.

use std::collections::BTreeMap;
use std::io;
use std::ops::{Bound, ControlFlow};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::types::{Result, Ts, UmbraError};

/// Record holds a schema descriptor.
pub const BIT_SCHEMA: u8 = 0x01;
/// Record holds postings layered on top of older versions.
pub const BIT_DELTA: u8 = 0x04;
/// Record holds the full posting list; older versions are not needed.
pub const BIT_COMPLETE: u8 = 0x08;
/// Record marks the posting list empty without deleting the key.
pub const BIT_EMPTY: u8 = 0x10 | BIT_COMPLETE;

/// One stored version of a key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredRecord {
    /// User metadata byte (`BIT_*`).
    pub meta: u8,
    /// Serialized record payload.
    pub value: Vec<u8>,
}

impl StoredRecord {
    /// Returns `true` for the empty-list tombstone marker.
    pub fn is_empty_marker(&self) -> bool {
        self.meta & BIT_EMPTY == BIT_EMPTY
    }

    /// Returns `true` when older versions are not needed to read this key.
    pub fn is_complete(&self) -> bool {
        self.meta & BIT_COMPLETE != 0
    }
}

/// One entry in an atomic write batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KvEntry {
    /// Target key.
    pub key: Vec<u8>,
    /// Record written at the batch timestamp.
    pub record: StoredRecord,
}

/// Visitor invoked by [`KvStore::scan`] with the newest version at or below the scan timestamp.
pub type ScanVisitor<'a> = dyn FnMut(&[u8], Ts, &StoredRecord) -> Result<ControlFlow<()>> + 'a;

/// Multi-version key-value store consumed by the engine.
///
/// Versions are keyed by timestamp; a read at `at` sees the newest version
/// whose timestamp is `<= at`.
pub trait KvStore: Send + Sync {
    /// Newest version of `key` visible at `at`.
    fn get(&self, key: &[u8], at: Ts) -> Result<Option<(Ts, StoredRecord)>>;

    /// Versions of `key` visible at `at`, newest first, ending at the first
    /// complete record.
    fn versions(&self, key: &[u8], at: Ts) -> Result<Vec<(Ts, StoredRecord)>>;

    /// Visits keys starting with `prefix` in key order, passing each key's
    /// newest version visible at `at`.
    fn scan(&self, prefix: &[u8], at: Ts, visit: &mut ScanVisitor<'_>) -> Result<()>;

    /// Writes all entries atomically at `ts`.
    fn write_batch(&self, entries: &[KvEntry], ts: Ts) -> Result<()>;

    /// Removes every version of every key starting with `prefix`.
    fn drop_prefix(&self, prefix: &[u8]) -> Result<()>;

    /// Removes versions of `key` older than `ts`.
    fn discard_below(&self, key: &[u8], ts: Ts) -> Result<()>;

    /// Highest timestamp written so far.
    fn max_version(&self) -> Result<Ts>;

    /// Blocks until previous writes are durable.
    fn sync(&self) -> Result<()>;
}

type VersionMap = BTreeMap<Ts, StoredRecord>;

/// In-memory [`KvStore`] with optional write fault injection.
#[derive(Debug, Default)]
pub struct MemKvStore {
    data: RwLock<BTreeMap<Vec<u8>, VersionMap>>,
    max_version: AtomicU64,
    fail_writes: AtomicUsize,
    batches_written: AtomicU64,
}

impl MemKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to [`KvStore::write_batch`] fail with an I/O error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of batches applied successfully.
    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::SeqCst)
    }

    /// Number of stored versions of `key`, including hidden ones.
    pub fn version_count(&self, key: &[u8]) -> usize {
        self.data.read().get(key).map(BTreeMap::len).unwrap_or(0)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &[u8], at: Ts) -> Result<Option<(Ts, StoredRecord)>> {
        let data = self.data.read();
        Ok(data.get(key).and_then(|versions| {
            versions
                .range(..=at)
                .next_back()
                .map(|(ts, record)| (*ts, record.clone()))
        }))
    }

    fn versions(&self, key: &[u8], at: Ts) -> Result<Vec<(Ts, StoredRecord)>> {
        let data = self.data.read();
        let Some(versions) = data.get(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (ts, record) in versions.range(..=at).rev() {
            out.push((*ts, record.clone()));
            if record.is_complete() {
                break;
            }
        }
        Ok(out)
    }

    fn scan(&self, prefix: &[u8], at: Ts, visit: &mut ScanVisitor<'_>) -> Result<()> {
        // Collect first so the visitor may call back into the store.
        let visible: Vec<(Vec<u8>, Ts, StoredRecord)> = {
            let data = self.data.read();
            data.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(prefix))
                .filter_map(|(key, versions)| {
                    versions
                        .range(..=at)
                        .next_back()
                        .map(|(ts, record)| (key.clone(), *ts, record.clone()))
                })
                .collect()
        };
        for (key, ts, record) in &visible {
            if visit(key, *ts, record)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    fn write_batch(&self, entries: &[KvEntry], ts: Ts) -> Result<()> {
        if self.take_injected_failure() {
            return Err(UmbraError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        let mut data = self.data.write();
        for entry in entries {
            data.entry(entry.key.clone())
                .or_default()
                .insert(ts, entry.record.clone());
        }
        self.max_version.fetch_max(ts, Ordering::SeqCst);
        self.batches_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn drop_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        data.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    fn discard_below(&self, key: &[u8], ts: Ts) -> Result<()> {
        let mut data = self.data.write();
        if let Some(versions) = data.get_mut(key) {
            let kept = versions.split_off(&ts);
            *versions = kept;
        }
        Ok(())
    }

    fn max_version(&self) -> Result<Ts> {
        Ok(self.max_version.load(Ordering::SeqCst))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &[u8], meta: u8, value: &[u8]) -> KvEntry {
        KvEntry {
            key: key.to_vec(),
            record: StoredRecord {
                meta,
                value: value.to_vec(),
            },
        }
    }

    #[test]
    fn reads_see_newest_version_at_or_below_ts() -> Result<()> {
        let kv = MemKvStore::new();
        kv.write_batch(&[entry(b"k", BIT_COMPLETE, b"a")], 5)?;
        kv.write_batch(&[entry(b"k", BIT_DELTA, b"b")], 9)?;
        assert!(kv.get(b"k", 4)?.is_none());
        assert_eq!(kv.get(b"k", 5)?.map(|(ts, _)| ts), Some(5));
        assert_eq!(kv.get(b"k", 100)?.map(|(_, r)| r.value), Some(b"b".to_vec()));
        let versions = kv.versions(b"k", 100)?;
        assert_eq!(versions.iter().map(|(ts, _)| *ts).collect::<Vec<_>>(), vec![9, 5]);
        assert_eq!(kv.max_version()?, 9);
        Ok(())
    }

    #[test]
    fn versions_stop_at_complete_record() -> Result<()> {
        let kv = MemKvStore::new();
        kv.write_batch(&[entry(b"k", BIT_DELTA, b"a")], 1)?;
        kv.write_batch(&[entry(b"k", BIT_COMPLETE, b"b")], 2)?;
        kv.write_batch(&[entry(b"k", BIT_DELTA, b"c")], 3)?;
        assert_eq!(kv.versions(b"k", 10)?.len(), 2);
        kv.discard_below(b"k", 2)?;
        assert_eq!(kv.version_count(b"k"), 2);
        Ok(())
    }

    #[test]
    fn scan_respects_prefix_and_break() -> Result<()> {
        let kv = MemKvStore::new();
        kv.write_batch(
            &[
                entry(b"a1", BIT_COMPLETE, b""),
                entry(b"a2", BIT_COMPLETE, b""),
                entry(b"b1", BIT_COMPLETE, b""),
            ],
            1,
        )?;
        let mut seen = Vec::new();
        kv.scan(b"a", 1, &mut |key, _, _| {
            seen.push(key.to_vec());
            Ok(ControlFlow::Continue(()))
        })?;
        assert_eq!(seen, vec![b"a1".to_vec(), b"a2".to_vec()]);
        let mut count = 0;
        kv.scan(b"", 1, &mut |_, _, _| {
            count += 1;
            Ok(ControlFlow::Break(()))
        })?;
        assert_eq!(count, 1);
        kv.drop_prefix(b"a")?;
        assert!(kv.get(b"a1", 1)?.is_none());
        assert!(kv.get(b"b1", 1)?.is_some());
        Ok(())
    }

    #[test]
    fn injected_failures_are_consumed() {
        let kv = MemKvStore::new();
        kv.fail_next_writes(1);
        let err = kv.write_batch(&[entry(b"k", BIT_COMPLETE, b"")], 1).unwrap_err();
        assert!(err.is_transient_io());
        assert!(kv.write_batch(&[entry(b"k", BIT_COMPLETE, b"")], 1).is_ok());
        assert_eq!(kv.batches_written(), 1);
    }

    #[test]
    fn empty_marker_is_complete() {
        let marker = StoredRecord {
            meta: BIT_EMPTY,
            value: Vec::new(),
        };
        assert!(marker.is_empty_marker());
        assert!(marker.is_complete());
    }
}
