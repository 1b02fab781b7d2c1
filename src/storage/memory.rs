//! In-memory ordered KV store.
//!
//! The in-process implementation of the storage contract: a sorted map per
//! process with all five indices materialized as key-encoded entries.
//! Writers publish whole new states atomically via `ArcSwap`, so readers
//! get consistent point-in-time snapshots without holding locks and a
//! snapshot stays valid for as long as its `Arc` lives.
//!
//! Scans walk the map with an explicit cursor (one `range` probe per
//! entry) instead of borrowing iterators, which keeps snapshots `'static`
//! and lets matchers suspend/resume between pages.

use super::codec;
use super::{Index, KvStream, Snapshot};
use crate::datom::Datom;
use crate::error::Result;
use crate::value::{Identity, Keyword, Value};
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct StoreState {
    entries: BTreeMap<Vec<u8>, Arc<[u8]>>,
    attribute_counts: HashMap<Keyword, u64>,
    entities: HashSet<Identity>,
}

/// Writable store handle. Reads go through [`MemoryStore::snapshot`].
pub struct MemoryStore {
    state: ArcSwap<StoreState>,
    next_tx: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: ArcSwap::from_pointee(StoreState::default()),
            next_tx: AtomicU64::new(1),
        }
    }

    /// Assert a batch of facts under one new transaction; returns its id.
    pub fn assert_facts(
        &self,
        facts: impl IntoIterator<Item = (Identity, Keyword, Value)>,
    ) -> Result<u64> {
        let tx = self.next_tx.fetch_add(1, Ordering::SeqCst);
        let datoms: Vec<Datom> = facts
            .into_iter()
            .map(|(e, a, v)| Datom { e, a, v, tx })
            .collect();
        self.assert_datoms(&datoms)?;
        Ok(tx)
    }

    /// Assert pre-stamped datoms (test datasets with explicit tx values).
    pub fn assert_datoms(&self, datoms: &[Datom]) -> Result<()> {
        let current = self.state.load_full();
        let mut entries = current.entries.clone();
        let mut attribute_counts = current.attribute_counts.clone();
        let mut entities = current.entities.clone();

        for datom in datoms {
            let payload: Arc<[u8]> = codec::encode_datom(datom)?.into();
            for index in [
                Index::Eavt,
                Index::Aevt,
                Index::Avet,
                Index::Vaet,
                Index::Taev,
            ] {
                entries.insert(codec::encode_datom_key(index, datom), Arc::clone(&payload));
            }
            *attribute_counts.entry(datom.a).or_insert(0) += 1;
            entities.insert(datom.e.clone());
            self.bump_tx_floor(datom.tx);
        }

        self.state.store(Arc::new(StoreState {
            entries,
            attribute_counts,
            entities,
        }));
        Ok(())
    }

    fn bump_tx_floor(&self, seen: u64) {
        let mut current = self.next_tx.load(Ordering::Relaxed);
        while current <= seen {
            match self.next_tx.compare_exchange_weak(
                current,
                seen + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Immutable point-in-time read view.
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            state: self.state.load_full(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

/// Snapshot over one published store state. Cloning shares the state.
#[derive(Clone)]
pub struct MemorySnapshot {
    state: Arc<StoreState>,
}

struct CursorScan {
    state: Arc<StoreState>,
    /// Last key yielded; the next probe starts just past it.
    cursor: Option<Vec<u8>>,
    start: Vec<u8>,
    end: ScanEnd,
}

enum ScanEnd {
    Prefix(Vec<u8>),
    Before(Vec<u8>),
}

impl Iterator for CursorScan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let lower = match &self.cursor {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Included(self.start.clone()),
        };
        let (key, payload) = self
            .state
            .entries
            .range((lower, Bound::Unbounded))
            .next()?;
        match &self.end {
            ScanEnd::Prefix(prefix) => {
                if !key.starts_with(prefix) {
                    return None;
                }
            }
            ScanEnd::Before(hi) => {
                if key.as_slice() >= hi.as_slice() {
                    return None;
                }
            }
        }
        let key = key.clone();
        self.cursor = Some(key.clone());
        Some(Ok((key, payload.to_vec())))
    }
}

impl Snapshot for MemorySnapshot {
    fn scan(&self, index: Index, prefix: &[u8]) -> KvStream {
        debug_assert!(prefix.first() == Some(&index.tag()) || prefix.is_empty());
        let start = if prefix.is_empty() {
            vec![index.tag()]
        } else {
            prefix.to_vec()
        };
        let end = if prefix.is_empty() {
            ScanEnd::Prefix(vec![index.tag()])
        } else {
            ScanEnd::Prefix(prefix.to_vec())
        };
        Box::new(CursorScan {
            state: Arc::clone(&self.state),
            cursor: None,
            start,
            end,
        })
    }

    fn scan_range(&self, _index: Index, lo: &[u8], hi: &[u8]) -> KvStream {
        Box::new(CursorScan {
            state: Arc::clone(&self.state),
            cursor: None,
            start: lo.to_vec(),
            end: ScanEnd::Before(hi.to_vec()),
        })
    }

    fn entity_count(&self) -> Option<u64> {
        Some(self.state.entities.len() as u64)
    }

    fn attribute_cardinality(&self, attr: Keyword) -> Option<u64> {
        Some(
            self.state
                .attribute_counts
                .get(&attr)
                .copied()
                .unwrap_or(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::KeyPart;

    fn store_with_people() -> MemoryStore {
        let store = MemoryStore::new();
        let name = Keyword::intern(":name");
        let age = Keyword::intern(":age");
        store
            .assert_facts(vec![
                (Identity::of("a"), name, Value::String("Alice".into())),
                (Identity::of("a"), age, Value::Int64(30)),
                (Identity::of("b"), name, Value::String("Bob".into())),
                (Identity::of("b"), age, Value::Int64(25)),
            ])
            .expect("assert");
        store
    }

    fn decode_all(stream: KvStream) -> Vec<Datom> {
        stream
            .map(|entry| {
                let (_, payload) = entry.expect("entry");
                codec::decode_datom(&payload).expect("datom")
            })
            .collect()
    }

    #[test]
    fn test_aevt_prefix_scan() {
        let store = store_with_people();
        let snapshot = store.snapshot();
        let prefix = codec::encode_key_prefix(
            Index::Aevt,
            &[KeyPart::Attribute(Keyword::intern(":age"))],
        )
        .expect("prefix");
        let datoms = decode_all(snapshot.scan(Index::Aevt, &prefix));
        assert_eq!(datoms.len(), 2);
        assert!(datoms.iter().all(|d| d.a == Keyword::intern(":age")));
    }

    #[test]
    fn test_avet_orders_by_value() {
        let store = store_with_people();
        let snapshot = store.snapshot();
        let prefix = codec::encode_key_prefix(
            Index::Avet,
            &[KeyPart::Attribute(Keyword::intern(":age"))],
        )
        .expect("prefix");
        let ages: Vec<i64> = decode_all(snapshot.scan(Index::Avet, &prefix))
            .into_iter()
            .map(|d| d.v.as_i64().expect("int"))
            .collect();
        assert_eq!(ages, vec![25, 30]);
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = store_with_people();
        let before = store.snapshot();
        store
            .assert_facts(vec![(
                Identity::of("c"),
                Keyword::intern(":name"),
                Value::String("Cara".into()),
            )])
            .expect("assert");
        let after = store.snapshot();
        assert_eq!(before.entity_count(), Some(2));
        assert_eq!(after.entity_count(), Some(3));
    }

    #[test]
    fn test_unknown_attribute_scans_empty() {
        let store = store_with_people();
        let snapshot = store.snapshot();
        let prefix = codec::encode_key_prefix(
            Index::Aevt,
            &[KeyPart::Attribute(Keyword::intern(":missing"))],
        )
        .expect("prefix");
        assert_eq!(snapshot.scan(Index::Aevt, &prefix).count(), 0);
    }

    #[test]
    fn test_attribute_cardinality() {
        let store = store_with_people();
        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.attribute_cardinality(Keyword::intern(":name")),
            Some(2)
        );
        assert_eq!(
            snapshot.attribute_cardinality(Keyword::intern(":missing")),
            Some(0)
        );
    }
}
