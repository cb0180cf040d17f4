//! In-memory store backend.
//!
//! Backs the deterministic multi-peer tests and the durable log backend,
//! which layers a write-ahead log underneath this map.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::Bytes;

use super::{Op, Store, StoreIter, Transaction};
use crate::error::Result;

type Key = (String, Vec<u8>);

#[derive(Default)]
pub struct MemStore {
    map: RefCell<BTreeMap<Key, Bytes>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub(super) fn apply_to_map(map: &mut BTreeMap<Key, Bytes>, tx: &Transaction) {
        for op in tx.ops() {
            match op {
                Op::Put { prefix, key, value } => {
                    map.insert((prefix.clone(), key.to_vec()), value.clone());
                }
                Op::Erase { prefix, key } => {
                    map.remove(&(prefix.clone(), key.to_vec()));
                }
                Op::EraseRange { prefix, from, to } => {
                    let doomed: Vec<Key> = map
                        .range((
                            Bound::Included((prefix.clone(), from.to_vec())),
                            Bound::Excluded((prefix.clone(), to.to_vec())),
                        ))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        map.remove(&k);
                    }
                }
            }
        }
    }
}

impl Store for MemStore {
    fn get(&self, prefix: &str, key: &[u8]) -> Option<Bytes> {
        self.map
            .borrow()
            .get(&(prefix.to_string(), key.to_vec()))
            .cloned()
    }

    fn apply(&self, tx: Transaction) -> Result<()> {
        MemStore::apply_to_map(&mut self.map.borrow_mut(), &tx);
        Ok(())
    }

    fn range_scan(&self, prefix: &str, from: &[u8], to: &[u8]) -> StoreIter {
        let map = self.map.borrow();
        let entries = map
            .range((
                Bound::Included((prefix.to_string(), from.to_vec())),
                Bound::Excluded((prefix.to_string(), to.to_vec())),
            ))
            .map(|((_, k), v)| (Bytes::copy_from_slice(k), v.clone()))
            .collect();
        StoreIter::new(entries)
    }

    fn compact(&self, prefix: &str, upto: &[u8]) -> Result<()> {
        let mut tx = Transaction::new();
        tx.erase_range(prefix, &[], upto);
        self.apply(tx)
    }

    fn snapshot(&self) -> Vec<(String, Bytes, Bytes)> {
        self.map
            .borrow()
            .iter()
            .map(|((p, k), v)| (p.clone(), Bytes::copy_from_slice(k), v.clone()))
            .collect()
    }
}
