//! Versioned key/value persistence.
//!
//! The monitor's entire state lives in one ordered map partitioned by string
//! prefixes: one prefix per replicated service plus a handful of bookkeeping
//! prefixes. The contract is small: point reads, atomic durable batches,
//! ordered range scans, and compaction. The store is single-writer; all
//! access happens on the monitor's event-loop thread.

pub mod log;
pub mod mem;

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::{self, DecodeError};
use crate::error::Result;
use crate::Version;

/// Bookkeeping prefix for monitor-local state (fsid, name, joined flag).
pub const PREFIX_MON: &str = "mon";
/// Prefix holding the membership map history.
pub const PREFIX_MONMAP: &str = "monmap";

pub const KEY_FSID: &[u8] = b"fsid";
pub const KEY_NAME: &[u8] = b"name";
pub const KEY_JOINED: &[u8] = b"joined";
pub const KEY_ELECTION_EPOCH: &[u8] = b"election_epoch";
pub const KEY_SYNC_IN_PROGRESS: &[u8] = b"sync_in_progress";
pub const KEY_SYNC_CURSOR: &[u8] = b"sync_cursor";
pub const KEY_LATEST: &[u8] = b"latest";

/// Store prefix for a service's paxos state and committed entries.
pub fn paxos_prefix(svc: &str) -> String {
    format!("paxos/{svc}")
}

/// Committed versions are keyed big-endian so they sort numerically and stay
/// clear of the named bookkeeping keys, which never start with a NUL byte.
pub fn version_key(v: Version) -> [u8; 8] {
    v.to_be_bytes()
}

pub fn version_from_key(key: &[u8]) -> Option<Version> {
    let raw: [u8; 8] = key.try_into().ok()?;
    Some(Version::from_be_bytes(raw))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put {
        prefix: String,
        key: Bytes,
        value: Bytes,
    },
    Erase {
        prefix: String,
        key: Bytes,
    },
    /// Removes every key in `[from, to)` under `prefix`.
    EraseRange {
        prefix: String,
        from: Bytes,
        to: Bytes,
    },
}

/// An atomic batch of writes. Applied all-or-nothing and durable before
/// `Store::apply` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<Op>,
}

const TX_VERSION: u8 = 1;
const TX_COMPAT: u8 = 1;

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::default()
    }

    pub fn put(&mut self, prefix: &str, key: &[u8], value: &[u8]) -> &mut Self {
        self.ops.push(Op::Put {
            prefix: prefix.to_string(),
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        });
        self
    }

    pub fn put_u64(&mut self, prefix: &str, key: &[u8], value: u64) -> &mut Self {
        self.put(prefix, key, &value.to_le_bytes())
    }

    pub fn erase(&mut self, prefix: &str, key: &[u8]) -> &mut Self {
        self.ops.push(Op::Erase {
            prefix: prefix.to_string(),
            key: Bytes::copy_from_slice(key),
        });
        self
    }

    pub fn erase_range(&mut self, prefix: &str, from: &[u8], to: &[u8]) -> &mut Self {
        self.ops.push(Op::EraseRange {
            prefix: prefix.to_string(),
            from: Bytes::copy_from_slice(from),
            to: Bytes::copy_from_slice(to),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        encoding::put_header(&mut buf, TX_COMPAT, TX_VERSION);
        encoding::put_varint(&mut buf, self.ops.len() as u64);
        for op in &self.ops {
            match op {
                Op::Put { prefix, key, value } => {
                    buf.put_u8(0);
                    encoding::put_string(&mut buf, prefix);
                    encoding::put_bytes(&mut buf, key);
                    encoding::put_bytes(&mut buf, value);
                }
                Op::Erase { prefix, key } => {
                    buf.put_u8(1);
                    encoding::put_string(&mut buf, prefix);
                    encoding::put_bytes(&mut buf, key);
                }
                Op::EraseRange { prefix, from, to } => {
                    buf.put_u8(2);
                    encoding::put_string(&mut buf, prefix);
                    encoding::put_bytes(&mut buf, from);
                    encoding::put_bytes(&mut buf, to);
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> std::result::Result<Transaction, DecodeError> {
        encoding::get_header(&mut buf, TX_VERSION)?;
        let n = encoding::get_varint(&mut buf)? as usize;
        let mut ops = Vec::with_capacity(n);
        for _ in 0..n {
            let tag = encoding::get_u8(&mut buf)?;
            let prefix = encoding::get_string(&mut buf)?;
            match tag {
                0 => {
                    let key = encoding::get_bytes(&mut buf)?;
                    let value = encoding::get_bytes(&mut buf)?;
                    ops.push(Op::Put { prefix, key, value });
                }
                1 => {
                    let key = encoding::get_bytes(&mut buf)?;
                    ops.push(Op::Erase { prefix, key });
                }
                2 => {
                    let from = encoding::get_bytes(&mut buf)?;
                    let to = encoding::get_bytes(&mut buf)?;
                    ops.push(Op::EraseRange { prefix, from, to });
                }
                _ => return Err(DecodeError),
            }
        }
        Ok(Transaction { ops })
    }
}

/// Ordered scan result. Materialized from the store's snapshot at call time;
/// consumed as an iterator.
pub struct StoreIter {
    entries: std::vec::IntoIter<(Bytes, Bytes)>,
}

impl StoreIter {
    pub fn new(entries: Vec<(Bytes, Bytes)>) -> StoreIter {
        StoreIter {
            entries: entries.into_iter(),
        }
    }
}

impl Iterator for StoreIter {
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<(Bytes, Bytes)> {
        self.entries.next()
    }
}

/// The persistence contract the monitor core is written against.
pub trait Store {
    fn get(&self, prefix: &str, key: &[u8]) -> Option<Bytes>;

    /// Applies the batch atomically; durable before return.
    fn apply(&self, tx: Transaction) -> Result<()>;

    /// Keys in `[from, to)` under `prefix`, in order.
    fn range_scan(&self, prefix: &str, from: &[u8], to: &[u8]) -> StoreIter;

    /// Drops every key strictly below `upto` under `prefix`.
    fn compact(&self, prefix: &str, upto: &[u8]) -> Result<()>;

    /// Full ordered dump, used by the sync provider to pin a point-in-time
    /// view of the store.
    fn snapshot(&self) -> Vec<(String, Bytes, Bytes)>;

    fn contains(&self, prefix: &str, key: &[u8]) -> bool {
        self.get(prefix, key).is_some()
    }

    fn get_u64(&self, prefix: &str, key: &[u8]) -> Option<u64> {
        let raw = self.get(prefix, key)?;
        let arr: [u8; 8] = raw.as_ref().try_into().ok()?;
        Some(u64::from_le_bytes(arr))
    }
}
