//! Durable store backend: an in-memory ordered map fronted by a write-ahead
//! log.
//!
//! Every applied transaction is appended as one checksummed record and
//! fsync'd before the in-memory map is touched, so a crash replays to exactly
//! the last acknowledged batch. A torn tail (short record or bad checksum) is
//! truncated on open. When the log outgrows the live data it is rewritten as
//! a single snapshot record and swapped in by rename.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use tracing::{debug, warn};

use super::mem::MemStore;
use super::{Op, Store, StoreIter, Transaction};
use crate::error::{Error, Result};

const LOG_FILE: &str = "store.log";
const LOG_TMP: &str = "store.log.tmp";

/// Rewrite the log once it exceeds this many bytes of appended records.
const REWRITE_BYTES: u64 = 32 << 20;

type Key = (String, Vec<u8>);

pub struct LogStore {
    dir: PathBuf,
    map: RefCell<BTreeMap<Key, Bytes>>,
    file: RefCell<File>,
    log_bytes: Cell<u64>,
}

impl LogStore {
    /// Opens (or creates) the store under `dir`, replaying the log.
    pub fn open(dir: &Path) -> Result<LogStore> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);

        let mut map = BTreeMap::new();
        let mut good_bytes = 0u64;
        if path.exists() {
            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;
            good_bytes = replay(&raw, &mut map)?;
            if good_bytes < raw.len() as u64 {
                warn!(
                    dropped = raw.len() as u64 - good_bytes,
                    "truncating torn tail of store log"
                );
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        // Discard anything past the last intact record.
        file.set_len(good_bytes)?;

        let store = LogStore {
            dir: dir.to_path_buf(),
            map: RefCell::new(map),
            file: RefCell::new(file),
            log_bytes: Cell::new(good_bytes),
        };
        debug!(bytes = good_bytes, "store log opened");
        Ok(store)
    }

    fn append_record(&self, payload: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(payload.len() + 8);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        record.extend_from_slice(payload);

        let mut file = self.file.borrow_mut();
        file.write_all(&record)?;
        file.sync_data()?;
        self.log_bytes.set(self.log_bytes.get() + record.len() as u64);
        Ok(())
    }

    /// Collapses the log into one snapshot record when it has outgrown the
    /// live data.
    fn maybe_rewrite(&self) -> Result<()> {
        if self.log_bytes.get() < REWRITE_BYTES {
            return Ok(());
        }
        let mut snap = Transaction::new();
        for ((prefix, key), value) in self.map.borrow().iter() {
            snap.put(prefix, key, value);
        }
        let payload = snap.encode();

        let tmp_path = self.dir.join(LOG_TMP);
        let mut record = Vec::with_capacity(payload.len() + 8);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        record.extend_from_slice(&payload);

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&record)?;
        tmp.sync_all()?;
        drop(tmp);

        let path = self.dir.join(LOG_FILE);
        fs::rename(&tmp_path, &path)?;
        *self.file.borrow_mut() = OpenOptions::new().append(true).open(&path)?;
        self.log_bytes.set(record.len() as u64);
        debug!(bytes = record.len() as u64, "store log rewritten");
        Ok(())
    }
}

fn replay(raw: &[u8], map: &mut BTreeMap<Key, Bytes>) -> Result<u64> {
    let mut buf = Bytes::copy_from_slice(raw);
    let mut good = 0u64;
    while buf.remaining() >= 8 {
        let len = buf.get_u32_le() as usize;
        let crc = buf.get_u32_le();
        if buf.remaining() < len {
            break;
        }
        let payload = buf.split_to(len);
        if crc32fast::hash(&payload) != crc {
            break;
        }
        let tx = Transaction::decode(payload)
            .map_err(|_| Error::StoreCorrupt("undecodable log record".into()))?;
        MemStore::apply_to_map(map, &tx);
        good += 8 + len as u64;
    }
    Ok(good)
}

impl Store for LogStore {
    fn get(&self, prefix: &str, key: &[u8]) -> Option<Bytes> {
        self.map
            .borrow()
            .get(&(prefix.to_string(), key.to_vec()))
            .cloned()
    }

    fn apply(&self, tx: Transaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        self.append_record(&tx.encode())?;
        MemStore::apply_to_map(&mut self.map.borrow_mut(), &tx);
        self.maybe_rewrite()
    }

    fn range_scan(&self, prefix: &str, from: &[u8], to: &[u8]) -> StoreIter {
        use std::ops::Bound;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::version_key;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let s = LogStore::open(dir.path()).unwrap();
            let mut tx = Transaction::new();
            tx.put("mon", b"fsid", b"cluster-1");
            tx.put("paxos/a", &version_key(1), b"one");
            s.apply(tx).unwrap();

            let mut tx = Transaction::new();
            tx.put("paxos/a", &version_key(2), b"two");
            tx.erase("mon", b"fsid");
            s.apply(tx).unwrap();
        }
        let s = LogStore::open(dir.path()).unwrap();
        assert!(s.get("mon", b"fsid").is_none());
        assert_eq!(s.get("paxos/a", &version_key(2)), Some(Bytes::from_static(b"two")));
        assert_eq!(s.get("paxos/a", &version_key(1)), Some(Bytes::from_static(b"one")));
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let s = LogStore::open(dir.path()).unwrap();
            let mut tx = Transaction::new();
            tx.put("mon", b"k", b"v");
            s.apply(tx).unwrap();
        }
        // Simulate a crash mid-append.
        let path = dir.path().join(LOG_FILE);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0x40, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(f);

        let s = LogStore::open(dir.path()).unwrap();
        assert_eq!(s.get("mon", b"k"), Some(Bytes::from_static(b"v")));

        // The torn bytes are gone; new writes land cleanly.
        let mut tx = Transaction::new();
        tx.put("mon", b"k2", b"v2");
        s.apply(tx).unwrap();
        drop(s);
        let s = LogStore::open(dir.path()).unwrap();
        assert_eq!(s.get("mon", b"k2"), Some(Bytes::from_static(b"v2")));
    }

    #[test]
    fn corrupt_record_is_an_error_boundary() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let s = LogStore::open(dir.path()).unwrap();
            let mut tx = Transaction::new();
            tx.put("mon", b"k", b"v");
            s.apply(tx).unwrap();
        }
        // Flip a payload byte; the record now fails its checksum and the
        // store must fall back to the state before it.
        let path = dir.path().join(LOG_FILE);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, &raw).unwrap();

        let s = LogStore::open(dir.path()).unwrap();
        assert!(s.get("mon", b"k").is_none());
    }
}
