//! Bulk state transfer.
//!
//! When a peer has fallen further behind than the paxos log window can
//! replay, it pulls the provider's entire store, chunk by chunk, before
//! rejoining the cluster through a fresh probe. The provider pins a
//! point-in-time snapshot per requester and suspends trim while any transfer
//! is running; the requester applies each chunk in one transaction and never
//! exposes partial state.
//!
//! Each side keeps one owned record per partner, keyed by peer identity;
//! timers carry only the key and check the record on fire.

use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::messages::{Message, SyncChunk, SyncCursor, SyncStart, SyncStartReply, SyncHeartbeat};
use crate::monmap::Rank;
use crate::network::Messenger;
use crate::store::{Store, Transaction, KEY_SYNC_CURSOR, KEY_SYNC_IN_PROGRESS, PREFIX_MON};

struct ProviderSession {
    snapshot: Vec<(String, Bytes, Bytes)>,
    cursor: usize,
    last_heard_ms: u64,
}

/// Provider side: serves snapshots to requesters. One session per peer.
pub struct SyncProvider {
    sessions: HashMap<Rank, ProviderSession>,
    chunk_max_bytes: usize,
    chunk_max_keys: usize,
    timeout_ms: u64,
}

impl SyncProvider {
    pub fn new(chunk_max_bytes: usize, chunk_max_keys: usize, timeout_ms: u64) -> SyncProvider {
        SyncProvider {
            sessions: HashMap::new(),
            chunk_max_bytes,
            chunk_max_keys,
            timeout_ms,
        }
    }

    /// True while any transfer is being served; the monitor keeps trim
    /// suspended for as long as this holds.
    pub fn is_active(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn handle_start(
        &mut self,
        from: Rank,
        msg: &SyncStart,
        epoch: u64,
        now_ms: u64,
        store: &Rc<dyn Store>,
        net: &Rc<dyn Messenger>,
    ) {
        // Monitor-local bookkeeping stays home; everything else is cluster
        // state the requester needs.
        let snapshot: Vec<(String, Bytes, Bytes)> = store
            .snapshot()
            .into_iter()
            .filter(|(prefix, _, _)| prefix != PREFIX_MON)
            .collect();

        let cursor = match &msg.cursor {
            None => 0,
            Some((prefix, key)) => snapshot
                .partition_point(|(p, k, _)| (p.as_str(), k.as_ref()) < (prefix.as_str(), &key[..])),
        };

        info!(from, keys = snapshot.len(), "sync session opened");
        // A restarted requester replaces its old session.
        self.sessions.insert(
            from,
            ProviderSession {
                snapshot,
                cursor,
                last_heard_ms: now_ms,
            },
        );
        net.send_mon(
            from,
            epoch,
            Message::SyncStartReply(SyncStartReply {
                rc: 0,
                reason: String::new(),
            }),
        );
        self.send_chunk(from, epoch, net);
    }

    pub fn handle_chunk_reply(&mut self, from: Rank, epoch: u64, now_ms: u64, net: &Rc<dyn Messenger>) {
        if let Some(session) = self.sessions.get_mut(&from) {
            session.last_heard_ms = now_ms;
        }
        self.send_chunk(from, epoch, net);
    }

    pub fn handle_heartbeat(
        &mut self,
        from: Rank,
        msg: &SyncHeartbeat,
        epoch: u64,
        now_ms: u64,
        net: &Rc<dyn Messenger>,
    ) {
        if let Some(session) = self.sessions.get_mut(&from) {
            session.last_heard_ms = now_ms;
        }
        if !msg.reply {
            net.send_mon(
                from,
                epoch,
                Message::SyncHeartbeat(SyncHeartbeat { reply: true }),
            );
        }
    }

    pub fn handle_finish(&mut self, from: Rank) {
        if self.sessions.remove(&from).is_some() {
            info!(from, "sync session finished");
        }
    }

    /// Expires sessions whose requester went silent. Returns whether any
    /// session remains.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        self.sessions.retain(|rank, session| {
            let alive = now_ms.saturating_sub(session.last_heard_ms) < self.timeout_ms;
            if !alive {
                warn!(rank, "sync requester timed out");
            }
            alive
        });
        self.is_active()
    }

    fn send_chunk(&mut self, to: Rank, epoch: u64, net: &Rc<dyn Messenger>) {
        let Some(session) = self.sessions.get_mut(&to) else {
            return;
        };
        let mut pairs = Vec::new();
        let mut bytes = 0usize;
        while session.cursor < session.snapshot.len() {
            let (prefix, key, value) = &session.snapshot[session.cursor];
            if !pairs.is_empty()
                && (pairs.len() >= self.chunk_max_keys
                    || bytes + key.len() + value.len() > self.chunk_max_bytes)
            {
                break;
            }
            bytes += key.len() + value.len();
            pairs.push((prefix.clone(), key.clone(), value.clone()));
            session.cursor += 1;
        }
        let done = session.cursor >= session.snapshot.len();
        let next_cursor: Option<SyncCursor> = if done {
            None
        } else {
            let (p, k, _) = &session.snapshot[session.cursor];
            Some((p.clone(), k.clone()))
        };
        debug!(to, n = pairs.len(), done, "sync chunk out");
        net.send_mon(
            to,
            epoch,
            Message::SyncChunk(SyncChunk {
                pairs,
                next_cursor,
                done,
            }),
        );
    }
}

/// What a dispatched requester step means for the monitor.
#[derive(Debug, PartialEq, Eq)]
pub enum RequesterEvent {
    /// Transfer complete; reload paxos state and re-probe.
    Done,
    /// Provider refused or died; back off and re-probe.
    Failed,
}

/// Requester side: drives one transfer from one provider.
pub struct SyncRequester {
    pub provider: Rank,
    pub last_heard_ms: u64,
    timeout_ms: u64,
}

impl SyncRequester {
    /// Marks the local store as mid-sync and wipes every cluster prefix, so
    /// a crash before `Done` can never be mistaken for good state.
    pub fn start(
        provider: Rank,
        epoch: u64,
        now_ms: u64,
        store: &Rc<dyn Store>,
        net: &Rc<dyn Messenger>,
    ) -> Result<SyncRequester> {
        let mut tx = Transaction::new();
        tx.put(PREFIX_MON, KEY_SYNC_IN_PROGRESS, &[1]);
        for (prefix, key, _) in store.snapshot() {
            if prefix != PREFIX_MON {
                tx.erase(&prefix, &key);
            }
        }
        store.apply(tx)?;

        info!(provider, "sync requested");
        net.send_mon(provider, epoch, Message::SyncStart(SyncStart { cursor: None }));
        Ok(SyncRequester {
            provider,
            last_heard_ms: now_ms,
            timeout_ms: 0,
        })
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> SyncRequester {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn handle_start_reply(&mut self, msg: &SyncStartReply, now_ms: u64) -> Option<RequesterEvent> {
        self.last_heard_ms = now_ms;
        if msg.rc != 0 {
            warn!(rc = msg.rc, reason = %msg.reason, "sync refused");
            return Some(RequesterEvent::Failed);
        }
        None
    }

    pub fn handle_chunk(
        &mut self,
        msg: &SyncChunk,
        epoch: u64,
        now_ms: u64,
        store: &Rc<dyn Store>,
        net: &Rc<dyn Messenger>,
    ) -> Result<Option<RequesterEvent>> {
        self.last_heard_ms = now_ms;
        let mut tx = Transaction::new();
        for (prefix, key, value) in &msg.pairs {
            tx.put(prefix, key, value);
        }
        if msg.done {
            tx.erase(PREFIX_MON, KEY_SYNC_IN_PROGRESS);
            tx.erase(PREFIX_MON, KEY_SYNC_CURSOR);
        } else if let Some((prefix, key)) = &msg.next_cursor {
            let mut cursor = bytes::BytesMut::new();
            crate::encoding::put_string(&mut cursor, prefix);
            crate::encoding::put_bytes(&mut cursor, key);
            tx.put(PREFIX_MON, KEY_SYNC_CURSOR, &cursor);
        }
        store.apply(tx)?;

        if msg.done {
            info!(provider = self.provider, "sync complete");
            net.send_mon(self.provider, epoch, Message::SyncFinish);
            return Ok(Some(RequesterEvent::Done));
        }
        net.send_mon(self.provider, epoch, Message::SyncChunkReply);
        Ok(None)
    }

    pub fn handle_heartbeat(&mut self, msg: &SyncHeartbeat, epoch: u64, now_ms: u64, net: &Rc<dyn Messenger>) {
        self.last_heard_ms = now_ms;
        if !msg.reply {
            net.send_mon(
                self.provider,
                epoch,
                Message::SyncHeartbeat(SyncHeartbeat { reply: true }),
            );
        }
    }

    pub fn send_heartbeat(&self, epoch: u64, net: &Rc<dyn Messenger>) {
        net.send_mon(
            self.provider,
            epoch,
            Message::SyncHeartbeat(SyncHeartbeat { reply: false }),
        );
    }

    /// True when the provider has gone silent past the timeout.
    pub fn expired(&self, now_ms: u64) -> bool {
        self.timeout_ms > 0 && now_ms.saturating_sub(self.last_heard_ms) >= self.timeout_ms
    }
}

/// True when the store carries a half-applied sync; the caller must wipe the
/// cluster prefixes and start over rather than trust them.
pub fn sync_was_interrupted(store: &Rc<dyn Store>) -> bool {
    store.contains(PREFIX_MON, KEY_SYNC_IN_PROGRESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::CaptureMessenger;
    use crate::store::mem::MemStore;
    use crate::store::version_key;

    fn seeded_store(n: u64) -> Rc<dyn Store> {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        let mut tx = Transaction::new();
        tx.put(PREFIX_MON, b"name", b"provider");
        for v in 1..=n {
            tx.put("paxos/osdmap", &version_key(v), format!("v{v}").as_bytes());
        }
        tx.put_u64("paxos/osdmap", b"last_committed", n);
        store.apply(tx).unwrap();
        store
    }

    #[test]
    fn full_transfer_copies_everything_but_local_keys() {
        let provider_store = seeded_store(10);
        let requester_store: Rc<dyn Store> = Rc::new(MemStore::new());
        let mut tx = Transaction::new();
        tx.put(PREFIX_MON, b"name", b"requester");
        // Stale local entries that the provider no longer has.
        tx.put("paxos/osdmap", &version_key(99), b"stale");
        requester_store.apply(tx).unwrap();

        let (pstate, pnet_cap) = CaptureMessenger::new();
        let (rstate, rnet) = CaptureMessenger::new();

        let mut provider = SyncProvider::new(64, 3, 10_000);
        let mut requester = SyncRequester::start(0, 0, 0, &requester_store, &rnet)
            .unwrap()
            .with_timeout(10_000);

        assert!(sync_was_interrupted(&requester_store));
        assert!(requester_store.get("paxos/osdmap", &version_key(99)).is_none());

        // Pump messages by hand until done.
        let start = match rstate.borrow_mut().mons.remove(0).2 {
            Message::SyncStart(s) => s,
            other => panic!("expected sync start, got {other:?}"),
        };
        provider.handle_start(1, &start, 0, 0, &provider_store, &pnet_cap);
        assert!(provider.is_active());

        let mut finished = false;
        let mut guard = 0;
        while !finished {
            guard += 1;
            assert!(guard < 100, "sync did not converge");
            let outgoing: Vec<Message> = pstate
                .borrow_mut()
                .mons
                .drain(..)
                .map(|(_, _, m)| m)
                .collect();
            for msg in outgoing {
                match msg {
                    Message::SyncStartReply(reply) => {
                        assert_eq!(requester.handle_start_reply(&reply, 1), None);
                    }
                    Message::SyncChunk(chunk) => {
                        match requester
                            .handle_chunk(&chunk, 0, 1, &requester_store, &rnet)
                            .unwrap()
                        {
                            Some(RequesterEvent::Done) => finished = true,
                            Some(other) => panic!("unexpected {other:?}"),
                            None => {}
                        }
                    }
                    other => panic!("unexpected provider message {other:?}"),
                }
            }
            let replies: Vec<Message> = rstate
                .borrow_mut()
                .mons
                .drain(..)
                .map(|(_, _, m)| m)
                .collect();
            for msg in replies {
                match msg {
                    Message::SyncChunkReply => provider.handle_chunk_reply(1, 0, 1, &pnet_cap),
                    Message::SyncFinish => provider.handle_finish(1),
                    other => panic!("unexpected requester message {other:?}"),
                }
            }
        }

        assert!(!provider.is_active());
        assert!(!sync_was_interrupted(&requester_store));
        // Every provider key below the final cursor made it across.
        for v in 1..=10u64 {
            assert_eq!(
                requester_store.get("paxos/osdmap", &version_key(v)),
                provider_store.get("paxos/osdmap", &version_key(v)),
                "version {v}"
            );
        }
        assert_eq!(requester_store.get_u64("paxos/osdmap", b"last_committed"), Some(10));
        // Local identity untouched.
        assert_eq!(
            requester_store.get(PREFIX_MON, b"name"),
            Some(Bytes::from_static(b"requester"))
        );
        assert!(requester_store.get(PREFIX_MON, b"sync_in_progress").is_none());
    }

    #[test]
    fn provider_expires_silent_requester() {
        let store = seeded_store(3);
        let (_, net) = CaptureMessenger::new();
        let mut provider = SyncProvider::new(1024, 16, 1_000);
        provider.handle_start(2, &SyncStart { cursor: None }, 0, 100, &store, &net);
        assert!(provider.is_active());
        assert!(provider.tick(1_099));
        assert!(!provider.tick(1_100));
    }

    #[test]
    fn one_session_per_peer() {
        let store = seeded_store(3);
        let (_, net) = CaptureMessenger::new();
        let mut provider = SyncProvider::new(1024, 16, 1_000);
        provider.handle_start(2, &SyncStart { cursor: None }, 0, 0, &store, &net);
        provider.handle_start(2, &SyncStart { cursor: None }, 0, 50, &store, &net);
        assert_eq!(provider.sessions.len(), 1);
    }

    #[test]
    fn requester_detects_silent_provider() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        let (_, net) = CaptureMessenger::new();
        let requester = SyncRequester::start(0, 0, 500, &store, &net)
            .unwrap()
            .with_timeout(1_000);
        assert!(!requester.expired(1_499));
        assert!(requester.expired(1_500));
    }
}
