//! Per-service replicated log.
//!
//! Each service gets its own independent instance; instances share nothing
//! but the store. The leader elected by the monitor drives a collect round to
//! reconcile peon state, then serves proposals one at a time: begin, a
//! majority of accepts, commit. Commits fire the service callback in strict
//! version order and are broadcast with their payloads so lagging peons catch
//! up from the same message. A read lease lets peons answer stale-tolerant
//! reads locally between commits.
//!
//! The monitor dispatches messages into an instance and applies the returned
//! events; the instance never calls back into the monitor.

use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::messages::{
    Message, PaxosAccept, PaxosBegin, PaxosCollect, PaxosCommit, PaxosLast, PaxosLease,
    PaxosLeaseAck,
};
use crate::monmap::Rank;
use crate::network::Messenger;
use crate::store::{paxos_prefix, version_key, Store, Transaction};
use crate::Version;

pub const KEY_FIRST_COMMITTED: &[u8] = b"first_committed";
pub const KEY_LAST_COMMITTED: &[u8] = b"last_committed";
pub const KEY_ACCEPTED_PN: &[u8] = b"accepted_pn";
pub const KEY_LAST_PN: &[u8] = b"last_pn";
pub const KEY_PENDING_V: &[u8] = b"pending_v";
pub const KEY_PENDING_PN: &[u8] = b"pending_pn";
pub const KEY_PENDING_VALUE: &[u8] = b"pending_value";

/// Proposal number: strictly increasing per proposer, globally unique and
/// totally ordered because the proposer's rank rides in the low position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProposalId {
    pub counter: u64,
    pub rank: Rank,
}

impl ProposalId {
    pub fn is_zero(&self) -> bool {
        self.counter == 0
    }

    pub fn encode(&self) -> [u8; 10] {
        let mut raw = [0u8; 10];
        raw[..8].copy_from_slice(&self.counter.to_le_bytes());
        raw[8..].copy_from_slice(&self.rank.to_le_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Option<ProposalId> {
        if raw.len() < 10 {
            return None;
        }
        Some(ProposalId {
            counter: u64::from_le_bytes(raw[..8].try_into().ok()?),
            rank: u16::from_le_bytes(raw[8..10].try_into().ok()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Post-election reconciliation (leader collecting, peon awaiting).
    Recovering,
    Active,
    /// Leader only: a proposal is in flight.
    Updating,
}

/// What a dispatched message did. The monitor feeds `Committed` to the
/// owning service and its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Committed { version: Version, value: Bytes },
    /// Recovery finished; the instance is active under the current quorum.
    Recovered,
    /// A quorum peer lags too far behind to catch up from our log window.
    /// It will discover the gap itself on its next probe and run a sync.
    PeerTooStale { rank: Rank, last_committed: Version },
    /// Our own log has a hole a peer cannot fill; the monitor must re-probe
    /// (and from there, sync).
    TooStale,
}

#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    pub trim_min: u64,
    pub slurp_threshold: u64,
    pub lease_timeout_ms: u64,
}

pub struct Paxos {
    svc: String,
    prefix: String,
    rank: Rank,
    store: Rc<dyn Store>,
    net: Rc<dyn Messenger>,
    tunables: Tunables,

    state: State,
    leading: bool,
    leader: Rank,
    epoch: u64,
    quorum: Vec<Rank>,

    first_committed: Version,
    last_committed: Version,
    accepted_pn: ProposalId,
    last_pn: ProposalId,

    // Leader collect round.
    pn: ProposalId,
    num_last: usize,
    uncommitted_v: Version,
    uncommitted_pn: ProposalId,
    uncommitted_value: Option<Bytes>,

    // In-flight proposal.
    pending_value: Option<Bytes>,
    accepts: u64,
    queue: VecDeque<Bytes>,

    // Lease bookkeeping: leader tracks acks, peon tracks expiry.
    lease_expire_ms: u64,
    lease_acks: u64,

    trim_enabled: bool,
}

impl Paxos {
    pub fn new(
        svc: &str,
        rank: Rank,
        store: Rc<dyn Store>,
        net: Rc<dyn Messenger>,
        tunables: Tunables,
    ) -> Paxos {
        let mut p = Paxos {
            svc: svc.to_string(),
            prefix: paxos_prefix(svc),
            rank,
            store,
            net,
            tunables,
            state: State::Recovering,
            leading: false,
            leader: rank,
            epoch: 0,
            quorum: Vec::new(),
            first_committed: 0,
            last_committed: 0,
            accepted_pn: ProposalId::default(),
            last_pn: ProposalId::default(),
            pn: ProposalId::default(),
            num_last: 0,
            uncommitted_v: 0,
            uncommitted_pn: ProposalId::default(),
            uncommitted_value: None,
            pending_value: None,
            accepts: 0,
            queue: VecDeque::new(),
            lease_expire_ms: 0,
            lease_acks: 0,
            trim_enabled: true,
        };
        p.load();
        p
    }

    /// Re-reads persisted round state, e.g. after a sync rewrote the store.
    pub fn load(&mut self) {
        self.first_committed = self
            .store
            .get_u64(&self.prefix, KEY_FIRST_COMMITTED)
            .unwrap_or(0);
        self.last_committed = self
            .store
            .get_u64(&self.prefix, KEY_LAST_COMMITTED)
            .unwrap_or(0);
        self.accepted_pn = self.read_pn(KEY_ACCEPTED_PN);
        self.last_pn = self.read_pn(KEY_LAST_PN);
    }

    pub fn svc(&self) -> &str {
        &self.svc
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_leading(&self) -> bool {
        self.leading
    }

    pub fn first_committed(&self) -> Version {
        self.first_committed
    }

    pub fn last_committed(&self) -> Version {
        self.last_committed
    }

    pub fn get_version(&self, v: Version) -> Option<Bytes> {
        self.store.get(&self.prefix, &version_key(v))
    }

    /// True while this peer may answer reads for the service locally: the
    /// leader whenever it is out of recovery, a peon under an unexpired
    /// lease.
    pub fn is_readable(&self, now_ms: u64) -> bool {
        if self.state == State::Recovering {
            return false;
        }
        self.leading || now_ms < self.lease_expire_ms
    }

    pub fn set_trim_enabled(&mut self, enabled: bool) {
        self.trim_enabled = enabled;
    }

    /// The version the next accepted proposal will land at, counting the
    /// in-flight value and everything queued behind it.
    pub fn next_version(&self) -> Version {
        let in_flight = self.pending_value.is_some() as u64;
        self.last_committed + in_flight + self.queue.len() as u64 + 1
    }

    /// Committed entries from `from` (inclusive) up to the head, clamped to
    /// the untrimmed window.
    pub fn committed_entries(&self, from: Version) -> Vec<(Version, Bytes)> {
        self.entries_between(from.saturating_sub(1), self.last_committed)
    }

    /// Drops any in-flight round on a state reset (re-probe, new election).
    /// Persistent promises stay; epoch checks discard the stale replies.
    pub fn restart(&mut self) {
        self.state = State::Recovering;
        self.leading = false;
        self.pending_value = None;
        self.accepts = 0;
        self.queue.clear();
        self.lease_expire_ms = 0;
        self.lease_acks = 0;
    }

    // ---- election handoff ----

    /// The monitor won an election; reconcile the peons.
    pub fn leader_start(&mut self, epoch: u64, quorum: &[Rank], now_ms: u64) -> Result<Vec<Event>> {
        self.leading = true;
        self.leader = self.rank;
        self.epoch = epoch;
        self.quorum = quorum.to_vec();
        self.state = State::Recovering;
        self.accepts = 0;
        self.num_last = 1;
        self.lease_acks = 0;
        self.uncommitted_v = 0;
        self.uncommitted_pn = ProposalId::default();
        self.uncommitted_value = None;
        self.pending_value = None;

        // Our own pending value from a previous reign is a recovery
        // candidate like any other.
        if let Some(v) = self.store.get_u64(&self.prefix, KEY_PENDING_V) {
            if v == self.last_committed + 1 {
                if let Some(value) = self.store.get(&self.prefix, KEY_PENDING_VALUE) {
                    self.uncommitted_v = v;
                    self.uncommitted_pn = self.read_pn(KEY_PENDING_PN);
                    self.uncommitted_value = Some(value);
                }
            }
        }

        self.new_pn()?;
        debug!(svc = %self.svc, pn = ?self.pn, "collect round started");
        let msg = Message::PaxosCollect(PaxosCollect {
            svc: self.svc.clone(),
            pn: self.pn,
            last_committed: self.last_committed,
            first_committed: self.first_committed,
        });
        let peers = self.peon_ranks();
        for r in &peers {
            self.net.send_mon(*r, self.epoch, msg.clone());
        }
        if peers.is_empty() {
            return self.recovery_done(now_ms);
        }
        Ok(Vec::new())
    }

    /// The monitor lost an election to `leader`.
    pub fn peon_start(&mut self, epoch: u64, leader: Rank, quorum: &[Rank]) {
        self.leading = false;
        self.leader = leader;
        self.epoch = epoch;
        self.quorum = quorum.to_vec();
        self.state = State::Recovering;
        self.accepts = 0;
        self.pending_value = None;
        self.queue.clear();
        self.lease_expire_ms = 0;
    }

    // ---- collect / last (recovery) ----

    pub fn handle_collect(&mut self, from: Rank, msg: &PaxosCollect) -> Result<Vec<Event>> {
        if self.leading || from != self.leader {
            return Ok(Vec::new());
        }
        if msg.pn > self.accepted_pn {
            let mut tx = Transaction::new();
            tx.put(&self.prefix, KEY_ACCEPTED_PN, &msg.pn.encode());
            self.store.apply(tx)?;
            self.accepted_pn = msg.pn;
        }
        self.state = State::Active;

        let mut uncommitted_pn = None;
        let mut uncommitted_v = 0;
        let mut uncommitted_value = None;
        if let Some(v) = self.store.get_u64(&self.prefix, KEY_PENDING_V) {
            if v == self.last_committed + 1 {
                if let Some(value) = self.store.get(&self.prefix, KEY_PENDING_VALUE) {
                    uncommitted_pn = Some(self.read_pn(KEY_PENDING_PN));
                    uncommitted_v = v;
                    uncommitted_value = Some(value);
                }
            }
        }

        // Share committed entries the new leader is missing.
        let commits = self.entries_between(msg.last_committed, self.last_committed);

        self.net.send_mon(
            from,
            self.epoch,
            Message::PaxosLast(PaxosLast {
                svc: self.svc.clone(),
                pn: self.accepted_pn,
                last_committed: self.last_committed,
                first_committed: self.first_committed,
                uncommitted_pn,
                uncommitted_v,
                uncommitted_value,
                commits,
            }),
        );
        Ok(Vec::new())
    }

    pub fn handle_last(&mut self, from: Rank, msg: &PaxosLast, now_ms: u64) -> Result<Vec<Event>> {
        if !self.leading || self.state != State::Recovering {
            return Ok(Vec::new());
        }
        if msg.pn > self.pn {
            // A peon promised someone higher; restart the round above it.
            debug!(svc = %self.svc, theirs = ?msg.pn, "collect outbid, retrying");
            self.last_pn.counter = msg.pn.counter;
            return self.leader_start(self.epoch, &self.quorum.clone(), now_ms);
        }
        if msg.pn < self.pn {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();

        // First learn anything the peon committed past us.
        for (v, value) in &msg.commits {
            if *v == self.last_committed + 1 {
                self.commit_value(*v, value.clone())?;
                events.push(Event::Committed {
                    version: *v,
                    value: value.clone(),
                });
            }
        }
        if msg.last_committed > self.last_committed && msg.first_committed > self.last_committed + 1
        {
            // The peon is ahead and its log window no longer covers our
            // position; replay cannot save us.
            warn!(svc = %self.svc, "own state predates peer log window");
            return Ok(vec![Event::TooStale]);
        }

        // Then help the peon if it is behind.
        if msg.last_committed < self.last_committed {
            let gap = self.last_committed - msg.last_committed;
            if gap > self.tunables.slurp_threshold || msg.last_committed + 1 < self.first_committed
            {
                events.push(Event::PeerTooStale {
                    rank: from,
                    last_committed: msg.last_committed,
                });
            } else {
                let values = self.entries_between(msg.last_committed, self.last_committed);
                self.net.send_mon(
                    from,
                    self.epoch,
                    Message::PaxosCommit(PaxosCommit {
                        svc: self.svc.clone(),
                        pn: self.pn,
                        last_committed: self.last_committed,
                        values,
                    }),
                );
            }
        }

        // Track the highest-numbered uncommitted value at our next slot.
        if let (Some(pn), Some(value)) = (msg.uncommitted_pn, msg.uncommitted_value.as_ref()) {
            if msg.uncommitted_v == self.last_committed + 1 && pn > self.uncommitted_pn {
                self.uncommitted_v = msg.uncommitted_v;
                self.uncommitted_pn = pn;
                self.uncommitted_value = Some(value.clone());
            }
        }

        self.num_last += 1;
        if self.num_last == self.quorum.len() {
            let mut more = self.recovery_done(now_ms)?;
            events.append(&mut more);
        }
        Ok(events)
    }

    fn recovery_done(&mut self, now_ms: u64) -> Result<Vec<Event>> {
        self.state = State::Active;
        trace!(svc = %self.svc, "recovery complete");
        let mut events = vec![Event::Recovered];
        if let Some(value) = self.uncommitted_value.take() {
            if self.uncommitted_v == self.last_committed + 1 {
                info!(svc = %self.svc, v = self.uncommitted_v, "re-proposing uncommitted value");
                events.extend(self.begin(value, now_ms)?);
                return Ok(events);
            }
        }
        if let Some(next) = self.queue.pop_front() {
            events.extend(self.begin(next, now_ms)?);
        }
        Ok(events)
    }

    // ---- propose / begin / accept / commit ----

    /// Queues or starts a proposal. Leader only; the router forwards client
    /// writes before they get here.
    pub fn propose(&mut self, value: Bytes, now_ms: u64) -> Result<Vec<Event>> {
        debug_assert!(self.leading);
        match self.state {
            State::Active => self.begin(value, now_ms),
            _ => {
                self.queue.push_back(value);
                Ok(Vec::new())
            }
        }
    }

    fn begin(&mut self, value: Bytes, now_ms: u64) -> Result<Vec<Event>> {
        let v = self.last_committed + 1;
        self.state = State::Updating;
        self.accepts = bit(self.rank);
        self.pending_value = Some(value.clone());

        let mut tx = Transaction::new();
        tx.put_u64(&self.prefix, KEY_PENDING_V, v);
        tx.put(&self.prefix, KEY_PENDING_PN, &self.pn.encode());
        tx.put(&self.prefix, KEY_PENDING_VALUE, &value);
        tx.put(&self.prefix, KEY_ACCEPTED_PN, &self.pn.encode());
        self.store.apply(tx)?;
        self.accepted_pn = self.pn;

        trace!(svc = %self.svc, v, "begin");
        let msg = Message::PaxosBegin(PaxosBegin {
            svc: self.svc.clone(),
            pn: self.pn,
            v,
            value,
        });
        for r in self.peon_ranks() {
            self.net.send_mon(r, self.epoch, msg.clone());
        }
        if count(self.accepts) >= majority(self.quorum.len()) {
            // Quorum of one.
            return self.commit_pending(now_ms);
        }
        Ok(Vec::new())
    }

    pub fn handle_begin(&mut self, from: Rank, msg: &PaxosBegin) -> Result<Vec<Event>> {
        if self.leading || from != self.leader {
            return Ok(Vec::new());
        }
        if msg.pn < self.accepted_pn {
            // Stale proposer; a fresh election will sort it out.
            trace!(svc = %self.svc, "ignoring begin below promise");
            return Ok(Vec::new());
        }
        if msg.v <= self.last_committed {
            // Already committed here; accepting again is harmless and lets a
            // replaying leader make progress.
            self.send_accept(from, msg.pn, msg.v);
            return Ok(Vec::new());
        }

        let mut tx = Transaction::new();
        tx.put(&self.prefix, KEY_ACCEPTED_PN, &msg.pn.encode());
        tx.put_u64(&self.prefix, KEY_PENDING_V, msg.v);
        tx.put(&self.prefix, KEY_PENDING_PN, &msg.pn.encode());
        tx.put(&self.prefix, KEY_PENDING_VALUE, &msg.value);
        self.store.apply(tx)?;
        self.accepted_pn = msg.pn;

        self.send_accept(from, msg.pn, msg.v);
        Ok(Vec::new())
    }

    fn send_accept(&self, to: Rank, pn: ProposalId, v: Version) {
        self.net.send_mon(
            to,
            self.epoch,
            Message::PaxosAccept(PaxosAccept {
                svc: self.svc.clone(),
                pn,
                v,
                last_committed: self.last_committed,
            }),
        );
    }

    pub fn handle_accept(
        &mut self,
        from: Rank,
        msg: &PaxosAccept,
        now_ms: u64,
    ) -> Result<Vec<Event>> {
        if !self.leading || self.state != State::Updating {
            return Ok(Vec::new());
        }
        if msg.pn != self.pn || msg.v != self.last_committed + 1 {
            return Ok(Vec::new());
        }
        if !self.quorum.contains(&from) {
            return Ok(Vec::new());
        }
        self.accepts |= bit(from);
        if count(self.accepts) < majority(self.quorum.len()) {
            return Ok(Vec::new());
        }
        self.commit_pending(now_ms)
    }

    fn commit_pending(&mut self, now_ms: u64) -> Result<Vec<Event>> {
        let v = self.last_committed + 1;
        let value = match self.pending_value.take() {
            Some(value) => value,
            None => return Ok(Vec::new()),
        };
        self.commit_value(v, value.clone())?;
        let msg = Message::PaxosCommit(PaxosCommit {
            svc: self.svc.clone(),
            pn: self.pn,
            last_committed: self.last_committed,
            values: vec![(v, value.clone())],
        });
        for r in self.peon_ranks() {
            self.net.send_mon(r, self.epoch, msg.clone());
        }
        self.state = State::Active;
        self.extend_lease(now_ms);

        let mut events = vec![Event::Committed { version: v, value }];
        if let Some(next) = self.queue.pop_front() {
            events.extend(self.begin(next, now_ms)?);
        }
        Ok(events)
    }

    /// Writes one committed entry and advances the pointers, atomically.
    fn commit_value(&mut self, v: Version, value: Bytes) -> Result<()> {
        debug_assert_eq!(v, self.last_committed + 1);
        let mut tx = Transaction::new();
        tx.put(&self.prefix, &version_key(v), &value);
        tx.put_u64(&self.prefix, KEY_LAST_COMMITTED, v);
        if self.first_committed == 0 {
            tx.put_u64(&self.prefix, KEY_FIRST_COMMITTED, v);
        }
        tx.erase(&self.prefix, KEY_PENDING_V);
        tx.erase(&self.prefix, KEY_PENDING_PN);
        tx.erase(&self.prefix, KEY_PENDING_VALUE);
        self.store.apply(tx)?;
        self.last_committed = v;
        if self.first_committed == 0 {
            self.first_committed = v;
        }
        self.maybe_trim()?;
        Ok(())
    }

    pub fn handle_commit(&mut self, from: Rank, msg: &PaxosCommit) -> Result<Vec<Event>> {
        if self.leading || from != self.leader {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        for (v, value) in &msg.values {
            if *v != self.last_committed + 1 {
                continue;
            }
            self.commit_value(*v, value.clone())?;
            events.push(Event::Committed {
                version: *v,
                value: value.clone(),
            });
        }
        if msg.last_committed > self.last_committed {
            // A hole we cannot fill from this message; probing will route us
            // through sync if it persists.
            debug!(
                svc = %self.svc,
                ours = self.last_committed,
                leader = msg.last_committed,
                "commit left us behind"
            );
        }
        Ok(events)
    }

    // ---- lease ----

    /// Leader: (re)grants the read lease to the quorum. Called after every
    /// commit and on the renewal tick.
    pub fn extend_lease(&mut self, now_ms: u64) {
        debug_assert!(self.leading);
        self.lease_expire_ms = now_ms + self.tunables.lease_timeout_ms;
        self.lease_acks = bit(self.rank);
        let msg = Message::PaxosLease(PaxosLease {
            svc: self.svc.clone(),
            last_committed: self.last_committed,
            lease_expire_ms: self.lease_expire_ms,
        });
        for r in self.peon_ranks() {
            self.net.send_mon(r, self.epoch, msg.clone());
        }
    }

    pub fn handle_lease(&mut self, from: Rank, msg: &PaxosLease) -> Result<Vec<Event>> {
        if self.leading || from != self.leader {
            return Ok(Vec::new());
        }
        // A lease only covers state we actually have; if we missed a commit
        // we keep acking (so the leader sees our position) without widening
        // our read window.
        if msg.last_committed <= self.last_committed {
            self.lease_expire_ms = self.lease_expire_ms.max(msg.lease_expire_ms);
        }
        self.net.send_mon(
            from,
            self.epoch,
            Message::PaxosLeaseAck(PaxosLeaseAck {
                svc: self.svc.clone(),
                last_committed: self.last_committed,
            }),
        );
        Ok(Vec::new())
    }

    pub fn handle_lease_ack(&mut self, from: Rank, _msg: &PaxosLeaseAck) {
        if self.leading {
            self.lease_acks |= bit(from);
        }
    }

    /// Peon lease deadline, for the monitor's freshness check.
    pub fn lease_expire_ms(&self) -> u64 {
        self.lease_expire_ms
    }

    // ---- trim ----

    fn maybe_trim(&mut self) -> Result<()> {
        if !self.trim_enabled {
            return Ok(());
        }
        if self.last_committed - self.first_committed <= self.tunables.trim_min {
            return Ok(());
        }
        let new_first = self.last_committed - self.tunables.trim_min;
        let mut tx = Transaction::new();
        tx.erase_range(&self.prefix, &version_key(0), &version_key(new_first));
        tx.put_u64(&self.prefix, KEY_FIRST_COMMITTED, new_first);
        self.store.apply(tx)?;
        trace!(svc = %self.svc, new_first, "trimmed");
        self.first_committed = new_first;
        Ok(())
    }

    // ---- helpers ----

    fn peon_ranks(&self) -> Vec<Rank> {
        self.quorum
            .iter()
            .copied()
            .filter(|r| *r != self.rank)
            .collect()
    }

    fn entries_between(&self, after: Version, upto: Version) -> Vec<(Version, Bytes)> {
        if upto <= after {
            return Vec::new();
        }
        let from = (after + 1).max(self.first_committed.max(1));
        self.store
            .range_scan(&self.prefix, &version_key(from), &version_key(upto + 1))
            .filter_map(|(k, value)| crate::store::version_from_key(&k).map(|v| (v, value)))
            .collect()
    }

    fn read_pn(&self, key: &[u8]) -> ProposalId {
        self.store
            .get(&self.prefix, key)
            .and_then(|raw| ProposalId::decode(&raw))
            .unwrap_or_default()
    }

    fn new_pn(&mut self) -> Result<()> {
        let base = self.last_pn.counter.max(self.accepted_pn.counter);
        self.pn = ProposalId {
            counter: base + 1,
            rank: self.rank,
        };
        self.last_pn = self.pn;
        let mut tx = Transaction::new();
        tx.put(&self.prefix, KEY_LAST_PN, &self.pn.encode());
        self.store.apply(tx)?;
        Ok(())
    }
}

fn bit(rank: Rank) -> u64 {
    1u64 << (rank as u64 & 63)
}

fn count(mask: u64) -> usize {
    mask.count_ones() as usize
}

fn majority(quorum_size: usize) -> usize {
    quorum_size / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{CaptureMessenger, CaptureState};
    use crate::store::mem::MemStore;
    use std::cell::RefCell;

    const TUNABLES: Tunables = Tunables {
        trim_min: 500,
        slurp_threshold: 32,
        lease_timeout_ms: 10_000,
    };

    fn instance(rank: Rank) -> (Paxos, Rc<RefCell<CaptureState>>, Rc<dyn Store>) {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        let (state, net) = CaptureMessenger::new();
        let p = Paxos::new("osdmap", rank, store.clone(), net, TUNABLES);
        (p, state, store)
    }

    fn take_msgs(state: &Rc<RefCell<CaptureState>>) -> Vec<(Rank, Message)> {
        state
            .borrow_mut()
            .mons
            .drain(..)
            .map(|(r, _, m)| (r, m))
            .collect()
    }

    /// Drives a sole-member leader through `n` commits.
    fn commit_n(p: &mut Paxos, n: u64) {
        for i in 1..=n {
            let events = p.propose(Bytes::from(format!("v{i}")), 0).unwrap();
            assert_eq!(events.len(), 1, "commit {i}");
        }
    }

    #[test]
    fn proposal_id_orders_by_counter_then_rank() {
        let a = ProposalId { counter: 5, rank: 0 };
        let b = ProposalId { counter: 4, rank: 2 };
        let c = ProposalId { counter: 5, rank: 1 };
        assert!(a > b);
        assert!(c > a);
        assert_eq!(ProposalId::decode(&a.encode()), Some(a));
    }

    #[test]
    fn sole_member_commits_immediately() {
        let (mut p, state, store) = instance(0);
        let events = p.leader_start(2, &[0], 0).unwrap();
        assert_eq!(events, vec![Event::Recovered]);
        assert_eq!(p.state(), State::Active);

        let events = p.propose(Bytes::from_static(b"one"), 0).unwrap();
        assert_eq!(
            events,
            vec![Event::Committed {
                version: 1,
                value: Bytes::from_static(b"one")
            }]
        );
        assert_eq!(p.last_committed(), 1);
        assert_eq!(p.first_committed(), 1);
        assert_eq!(
            store.get("paxos/osdmap", &version_key(1)),
            Some(Bytes::from_static(b"one"))
        );
        // No peons, no messages.
        assert!(take_msgs(&state).is_empty());
    }

    #[test]
    fn three_member_full_round() {
        let (mut leader, lstate, lstore) = instance(0);
        let (mut peon1, p1state, p1store) = instance(1);
        let (mut peon2, p2state, _) = instance(2);

        let quorum = vec![0u16, 1, 2];
        assert!(leader.leader_start(2, &quorum, 0).unwrap().is_empty());
        peon1.peon_start(2, 0, &quorum);
        peon2.peon_start(2, 0, &quorum);

        let collects = take_msgs(&lstate);
        assert_eq!(collects.len(), 2);
        let collect = match &collects[0].1 {
            Message::PaxosCollect(c) => c.clone(),
            other => panic!("expected collect, got {other:?}"),
        };

        peon1.handle_collect(0, &collect).unwrap();
        peon2.handle_collect(0, &collect).unwrap();
        let last1 = match take_msgs(&p1state).remove(0).1 {
            Message::PaxosLast(l) => l,
            other => panic!("expected last, got {other:?}"),
        };
        let last2 = match take_msgs(&p2state).remove(0).1 {
            Message::PaxosLast(l) => l,
            other => panic!("expected last, got {other:?}"),
        };

        assert!(leader.handle_last(1, &last1, 0).unwrap().is_empty());
        let events = leader.handle_last(2, &last2, 0).unwrap();
        assert_eq!(events, vec![Event::Recovered]);
        assert_eq!(leader.state(), State::Active);

        let events = leader
            .propose(Bytes::from_static(b"epoch-1-map"), 0)
            .unwrap();
        assert!(events.is_empty());
        let begins = take_msgs(&lstate);
        assert_eq!(begins.len(), 2);
        let begin = match &begins[0].1 {
            Message::PaxosBegin(b) => b.clone(),
            other => panic!("expected begin, got {other:?}"),
        };
        assert_eq!(begin.v, 1);

        peon1.handle_begin(0, &begin).unwrap();
        let accept = match take_msgs(&p1state).remove(0).1 {
            Message::PaxosAccept(a) => a,
            other => panic!("expected accept, got {other:?}"),
        };

        // Majority (leader + peon1) commits.
        let events = leader.handle_accept(1, &accept, 1000).unwrap();
        assert_eq!(
            events,
            vec![Event::Committed {
                version: 1,
                value: Bytes::from_static(b"epoch-1-map")
            }]
        );
        assert_eq!(leader.last_committed(), 1);
        assert_eq!(
            lstore.get("paxos/osdmap", &version_key(1)),
            Some(Bytes::from_static(b"epoch-1-map"))
        );

        // The commit broadcast carries the payload; peons apply identically.
        let mut commit = None;
        let mut lease_seen = false;
        for (_, msg) in take_msgs(&lstate) {
            match msg {
                Message::PaxosCommit(c) => commit = Some(c),
                Message::PaxosLease(_) => lease_seen = true,
                _ => {}
            }
        }
        assert!(lease_seen, "commit extends the lease");
        let commit = commit.expect("commit broadcast");
        let events = peon1.handle_commit(0, &commit).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(peon1.last_committed(), 1);
        assert_eq!(
            p1store.get("paxos/osdmap", &version_key(1)),
            Some(Bytes::from_static(b"epoch-1-map"))
        );
    }

    #[test]
    fn begin_below_promise_is_ignored() {
        let (mut peon, state, _) = instance(1);
        peon.peon_start(2, 0, &[0, 1]);
        peon.handle_collect(
            0,
            &PaxosCollect {
                svc: "osdmap".into(),
                pn: ProposalId { counter: 9, rank: 0 },
                last_committed: 0,
                first_committed: 0,
            },
        )
        .unwrap();
        take_msgs(&state);

        let events = peon
            .handle_begin(
                0,
                &PaxosBegin {
                    svc: "osdmap".into(),
                    pn: ProposalId { counter: 3, rank: 0 },
                    v: 1,
                    value: Bytes::from_static(b"old"),
                },
            )
            .unwrap();
        assert!(events.is_empty());
        assert!(take_msgs(&state).is_empty());
    }

    #[test]
    fn higher_promise_outbids_collect() {
        let (mut leader, lstate, _) = instance(0);
        leader.leader_start(2, &[0, 1], 0).unwrap();
        let first_pn = leader.pn;
        take_msgs(&lstate);

        let events = leader
            .handle_last(
                1,
                &PaxosLast {
                    svc: "osdmap".into(),
                    pn: ProposalId {
                        counter: first_pn.counter + 5,
                        rank: 1,
                    },
                    last_committed: 0,
                    first_committed: 0,
                    uncommitted_pn: None,
                    uncommitted_v: 0,
                    uncommitted_value: None,
                    commits: vec![],
                },
                0,
            )
            .unwrap();
        assert!(events.is_empty());
        assert!(leader.pn.counter > first_pn.counter + 5);
        let resent = take_msgs(&lstate);
        assert!(matches!(resent[0].1, Message::PaxosCollect(_)));
    }

    #[test]
    fn recovery_re_proposes_highest_uncommitted() {
        let (mut leader, lstate, _) = instance(0);
        leader.leader_start(2, &[0, 1, 2], 0).unwrap();
        take_msgs(&lstate);
        let pn = leader.pn;

        leader
            .handle_last(
                1,
                &PaxosLast {
                    svc: "osdmap".into(),
                    pn,
                    last_committed: 0,
                    first_committed: 0,
                    uncommitted_pn: Some(ProposalId { counter: 1, rank: 1 }),
                    uncommitted_v: 1,
                    uncommitted_value: Some(Bytes::from_static(b"low")),
                    commits: vec![],
                },
                0,
            )
            .unwrap();
        let events = leader
            .handle_last(
                2,
                &PaxosLast {
                    svc: "osdmap".into(),
                    pn,
                    last_committed: 0,
                    first_committed: 0,
                    uncommitted_pn: Some(ProposalId { counter: 2, rank: 2 }),
                    uncommitted_v: 1,
                    uncommitted_value: Some(Bytes::from_static(b"high")),
                    commits: vec![],
                },
                0,
            )
            .unwrap();
        assert_eq!(events, vec![Event::Recovered]);
        assert_eq!(leader.state(), State::Updating);
        let begins = take_msgs(&lstate);
        let begin = begins
            .iter()
            .find_map(|(_, m)| match m {
                Message::PaxosBegin(b) => Some(b.clone()),
                _ => None,
            })
            .expect("begin for recovered value");
        assert_eq!(begin.value, Bytes::from_static(b"high"));
        assert_eq!(begin.v, 1);
    }

    #[test]
    fn collect_learns_peon_commits() {
        let (mut leader, lstate, _) = instance(0);
        leader.leader_start(2, &[0, 1], 0).unwrap();
        take_msgs(&lstate);
        let pn = leader.pn;

        let events = leader
            .handle_last(
                1,
                &PaxosLast {
                    svc: "osdmap".into(),
                    pn,
                    last_committed: 2,
                    first_committed: 1,
                    uncommitted_pn: None,
                    uncommitted_v: 0,
                    uncommitted_value: None,
                    commits: vec![
                        (1, Bytes::from_static(b"one")),
                        (2, Bytes::from_static(b"two")),
                    ],
                },
                0,
            )
            .unwrap();
        assert_eq!(leader.last_committed(), 2);
        assert_eq!(events.len(), 3); // two commits + recovered
        assert_eq!(
            events[1],
            Event::Committed {
                version: 2,
                value: Bytes::from_static(b"two")
            }
        );
    }

    #[test]
    fn lagging_peon_caught_up_from_leader_log() {
        let (mut leader, lstate, _) = instance(0);
        leader.leader_start(2, &[0], 0).unwrap();
        take_msgs(&lstate);
        commit_n(&mut leader, 5);
        assert_eq!(leader.last_committed(), 5);

        // New term with a lagging peon.
        leader.leader_start(4, &[0, 1], 0).unwrap();
        take_msgs(&lstate);
        let pn = leader.pn;
        leader
            .handle_last(
                1,
                &PaxosLast {
                    svc: "osdmap".into(),
                    pn,
                    last_committed: 2,
                    first_committed: 1,
                    uncommitted_pn: None,
                    uncommitted_v: 0,
                    uncommitted_value: None,
                    commits: vec![],
                },
                0,
            )
            .unwrap();
        let sent = take_msgs(&lstate);
        let commit = sent
            .iter()
            .find_map(|(to, m)| match m {
                Message::PaxosCommit(c) if *to == 1 => Some(c.clone()),
                _ => None,
            })
            .expect("catch-up commit");
        let versions: Vec<u64> = commit.values.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[test]
    fn peer_beyond_slurp_threshold_flagged_for_sync() {
        let (mut leader, lstate, _) = instance(0);
        leader.leader_start(2, &[0], 0).unwrap();
        take_msgs(&lstate);
        commit_n(&mut leader, 40);

        leader.leader_start(4, &[0, 1], 0).unwrap();
        take_msgs(&lstate);
        let pn = leader.pn;
        let events = leader
            .handle_last(
                1,
                &PaxosLast {
                    svc: "osdmap".into(),
                    pn,
                    last_committed: 2,
                    first_committed: 1,
                    uncommitted_pn: None,
                    uncommitted_v: 0,
                    uncommitted_value: None,
                    commits: vec![],
                },
                0,
            )
            .unwrap();
        assert!(events.contains(&Event::PeerTooStale {
            rank: 1,
            last_committed: 2
        }));
    }

    #[test]
    fn commit_is_idempotent_and_ordered() {
        let (mut peon, _, _) = instance(1);
        peon.peon_start(2, 0, &[0, 1]);
        let pn = ProposalId { counter: 1, rank: 0 };
        let commit = PaxosCommit {
            svc: "osdmap".into(),
            pn,
            last_committed: 2,
            values: vec![
                (1, Bytes::from_static(b"one")),
                (2, Bytes::from_static(b"two")),
            ],
        };
        let events = peon.handle_commit(0, &commit).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(peon.last_committed(), 2);

        // Replay: nothing changes.
        let events = peon.handle_commit(0, &commit).unwrap();
        assert!(events.is_empty());
        assert_eq!(peon.last_committed(), 2);

        // An out-of-order value (gap) is not applied.
        let events = peon
            .handle_commit(
                0,
                &PaxosCommit {
                    svc: "osdmap".into(),
                    pn,
                    last_committed: 5,
                    values: vec![(5, Bytes::from_static(b"five"))],
                },
            )
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(peon.last_committed(), 2);
    }

    #[test]
    fn trim_keeps_window() {
        let (mut p, lstate, store) = instance(0);
        p.tunables.trim_min = 10;
        p.leader_start(2, &[0], 0).unwrap();
        take_msgs(&lstate);
        commit_n(&mut p, 25);
        assert_eq!(p.last_committed(), 25);
        assert_eq!(p.first_committed(), 15);
        assert!(store.get("paxos/osdmap", &version_key(14)).is_none());
        assert!(store.get("paxos/osdmap", &version_key(15)).is_some());

        // Trim suspended while a sync is serving.
        p.set_trim_enabled(false);
        for i in 26..=40u64 {
            p.propose(Bytes::from(format!("v{i}")), 0).unwrap();
        }
        assert_eq!(p.first_committed(), 15);
    }

    #[test]
    fn lease_governs_peon_reads() {
        let (mut peon, state, _) = instance(1);
        peon.peon_start(2, 0, &[0, 1]);
        peon.handle_collect(
            0,
            &PaxosCollect {
                svc: "osdmap".into(),
                pn: ProposalId { counter: 1, rank: 0 },
                last_committed: 0,
                first_committed: 0,
            },
        )
        .unwrap();
        take_msgs(&state);
        assert!(!peon.is_readable(0));

        peon.handle_lease(
            0,
            &PaxosLease {
                svc: "osdmap".into(),
                last_committed: 0,
                lease_expire_ms: 5_000,
            },
        )
        .unwrap();
        let sent = take_msgs(&state);
        assert!(matches!(sent[0].1, Message::PaxosLeaseAck(_)));
        assert!(peon.is_readable(4_999));
        assert!(!peon.is_readable(5_000));
    }

    #[test]
    fn persisted_state_survives_reload() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        let (_, net) = CaptureMessenger::new();
        {
            let mut p = Paxos::new("osdmap", 0, store.clone(), net.clone(), TUNABLES);
            p.leader_start(2, &[0], 0).unwrap();
            p.propose(Bytes::from_static(b"one"), 0).unwrap();
            assert_eq!(p.last_committed(), 1);
        }
        let p = Paxos::new("osdmap", 0, store, net, TUNABLES);
        assert_eq!(p.last_committed(), 1);
        assert_eq!(p.first_committed(), 1);
        assert!(!p.accepted_pn.is_zero());
    }
}
