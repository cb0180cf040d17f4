//! The monitor itself.
//!
//! One event loop owns everything: probing and bootstrap, the election
//! glue, one paxos instance per registered service, sync in both roles, the
//! session table and request routing. Messages and timer events are
//! dispatched here and nowhere else; components below this module never call
//! back up into it.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{Config, PROBE_BACKOFF_CEILING};
use crate::elector::{Elector, Outcome};
use crate::error::{Error, Result};
use crate::messages::{
    self, Command, CommandReply, Envelope, Forward, GetVersion, GetVersionReply, Message, Probe,
    ProbeReply, Route, Subscribe, SubscribePush, SvcVersions,
};
use crate::monmap::{MonMap, MonMapRef, Rank, RANK_NONE};
use crate::network::{ConnId, Messenger};
use crate::paxos::{self, Paxos, Tunables};
use crate::service::{CommandOutcome, ConfigService, MonmapService, Service};
use crate::session::{MonCaps, RoutedRequests, SessionMap, Subscription};
use crate::store::{
    Store, Transaction, KEY_ELECTION_EPOCH, KEY_FSID, KEY_JOINED, KEY_LATEST, KEY_NAME,
    PREFIX_MON, PREFIX_MONMAP,
};
use crate::sync::{self, RequesterEvent, SyncProvider, SyncRequester};
use crate::timer::TimerQueue;
use crate::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonState {
    Probing,
    Synchronizing,
    Electing,
    Leader,
    Peon,
    Shutdown,
}

impl MonState {
    pub fn name(&self) -> &'static str {
        match self {
            MonState::Probing => "probing",
            MonState::Synchronizing => "synchronizing",
            MonState::Electing => "electing",
            MonState::Leader => "leader",
            MonState::Peon => "peon",
            MonState::Shutdown => "shutdown",
        }
    }
}

/// Timer payloads. Entries carry the generation they were armed in; a stale
/// generation no-ops on fire. Sync heartbeats validate against the live
/// records instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimedEvent {
    ProbeTimeout,
    ElectionCheck,
    RecoveryCheck,
    LeaseRenew,
    SyncHeartbeat,
}

/// Where a command reply must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyTo {
    Client(ConnId),
    Routed { peon: Rank, tid: u64 },
}

struct ProbeSeen {
    in_quorum: bool,
}

/// Commands beyond this size are refused rather than replicated.
const MAX_COMMAND_BYTES: usize = 64 << 10;

/// Initializes a monitor data directory from a seed monmap. Refuses to
/// clobber an existing one.
pub fn mkfs(store: &Rc<dyn Store>, name: &str, monmap: &MonMap) -> Result<()> {
    if store.contains(PREFIX_MON, KEY_FSID) {
        return Err(Error::ConfigInvalid("data directory already initialized".into()));
    }
    if monmap.rank_of(name).is_none() {
        return Err(Error::ConfigInvalid(format!(
            "name {name:?} does not appear in the seed monmap"
        )));
    }
    let mut tx = Transaction::new();
    tx.put(PREFIX_MON, KEY_FSID, monmap.fsid.as_bytes());
    tx.put(PREFIX_MON, KEY_NAME, name.as_bytes());
    tx.put(PREFIX_MONMAP, KEY_LATEST, &monmap.encode());
    tx.put(PREFIX_MONMAP, &monmap.epoch.to_be_bytes(), &monmap.encode());
    store.apply(tx)?;
    info!(fsid = %monmap.fsid, name, "monitor data directory initialized");
    Ok(())
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("fsid", &self.fsid)
            .field("name", &self.name)
            .field("rank", &self.rank)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

pub struct Monitor {
    cfg: Config,
    clock: Clock,
    store: Rc<dyn Store>,
    net: Rc<dyn Messenger>,

    fsid: Uuid,
    name: String,
    rank: Rank,
    monmap: MonMapRef,
    has_ever_joined: bool,

    state: MonState,
    state_since_ms: u64,
    /// Bumped on every reset; stale timer events check it and no-op.
    generation: u64,

    elector: Elector,
    persisted_epoch: u64,
    paxos: BTreeMap<String, Paxos>,
    services: BTreeMap<String, Box<dyn Service>>,

    leader: Rank,
    quorum: Vec<Rank>,
    election_finished: bool,

    probe_backoff: u32,
    probes_seen: HashMap<Rank, ProbeSeen>,
    extra_probe_peers: Vec<SocketAddr>,

    sync_provider: SyncProvider,
    sync_requester: Option<SyncRequester>,

    sessions: SessionMap,
    routed: RoutedRequests,
    timers: TimerQueue<TimedEvent>,
    /// Command replies waiting on a commit: (svc, version, target, client tid).
    pending_replies: Vec<(String, Version, ReplyTo, u64)>,
}

impl Monitor {
    /// Builds a monitor over an initialized store. `extra_services` come on
    /// top of the built-in monmap and config services.
    pub fn new(
        cfg: Config,
        store: Rc<dyn Store>,
        net: Rc<dyn Messenger>,
        clock: Clock,
        extra_services: Vec<Box<dyn Service>>,
    ) -> Result<Monitor> {
        let fsid_raw = store
            .get(PREFIX_MON, KEY_FSID)
            .ok_or_else(|| Error::ConfigInvalid("data directory not initialized (run mkfs)".into()))?;
        let fsid = Uuid::from_slice(&fsid_raw)
            .map_err(|_| Error::StoreCorrupt("bad fsid record".into()))?;
        let stored_name = store
            .get(PREFIX_MON, KEY_NAME)
            .map(|raw| String::from_utf8_lossy(&raw).to_string())
            .ok_or_else(|| Error::StoreCorrupt("missing name record".into()))?;
        if stored_name != cfg.name {
            return Err(Error::ConfigInvalid(format!(
                "data directory belongs to {stored_name:?}, configured as {:?}",
                cfg.name
            )));
        }

        if sync::sync_was_interrupted(&store) {
            // A crash mid-sync left half a store; drop the cluster prefixes
            // and start from nothing.
            warn!("previous sync was interrupted; discarding partial state");
            let mut tx = Transaction::new();
            for (prefix, key, _) in store.snapshot() {
                if prefix != PREFIX_MON {
                    tx.erase(&prefix, &key);
                }
            }
            tx.erase(PREFIX_MON, crate::store::KEY_SYNC_IN_PROGRESS);
            tx.erase(PREFIX_MON, crate::store::KEY_SYNC_CURSOR);
            store.apply(tx)?;
        }

        let monmap_raw = store
            .get(PREFIX_MONMAP, KEY_LATEST)
            .ok_or_else(|| Error::StoreCorrupt("missing monmap".into()))?;
        let monmap = MonMap::decode(monmap_raw)
            .map_err(|_| Error::StoreCorrupt("undecodable monmap".into()))?;
        if monmap.fsid != fsid {
            return Err(Error::FsidMismatch {
                peer: monmap.fsid,
                local: fsid,
            });
        }
        let rank = monmap
            .rank_of(&cfg.name)
            .ok_or_else(|| Error::ConfigInvalid(format!("{:?} not in monmap", cfg.name)))?;

        let has_ever_joined = store
            .get(PREFIX_MON, KEY_JOINED)
            .map(|raw| raw.first() == Some(&1))
            .unwrap_or(false);
        let persisted_epoch = store.get_u64(PREFIX_MON, KEY_ELECTION_EPOCH).unwrap_or(0);

        let mut services: BTreeMap<String, Box<dyn Service>> = BTreeMap::new();
        services.insert(MonmapService::NAME.to_string(), Box::new(MonmapService));
        services.insert(ConfigService::NAME.to_string(), Box::new(ConfigService));
        for svc in extra_services {
            services.insert(svc.name().to_string(), svc);
        }

        let tunables = Tunables {
            trim_min: cfg.paxos_trim_min,
            slurp_threshold: cfg.slurp_threshold,
            lease_timeout_ms: cfg.lease_timeout_ms,
        };
        let paxos = services
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    Paxos::new(name, rank, store.clone(), net.clone(), tunables),
                )
            })
            .collect();

        let now = clock.now_ms();
        Ok(Monitor {
            elector: Elector::new(rank, cfg.features, persisted_epoch),
            sync_provider: SyncProvider::new(
                cfg.sync_chunk_max_bytes,
                cfg.sync_chunk_max_keys,
                cfg.sync_timeout_ms,
            ),
            extra_probe_peers: cfg.extra_probe_peers.clone(),
            cfg,
            clock,
            store,
            net,
            fsid,
            name: stored_name,
            rank,
            monmap: Rc::new(monmap),
            has_ever_joined,
            state: MonState::Probing,
            state_since_ms: now,
            generation: 0,
            persisted_epoch,
            paxos,
            services,
            leader: RANK_NONE,
            quorum: Vec::new(),
            election_finished: false,
            probe_backoff: 1,
            probes_seen: HashMap::new(),
            sync_requester: None,
            sessions: SessionMap::new(),
            routed: RoutedRequests::new(),
            timers: TimerQueue::new(),
            pending_replies: Vec::new(),
        })
    }

    // ---- accessors ----

    pub fn state(&self) -> MonState {
        self.state
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn election_epoch(&self) -> u64 {
        self.elector.epoch()
    }

    pub fn leader(&self) -> Rank {
        self.leader
    }

    pub fn quorum(&self) -> &[Rank] {
        &self.quorum
    }

    pub fn monmap(&self) -> MonMapRef {
        self.monmap.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state == MonState::Leader
    }

    pub fn paxos(&self, svc: &str) -> Option<&Paxos> {
        self.paxos.get(svc)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    // ---- lifecycle ----

    /// (Re)enters probing. Safe from any state; all in-flight work is
    /// invalidated by the generation bump.
    pub fn bootstrap(&mut self) -> Result<()> {
        let now = self.now();
        self.set_state(MonState::Probing, now);
        self.generation += 1;
        self.leader = RANK_NONE;
        self.quorum.clear();
        self.election_finished = false;
        self.probes_seen.clear();
        self.probe_backoff = 1;
        self.sync_requester = None;
        self.pending_replies.clear();
        for paxos in self.paxos.values_mut() {
            paxos.restart();
        }
        info!(name = %self.name, rank = self.rank, "bootstrap: probing peers");
        if self.monmap.majority() == 1 {
            // Nobody to wait for.
            return self.start_election(now);
        }
        self.send_probes(now);
        self.timers.schedule(
            now + self.cfg.probe_timeout_ms,
            self.generation,
            TimedEvent::ProbeTimeout,
        );
        Ok(())
    }

    pub fn shutdown(&mut self) {
        let now = self.now();
        self.set_state(MonState::Shutdown, now);
        self.generation += 1;
        self.timers.clear();
    }

    /// Fires due timers. The run loop calls this on a short cadence; tests
    /// call it after advancing their manual clock.
    pub fn tick(&mut self) -> Result<()> {
        let now = self.now();
        for (generation, event) in self.timers.due(now) {
            match event {
                TimedEvent::SyncHeartbeat => self.on_sync_heartbeat_timer(now)?,
                _ if generation != self.generation => {}
                TimedEvent::ProbeTimeout => self.on_probe_timeout(now)?,
                TimedEvent::ElectionCheck => self.on_election_check(now)?,
                TimedEvent::RecoveryCheck => self.on_recovery_check(now)?,
                TimedEvent::LeaseRenew => self.on_lease_renew(now)?,
            }
        }
        Ok(())
    }

    // ---- event entry points ----

    pub fn dispatch_peer(&mut self, env: Envelope) -> Result<()> {
        if self.state == MonState::Shutdown {
            return Ok(());
        }
        let now = self.now();
        let from = env.from;
        match &env.msg {
            Message::Probe(m) => self.handle_probe(from, m),
            Message::ProbeReply(m) => self.handle_probe_reply(from, m, now)?,
            Message::Propose(m) => {
                if self.state != MonState::Synchronizing {
                    let monmap = self.monmap.clone();
                    let outcome = self.elector.handle_propose(
                        from,
                        env.epoch,
                        m.features,
                        now,
                        self.cfg.election_timeout_ms,
                        &monmap,
                        &self.net,
                    );
                    self.after_elector(outcome, now)?;
                }
            }
            Message::Victory(m) => {
                if self.state != MonState::Synchronizing {
                    let outcome = self.elector.handle_victory(from, env.epoch, m);
                    self.after_elector(outcome, now)?;
                }
            }
            Message::PaxosCollect(_)
            | Message::PaxosLast(_)
            | Message::PaxosBegin(_)
            | Message::PaxosAccept(_)
            | Message::PaxosCommit(_)
            | Message::PaxosLease(_)
            | Message::PaxosLeaseAck(_) => self.dispatch_paxos(&env, now)?,
            Message::SyncStart(m) => {
                if matches!(self.state, MonState::Leader | MonState::Peon) {
                    let trim_was_idle = !self.sync_provider.is_active();
                    let epoch = self.elector.epoch();
                    self.sync_provider
                        .handle_start(from, m, epoch, now, &self.store, &self.net);
                    if trim_was_idle {
                        self.set_trim(false);
                        self.timers.schedule(
                            now + self.cfg.sync_heartbeat_ms(),
                            0,
                            TimedEvent::SyncHeartbeat,
                        );
                    }
                } else {
                    self.net.send_mon(
                        from,
                        self.elector.epoch(),
                        Message::SyncStartReply(messages::SyncStartReply {
                            rc: Error::Busy("not serving state").code(),
                            reason: "not in quorum".to_string(),
                        }),
                    );
                }
            }
            Message::SyncChunkReply => {
                let epoch = self.elector.epoch();
                self.sync_provider
                    .handle_chunk_reply(from, epoch, now, &self.net);
            }
            Message::SyncHeartbeat(m) => {
                let epoch = self.elector.epoch();
                if let Some(req) = self.sync_requester.as_mut() {
                    if req.provider == from {
                        req.handle_heartbeat(m, epoch, now, &self.net);
                        return Ok(());
                    }
                }
                self.sync_provider
                    .handle_heartbeat(from, m, epoch, now, &self.net);
            }
            Message::SyncFinish => {
                self.sync_provider.handle_finish(from);
                if !self.sync_provider.is_active() {
                    self.set_trim(true);
                }
            }
            Message::SyncStartReply(m) => {
                if let Some(req) = self.sync_requester.as_mut() {
                    if req.provider == from {
                        if req.handle_start_reply(m, now) == Some(RequesterEvent::Failed) {
                            warn!(provider = from, "sync refused; falling back to probe");
                            self.bootstrap()?;
                        }
                    }
                }
            }
            Message::SyncChunk(m) => {
                let epoch = self.elector.epoch();
                let mut done = false;
                if let Some(req) = self.sync_requester.as_mut() {
                    if req.provider == from {
                        done = req.handle_chunk(m, epoch, now, &self.store, &self.net)?
                            == Some(RequesterEvent::Done);
                    }
                }
                if done {
                    self.finish_sync()?;
                }
            }
            Message::Forward(m) => self.handle_forward(from, m, now)?,
            Message::Route(m) => self.handle_route(m),
            // Client-bound traffic has no business arriving from a peer.
            _ => debug!(from, tag = env.msg.type_tag(), "unexpected peer message"),
        }
        Ok(())
    }

    pub fn dispatch_client(&mut self, con: ConnId, msg: Message) -> Result<()> {
        if self.state == MonState::Shutdown {
            return Ok(());
        }
        let now = self.now();
        self.sessions.ensure(con);
        match msg {
            Message::Command(cmd) => {
                let caps = self.sessions.get(con).map(|s| s.caps).unwrap_or(MonCaps::NONE);
                self.handle_command(ReplyTo::Client(con), &cmd, caps, now)?
            }
            Message::Subscribe(sub) => self.handle_subscribe(con, &sub, now),
            Message::GetVersion(get) => self.handle_get_version(ReplyTo::Client(con), &get, now),
            other => debug!(con, tag = other.type_tag(), "unexpected client message"),
        }
        Ok(())
    }

    /// The transport lost a client connection; drop everything tied to it.
    pub fn session_reset(&mut self, con: ConnId) {
        self.sessions.remove(con);
        self.routed.drop_con(con);
        self.pending_replies
            .retain(|(_, _, to, _)| !matches!(to, ReplyTo::Client(c) if *c == con));
    }

    // ---- probing (C3) ----

    fn send_probes(&mut self, _now: u64) {
        let epoch = self.elector.epoch();
        let probe = Message::Probe(Probe {
            fsid: self.fsid,
            name: self.name.clone(),
            monmap_epoch: self.monmap.epoch,
            has_ever_joined: self.has_ever_joined,
            features: self.cfg.features,
            versions: self.local_versions(),
        });
        for r in self.monmap.ranks() {
            if r != self.rank {
                self.net.send_mon(r, epoch, probe.clone());
            }
        }
        for addr in &self.extra_probe_peers {
            self.net.send_addr(*addr, epoch, probe.clone());
        }
    }

    fn handle_probe(&mut self, from: Rank, probe: &Probe) {
        let epoch = self.elector.epoch();
        if probe.fsid != self.fsid {
            warn!(from, theirs = %probe.fsid, "probe from foreign cluster");
            self.net.send_mon(
                from,
                epoch,
                Message::ProbeReply(ProbeReply {
                    fsid: self.fsid,
                    name: self.name.clone(),
                    fsid_mismatch: true,
                    monmap_epoch: self.monmap.epoch,
                    has_ever_joined: self.has_ever_joined,
                    features: self.cfg.features,
                    in_quorum: false,
                    leader: RANK_NONE,
                    quorum: Vec::new(),
                    versions: Vec::new(),
                    monmap: None,
                }),
            );
            return;
        }
        let in_quorum = matches!(self.state, MonState::Leader | MonState::Peon);
        self.net.send_mon(
            from,
            epoch,
            Message::ProbeReply(ProbeReply {
                fsid: self.fsid,
                name: self.name.clone(),
                fsid_mismatch: false,
                monmap_epoch: self.monmap.epoch,
                has_ever_joined: self.has_ever_joined,
                features: self.cfg.features,
                in_quorum,
                leader: if in_quorum { self.leader } else { RANK_NONE },
                quorum: if in_quorum { self.quorum.clone() } else { Vec::new() },
                versions: self.local_versions(),
                monmap: Some(self.monmap.encode()),
            }),
        );
    }

    fn handle_probe_reply(&mut self, from: Rank, reply: &ProbeReply, now: u64) -> Result<()> {
        if self.state != MonState::Probing {
            return Ok(());
        }
        if reply.fsid_mismatch || reply.fsid != self.fsid {
            error!(from, theirs = %reply.fsid, "fsid mismatch; cannot join that cluster");
            return Ok(());
        }
        let required = self.cfg.features;
        if reply.features & required != required {
            warn!(
                from,
                theirs = reply.features,
                required,
                "feature-incompatible peer ignored"
            );
            return Ok(());
        }

        // A newer membership map wins before any election happens.
        if reply.monmap_epoch > self.monmap.epoch {
            if let Some(raw) = &reply.monmap {
                if let Ok(map) = MonMap::decode(raw.clone()) {
                    let gen = self.generation;
                    self.install_monmap(map)?;
                    if self.generation != gen {
                        // The install restarted discovery.
                        return Ok(());
                    }
                }
            }
        }

        self.probes_seen.insert(
            from,
            ProbeSeen {
                in_quorum: reply.in_quorum,
            },
        );

        if reply.in_quorum {
            let provider = if reply.leader != RANK_NONE { reply.leader } else { from };
            let needs_sync = self.needs_sync(&reply.versions);
            if needs_sync {
                return self.start_sync(provider, now);
            }
            // Healthy enough to be absorbed through an election.
            return self.start_election(now);
        }

        // Both of us are probing; elect once a majority is reachable.
        let probing = 1 + self
            .probes_seen
            .values()
            .filter(|seen| !seen.in_quorum)
            .count();
        if probing >= self.monmap.majority() {
            return self.start_election(now);
        }
        Ok(())
    }

    /// Whether the gap to a quorum peer's versions is beyond paxos replay.
    fn needs_sync(&self, theirs: &[SvcVersions]) -> bool {
        for v in theirs {
            let Some(ours) = self.paxos.get(&v.svc) else {
                continue;
            };
            let gap = v.last_committed.saturating_sub(ours.last_committed());
            if gap > self.cfg.slurp_threshold {
                return true;
            }
            // A monitor that never joined treats any established history as
            // reason to copy state rather than vote with an empty store.
            if !self.has_ever_joined && ours.last_committed() == 0 && v.last_committed > 0 {
                return true;
            }
        }
        false
    }

    fn on_probe_timeout(&mut self, now: u64) -> Result<()> {
        if self.state != MonState::Probing {
            return Ok(());
        }
        self.probe_backoff = (self.probe_backoff * 2).min(PROBE_BACKOFF_CEILING);
        debug!(backoff = self.probe_backoff, "probe window expired; retrying");
        self.probes_seen.clear();
        self.send_probes(now);
        self.timers.schedule(
            now + self.cfg.probe_timeout_ms * self.probe_backoff as u64,
            self.generation,
            TimedEvent::ProbeTimeout,
        );
        Ok(())
    }

    // ---- elections (C4 glue) ----

    fn start_election(&mut self, now: u64) -> Result<()> {
        self.set_state(MonState::Electing, now);
        self.generation += 1;
        let monmap = self.monmap.clone();
        let outcome = self
            .elector
            .start(now, self.cfg.election_timeout_ms, &monmap, &self.net);
        self.timers.schedule(
            now + self.cfg.election_timeout_ms,
            self.generation,
            TimedEvent::ElectionCheck,
        );
        self.after_elector(outcome, now)
    }

    fn on_election_check(&mut self, now: u64) -> Result<()> {
        if self.state != MonState::Electing {
            return Ok(());
        }
        let monmap = self.monmap.clone();
        let outcome = self
            .elector
            .tick(now, self.cfg.election_timeout_ms, &monmap, &self.net);
        if self.elector.electing() {
            self.timers.schedule(
                now + self.cfg.election_timeout_ms,
                self.generation,
                TimedEvent::ElectionCheck,
            );
        }
        self.after_elector(outcome, now)
    }

    fn after_elector(&mut self, outcome: Option<Outcome>, now: u64) -> Result<()> {
        self.persist_election_epoch()?;
        // A propose may have pulled us into someone else's ballot.
        if self.elector.electing() && self.state != MonState::Electing {
            self.set_state(MonState::Electing, now);
            self.generation += 1;
            self.timers.schedule(
                now + self.cfg.election_timeout_ms,
                self.generation,
                TimedEvent::ElectionCheck,
            );
        }
        match outcome {
            None => Ok(()),
            Some(Outcome::StartElection) => self.start_election(now),
            Some(Outcome::Reset) => self.bootstrap(),
            Some(Outcome::Win { epoch, quorum }) => self.win_election(epoch, quorum, now),
            Some(Outcome::Lose {
                epoch,
                leader,
                quorum,
            }) => self.lose_election(epoch, leader, quorum, now),
        }
    }

    fn win_election(&mut self, epoch: u64, quorum: Vec<Rank>, now: u64) -> Result<()> {
        info!(epoch, ?quorum, "won election");
        self.set_state(MonState::Leader, now);
        self.generation += 1;
        self.leader = self.rank;
        self.quorum = quorum.clone();
        self.election_finished = false;
        self.persist_election_epoch()?;
        self.mark_joined()?;

        let svcs: Vec<String> = self.paxos.keys().cloned().collect();
        for svc in svcs {
            let events = self
                .paxos
                .get_mut(&svc)
                .unwrap()
                .leader_start(epoch, &quorum, now)?;
            self.apply_paxos_events(&svc, events, now)?;
            if self.state != MonState::Leader {
                return Ok(());
            }
        }
        self.maybe_finish_election(now)?;
        self.timers.schedule(
            now + self.cfg.election_timeout_ms,
            self.generation,
            TimedEvent::RecoveryCheck,
        );
        self.timers.schedule(
            now + self.cfg.lease_renew_ms(),
            self.generation,
            TimedEvent::LeaseRenew,
        );
        Ok(())
    }

    fn lose_election(
        &mut self,
        epoch: u64,
        leader: Rank,
        quorum: Vec<Rank>,
        now: u64,
    ) -> Result<()> {
        if !quorum.contains(&self.rank) {
            // The winner formed a quorum without us; keep probing until we
            // can be absorbed.
            debug!(epoch, "quorum formed without us");
            return self.bootstrap();
        }
        info!(epoch, leader, "lost election; serving as peon");
        self.set_state(MonState::Peon, now);
        self.generation += 1;
        self.leader = leader;
        self.quorum = quorum.clone();
        self.persist_election_epoch()?;
        self.mark_joined()?;
        for paxos in self.paxos.values_mut() {
            paxos.peon_start(epoch, leader, &quorum);
        }
        self.resend_routed_requests();
        self.timers.schedule(
            now + self.cfg.lease_timeout_ms,
            self.generation,
            TimedEvent::LeaseRenew,
        );
        Ok(())
    }

    /// Once every instance is through recovery the election is really over:
    /// empty services get their first proposal, services hear about the new
    /// quorum, and waiting subscribers get pushed.
    fn maybe_finish_election(&mut self, now: u64) -> Result<()> {
        if self.state != MonState::Leader || self.election_finished {
            return Ok(());
        }
        if self
            .paxos
            .values()
            .any(|p| p.state() == paxos::State::Recovering)
        {
            return Ok(());
        }
        self.election_finished = true;
        info!(epoch = self.elector.epoch(), "election finished; quorum active");

        let svcs: Vec<String> = self.paxos.keys().cloned().collect();
        for svc in &svcs {
            let bootstrap = {
                let paxos = &self.paxos[svc];
                if paxos.last_committed() == 0 {
                    self.services
                        .get(svc)
                        .and_then(|s| s.bootstrap_value(self.store.as_ref()))
                } else {
                    None
                }
            };
            if let Some(value) = bootstrap {
                let events = self.paxos.get_mut(svc).unwrap().propose(value, now)?;
                self.apply_paxos_events(svc, events, now)?;
            }
        }
        for service in self.services.values_mut() {
            service.on_active(true);
        }
        for svc in &svcs {
            self.check_subs(svc, now);
        }
        Ok(())
    }

    fn on_recovery_check(&mut self, _now: u64) -> Result<()> {
        if self.state != MonState::Leader {
            return Ok(());
        }
        if self
            .paxos
            .values()
            .any(|p| p.state() == paxos::State::Recovering)
        {
            warn!("paxos recovery stalled; restarting discovery");
            return self.bootstrap();
        }
        Ok(())
    }

    fn on_lease_renew(&mut self, now: u64) -> Result<()> {
        match self.state {
            MonState::Leader => {
                for paxos in self.paxos.values_mut() {
                    if paxos.state() != paxos::State::Recovering {
                        paxos.extend_lease(now);
                    }
                }
                self.timers.schedule(
                    now + self.cfg.lease_renew_ms(),
                    self.generation,
                    TimedEvent::LeaseRenew,
                );
            }
            MonState::Peon => {
                let min_expire = self
                    .paxos
                    .values()
                    .map(|p| p.lease_expire_ms())
                    .min()
                    .unwrap_or(0);
                let deadline =
                    min_expire.max(self.state_since_ms + self.cfg.lease_timeout_ms);
                if now >= deadline {
                    warn!("leader lease expired; restarting discovery");
                    return self.bootstrap();
                }
                self.timers
                    .schedule(deadline, self.generation, TimedEvent::LeaseRenew);
            }
            _ => {}
        }
        Ok(())
    }

    // ---- paxos dispatch (C5 glue) ----

    fn dispatch_paxos(&mut self, env: &Envelope, now: u64) -> Result<()> {
        if !matches!(self.state, MonState::Leader | MonState::Peon) {
            return Ok(());
        }
        if env.epoch != self.elector.epoch() {
            debug!(
                from = env.from,
                got = env.epoch,
                local = self.elector.epoch(),
                "paxos message from another epoch dropped"
            );
            return Ok(());
        }
        let from = env.from;
        let (svc, events) = match &env.msg {
            Message::PaxosCollect(m) => {
                let Some(p) = self.paxos.get_mut(&m.svc) else {
                    return Ok(());
                };
                (m.svc.clone(), p.handle_collect(from, m)?)
            }
            Message::PaxosLast(m) => {
                let Some(p) = self.paxos.get_mut(&m.svc) else {
                    return Ok(());
                };
                (m.svc.clone(), p.handle_last(from, m, now)?)
            }
            Message::PaxosBegin(m) => {
                let Some(p) = self.paxos.get_mut(&m.svc) else {
                    return Ok(());
                };
                (m.svc.clone(), p.handle_begin(from, m)?)
            }
            Message::PaxosAccept(m) => {
                let Some(p) = self.paxos.get_mut(&m.svc) else {
                    return Ok(());
                };
                (m.svc.clone(), p.handle_accept(from, m, now)?)
            }
            Message::PaxosCommit(m) => {
                let Some(p) = self.paxos.get_mut(&m.svc) else {
                    return Ok(());
                };
                (m.svc.clone(), p.handle_commit(from, m)?)
            }
            Message::PaxosLease(m) => {
                let Some(p) = self.paxos.get_mut(&m.svc) else {
                    return Ok(());
                };
                (m.svc.clone(), p.handle_lease(from, m)?)
            }
            Message::PaxosLeaseAck(m) => {
                if let Some(p) = self.paxos.get_mut(&m.svc) {
                    p.handle_lease_ack(from, m);
                }
                return Ok(());
            }
            _ => unreachable!("non-paxos message routed to dispatch_paxos"),
        };
        self.apply_paxos_events(&svc, events, now)
    }

    fn apply_paxos_events(
        &mut self,
        svc: &str,
        events: Vec<paxos::Event>,
        now: u64,
    ) -> Result<()> {
        for event in events {
            match event {
                paxos::Event::Committed { version, value } => {
                    if let Some(service) = self.services.get_mut(svc) {
                        service.on_commit(self.store.as_ref(), version, &value);
                    }
                    if svc == MonmapService::NAME {
                        let gen = self.generation;
                        self.refresh_monmap()?;
                        if self.generation != gen {
                            return Ok(());
                        }
                    }
                    self.check_subs(svc, now);
                    self.flush_pending_replies(svc, version);
                }
                paxos::Event::Recovered => self.maybe_finish_election(now)?,
                paxos::Event::PeerTooStale {
                    rank,
                    last_committed,
                } => {
                    // It will find the gap on its next probe and sync.
                    warn!(svc, rank, last_committed, "quorum peer too stale to replay");
                }
                paxos::Event::TooStale => {
                    warn!(svc, "local log too stale; restarting discovery");
                    return self.bootstrap();
                }
            }
        }
        Ok(())
    }

    // ---- sync glue (C6) ----

    fn start_sync(&mut self, provider: Rank, now: u64) -> Result<()> {
        if provider == self.rank || self.monmap.addr_of(provider).is_none() {
            return Ok(());
        }
        info!(provider, "state too far behind; synchronizing");
        self.set_state(MonState::Synchronizing, now);
        self.generation += 1;
        let requester = SyncRequester::start(
            provider,
            self.elector.epoch(),
            now,
            &self.store,
            &self.net,
        )?
        .with_timeout(self.cfg.sync_timeout_ms);
        self.sync_requester = Some(requester);
        self.timers.schedule(
            now + self.cfg.sync_heartbeat_ms(),
            0,
            TimedEvent::SyncHeartbeat,
        );
        Ok(())
    }

    fn finish_sync(&mut self) -> Result<()> {
        self.sync_requester = None;
        for paxos in self.paxos.values_mut() {
            paxos.load();
        }
        let gen = self.generation;
        self.refresh_monmap()?;
        if self.generation != gen {
            return Ok(());
        }
        // Rejoin through the normal path with our new state.
        self.bootstrap()
    }

    fn on_sync_heartbeat_timer(&mut self, now: u64) -> Result<()> {
        let expired = self
            .sync_requester
            .as_ref()
            .map(|req| req.expired(now))
            .unwrap_or(false);
        if expired {
            let provider = self.sync_requester.take().map(|r| r.provider);
            warn!(?provider, "sync provider went silent; aborting");
            return self.bootstrap();
        }
        let mut reschedule = false;
        if let Some(req) = self.sync_requester.as_ref() {
            req.send_heartbeat(self.elector.epoch(), &self.net);
            reschedule = true;
        }
        if self.sync_provider.is_active() {
            let still_active = self.sync_provider.tick(now);
            if !still_active {
                self.set_trim(true);
            }
            reschedule = reschedule || still_active;
        }
        if reschedule {
            self.timers.schedule(
                now + self.cfg.sync_heartbeat_ms(),
                0,
                TimedEvent::SyncHeartbeat,
            );
        }
        Ok(())
    }

    fn set_trim(&mut self, enabled: bool) {
        for paxos in self.paxos.values_mut() {
            paxos.set_trim_enabled(enabled);
        }
    }

    // ---- routing and commands (C7) ----

    fn handle_command(
        &mut self,
        reply_to: ReplyTo,
        cmd: &Command,
        caps: MonCaps,
        now: u64,
    ) -> Result<()> {
        let Some(verb) = cmd.argv.first() else {
            self.reply_command(reply_to, cmd.tid, -1, "empty command".into(), Bytes::new(), 0);
            return Ok(());
        };
        let size: usize = cmd.argv.iter().map(String::len).sum();
        if size > MAX_COMMAND_BYTES {
            let err = Error::RequestTooLarge {
                size,
                limit: MAX_COMMAND_BYTES,
            };
            self.reply_command(reply_to, cmd.tid, -err.code(), err.to_string(), Bytes::new(), 0);
            return Ok(());
        }
        match verb.as_str() {
            "mon_status" => {
                if !caps.read {
                    return Ok(self.deny(reply_to, cmd.tid));
                }
                let data = self.mon_status_text();
                self.reply_command(reply_to, cmd.tid, 0, String::new(), Bytes::from(data), 0);
            }
            "quorum_status" => {
                if !caps.read {
                    return Ok(self.deny(reply_to, cmd.tid));
                }
                let data = self.quorum_status_text();
                self.reply_command(reply_to, cmd.tid, 0, String::new(), Bytes::from(data), 0);
            }
            "health" => {
                if !caps.read {
                    return Ok(self.deny(reply_to, cmd.tid));
                }
                let detail = cmd.argv.get(1).map(String::as_str) == Some("detail");
                let data = self.health_text(detail);
                self.reply_command(reply_to, cmd.tid, 0, String::new(), Bytes::from(data), 0);
            }
            "add_bootstrap_peer_hint" => {
                if !caps.exec {
                    return Ok(self.deny(reply_to, cmd.tid));
                }
                match cmd.argv.get(1).and_then(|raw| raw.parse::<SocketAddr>().ok()) {
                    Some(addr) => {
                        info!(%addr, "bootstrap peer hint added");
                        self.extra_probe_peers.push(addr);
                        self.reply_command(
                            reply_to,
                            cmd.tid,
                            0,
                            format!("adding peer {addr} to list"),
                            Bytes::new(),
                            0,
                        );
                    }
                    None => self.reply_command(
                        reply_to,
                        cmd.tid,
                        -Error::ConfigInvalid(String::new()).code(),
                        "usage: add_bootstrap_peer_hint <addr>".into(),
                        Bytes::new(),
                        0,
                    ),
                }
            }
            svc if self.services.contains_key(svc) => {
                self.service_command(reply_to, cmd, caps, now)?;
            }
            other => {
                let err = Error::CommandUnknown(other.to_string());
                self.reply_command(
                    reply_to,
                    cmd.tid,
                    -err.code(),
                    err.to_string(),
                    Bytes::new(),
                    0,
                );
            }
        }
        Ok(())
    }

    fn service_command(
        &mut self,
        reply_to: ReplyTo,
        cmd: &Command,
        caps: MonCaps,
        now: u64,
    ) -> Result<()> {
        let svc = cmd.argv[0].clone();
        if self.state == MonState::Peon {
            // Writes always go through the leader; relaying reads too keeps
            // the answer at least as fresh as the leader's lease view.
            if let ReplyTo::Client(con) = reply_to {
                return Ok(self.forward_to_leader(con, Message::Command(cmd.clone())));
            }
        }
        if self.state != MonState::Leader {
            let err = if self.leader == RANK_NONE {
                Error::QuorumLost
            } else {
                // The redirect carries the leader we know of; the client
                // re-sends there.
                Error::NotLeader {
                    leader: self.leader,
                }
            };
            self.reply_command(reply_to, cmd.tid, -err.code(), err.to_string(), Bytes::new(), 0);
            return Ok(());
        }

        let outcome = self
            .services
            .get_mut(&svc)
            .map(|s| s.handle_command(self.store.as_ref(), &cmd.argv))
            .unwrap_or(CommandOutcome::Unknown);
        match outcome {
            CommandOutcome::Reply { rc, reason, data } => {
                if !caps.read {
                    return Ok(self.deny(reply_to, cmd.tid));
                }
                let version = self.paxos[&svc].last_committed();
                self.reply_command(reply_to, cmd.tid, rc, reason, data, version);
            }
            CommandOutcome::Propose(value) => {
                if !caps.write {
                    return Ok(self.deny(reply_to, cmd.tid));
                }
                let paxos = self.paxos.get_mut(&svc).unwrap();
                let target = paxos.next_version();
                self.pending_replies.push((svc.clone(), target, reply_to, cmd.tid));
                let events = paxos.propose(value, now)?;
                self.apply_paxos_events(&svc, events, now)?;
            }
            CommandOutcome::Unknown => {
                let err = Error::CommandUnknown(cmd.argv.join(" "));
                self.reply_command(reply_to, cmd.tid, -err.code(), err.to_string(), Bytes::new(), 0);
            }
        }
        Ok(())
    }

    fn deny(&mut self, reply_to: ReplyTo, tid: u64) {
        let err = Error::AuthDenied("insufficient caps".into());
        self.reply_command(reply_to, tid, -err.code(), err.to_string(), Bytes::new(), 0);
    }

    fn reply_command(
        &mut self,
        reply_to: ReplyTo,
        tid: u64,
        rc: i32,
        reason: String,
        data: Bytes,
        version: Version,
    ) {
        let reply = Message::CommandReply(CommandReply {
            tid,
            rc,
            reason,
            data,
            version,
        });
        match reply_to {
            ReplyTo::Client(con) => self.net.send_client(con, reply),
            ReplyTo::Routed { peon, tid: route_tid } => {
                self.net.send_mon(
                    peon,
                    self.elector.epoch(),
                    Message::Route(Route {
                        tid: route_tid,
                        reply: messages::encode_inner(&reply),
                    }),
                );
            }
        }
    }

    fn flush_pending_replies(&mut self, svc: &str, version: Version) {
        let ready: Vec<(String, Version, ReplyTo, u64)> = {
            let (ready, waiting) = std::mem::take(&mut self.pending_replies)
                .into_iter()
                .partition(|(s, v, _, _)| s.as_str() == svc && *v <= version);
            self.pending_replies = waiting;
            ready
        };
        for (_, v, reply_to, tid) in ready {
            self.reply_command(reply_to, tid, 0, String::new(), Bytes::new(), v);
        }
    }

    fn forward_to_leader(&mut self, con: ConnId, msg: Message) {
        if self.leader == RANK_NONE {
            debug!("no leader to forward to; dropping client request");
            return;
        }
        let session_name = self
            .sessions
            .get(con)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let caps = self
            .sessions
            .get(con)
            .map(|s| s.caps)
            .unwrap_or(MonCaps::NONE);
        let tid = self.routed.insert(con, msg.clone());
        self.net.send_mon(
            self.leader,
            self.elector.epoch(),
            Message::Forward(Forward {
                tid,
                client_name: session_name,
                caps: caps.encode(),
                req: messages::encode_inner(&msg),
            }),
        );
    }

    fn resend_routed_requests(&mut self) {
        if self.leader == RANK_NONE || self.leader == self.rank {
            return;
        }
        for (tid, entry) in self.routed.pending() {
            debug!(tid, "resending routed request to new leader");
            let caps = self
                .sessions
                .get(entry.con)
                .map(|s| s.caps)
                .unwrap_or(MonCaps::NONE);
            let name = self
                .sessions
                .get(entry.con)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            self.net.send_mon(
                self.leader,
                self.elector.epoch(),
                Message::Forward(Forward {
                    tid,
                    client_name: name,
                    caps: caps.encode(),
                    req: messages::encode_inner(&entry.msg),
                }),
            );
        }
    }

    fn handle_forward(&mut self, from: Rank, fwd: &Forward, now: u64) -> Result<()> {
        if self.state != MonState::Leader {
            debug!(from, tid = fwd.tid, "forward while not leader; dropping");
            return Ok(());
        }
        let caps = MonCaps::parse(&fwd.caps);
        let reply_to = ReplyTo::Routed {
            peon: from,
            tid: fwd.tid,
        };
        match messages::decode_inner(fwd.req.clone()) {
            Ok(Message::Command(cmd)) => self.handle_command(reply_to, &cmd, caps, now)?,
            Ok(Message::GetVersion(get)) => self.handle_get_version(reply_to, &get, now),
            Ok(other) => debug!(tag = other.type_tag(), "unforwardable message type"),
            Err(_) => warn!(from, tid = fwd.tid, "undecodable forwarded request"),
        }
        Ok(())
    }

    fn handle_route(&mut self, route: &Route) {
        let Some(entry) = self.routed.take(route.tid) else {
            debug!(tid = route.tid, "route for unknown tid (session gone?)");
            return;
        };
        match messages::decode_inner(route.reply.clone()) {
            Ok(reply) => self.net.send_client(entry.con, reply),
            Err(_) => warn!(tid = route.tid, "undecodable routed reply"),
        }
    }

    fn handle_subscribe(&mut self, con: ConnId, sub: &Subscribe, now: u64) {
        let session = self.sessions.ensure(con);
        session.subs.insert(
            sub.topic.clone(),
            Subscription {
                start_version: sub.start_version,
                onetime: sub.onetime,
            },
        );
        debug!(con, topic = %sub.topic, start = sub.start_version, "subscribed");
        self.check_subs(&sub.topic, now);
    }

    /// Pushes committed entries to every session subscribed to `topic`.
    fn check_subs(&mut self, topic: &str, now: u64) {
        let (last, available) = match self.paxos.get(topic) {
            Some(p) if p.is_readable(now) || self.state == MonState::Leader => {
                (p.last_committed(), p.committed_entries(0))
            }
            _ => return,
        };
        if last == 0 {
            return;
        }
        let mut pushes: Vec<(ConnId, SubscribePush)> = Vec::new();
        for session in self.sessions.iter_mut() {
            let Some(sub) = session.subs.get_mut(topic) else {
                continue;
            };
            if sub.start_version > last {
                continue;
            }
            let entries: Vec<(Version, Bytes)> = available
                .iter()
                .filter(|(v, _)| *v >= sub.start_version)
                .cloned()
                .collect();
            if entries.is_empty() {
                continue;
            }
            pushes.push((
                session.con,
                SubscribePush {
                    topic: topic.to_string(),
                    entries,
                    last_committed: last,
                },
            ));
            if sub.onetime {
                session.subs.remove(topic);
            } else {
                sub.start_version = last + 1;
            }
        }
        for (con, push) in pushes {
            self.net.send_client(con, Message::SubscribePush(push));
        }
    }

    fn handle_get_version(&mut self, reply_to: ReplyTo, get: &GetVersion, now: u64) {
        let Some(paxos) = self.paxos.get(&get.service) else {
            if let ReplyTo::Client(con) = reply_to {
                self.net.send_client(
                    con,
                    Message::GetVersionReply(GetVersionReply {
                        tid: get.tid,
                        version: 0,
                        first_version: 0,
                    }),
                );
            }
            return;
        };
        if paxos.is_readable(now) {
            let reply = Message::GetVersionReply(GetVersionReply {
                tid: get.tid,
                version: paxos.last_committed(),
                first_version: paxos.first_committed(),
            });
            match reply_to {
                ReplyTo::Client(con) => self.net.send_client(con, reply),
                ReplyTo::Routed { peon, tid } => self.net.send_mon(
                    peon,
                    self.elector.epoch(),
                    Message::Route(Route {
                        tid,
                        reply: messages::encode_inner(&reply),
                    }),
                ),
            }
            return;
        }
        if self.state == MonState::Peon {
            if let ReplyTo::Client(con) = reply_to {
                self.forward_to_leader(con, Message::GetVersion(get.clone()));
            }
        }
        // Not serving yet; the client retries.
    }

    // ---- monmap maintenance (C2 glue) ----

    fn refresh_monmap(&mut self) -> Result<()> {
        let Some(raw) = self.store.get(PREFIX_MONMAP, KEY_LATEST) else {
            return Ok(());
        };
        let Ok(map) = MonMap::decode(raw) else {
            return Err(Error::StoreCorrupt("undecodable monmap".into()));
        };
        if map.epoch > self.monmap.epoch {
            self.install_monmap(map)?;
        }
        Ok(())
    }

    fn install_monmap(&mut self, map: MonMap) -> Result<()> {
        let new_rank = map.rank_of(&self.name);
        info!(epoch = map.epoch, "installing monmap");
        let mut tx = Transaction::new();
        tx.put(PREFIX_MONMAP, KEY_LATEST, &map.encode());
        tx.put(PREFIX_MONMAP, &map.epoch.to_be_bytes(), &map.encode());
        self.store.apply(tx)?;
        self.monmap = Rc::new(map);
        self.net.monmap_updated(&self.monmap);
        match new_rank {
            Some(rank) if rank == self.rank => Ok(()),
            Some(rank) => {
                info!(old = self.rank, new = rank, "rank changed; restarting discovery");
                self.rank = rank;
                self.bootstrap()
            }
            None => {
                warn!("we are no longer in the monmap; restarting discovery");
                self.bootstrap()
            }
        }
    }

    fn mark_joined(&mut self) -> Result<()> {
        if self.has_ever_joined {
            return Ok(());
        }
        self.has_ever_joined = true;
        let mut tx = Transaction::new();
        tx.put(PREFIX_MON, KEY_JOINED, &[1]);
        self.store.apply(tx)?;
        Ok(())
    }

    fn persist_election_epoch(&mut self) -> Result<()> {
        let epoch = self.elector.epoch();
        if epoch != self.persisted_epoch {
            let mut tx = Transaction::new();
            tx.put_u64(PREFIX_MON, KEY_ELECTION_EPOCH, epoch);
            self.store.apply(tx)?;
            self.persisted_epoch = epoch;
        }
        Ok(())
    }

    // ---- status text ----

    fn local_versions(&self) -> Vec<SvcVersions> {
        self.paxos
            .iter()
            .map(|(svc, p)| SvcVersions {
                svc: svc.clone(),
                first_committed: p.first_committed(),
                last_committed: p.last_committed(),
            })
            .collect()
    }

    fn mon_status_text(&self) -> String {
        let mut s = format!(
            "mon.{} rank {} state {} election_epoch {}\n",
            self.name,
            self.rank,
            self.state.name(),
            self.elector.epoch()
        );
        s.push_str(&format!(
            "monmap e{}: {} mons, fsid {}\n",
            self.monmap.epoch,
            self.monmap.size(),
            self.fsid
        ));
        for peer in self.monmap.peers() {
            s.push_str(&format!("  mon.{} rank {} {}\n", peer.name, peer.rank, peer.addr));
        }
        s.push_str(&format!("quorum {:?}\n", self.quorum));
        s
    }

    fn quorum_status_text(&self) -> String {
        let names: Vec<String> = self
            .quorum
            .iter()
            .filter_map(|r| self.monmap.name_of(*r).map(str::to_string))
            .collect();
        format!(
            "election_epoch {}, quorum {:?} {}, leader {}\n",
            self.elector.epoch(),
            self.quorum,
            names.join(","),
            if self.leader == RANK_NONE {
                "none".to_string()
            } else {
                format!("mon.{}", self.monmap.name_of(self.leader).unwrap_or("?"))
            }
        )
    }

    fn health_text(&self, detail: bool) -> String {
        let outside: Vec<&str> = self
            .monmap
            .peers()
            .iter()
            .filter(|p| !self.quorum.contains(&p.rank))
            .map(|p| p.name.as_str())
            .collect();
        let mut s = if !matches!(self.state, MonState::Leader | MonState::Peon) {
            "HEALTH_ERR no quorum\n".to_string()
        } else if outside.is_empty() {
            "HEALTH_OK\n".to_string()
        } else {
            format!("HEALTH_WARN {} monitors down\n", outside.len())
        };
        if detail {
            for name in &outside {
                s.push_str(&format!("  mon.{name} is outside the quorum\n"));
            }
            for (svc, p) in &self.paxos {
                s.push_str(&format!(
                    "  {svc}: first_committed {} last_committed {}\n",
                    p.first_committed(),
                    p.last_committed()
                ));
            }
        }
        s
    }

    fn set_state(&mut self, state: MonState, now: u64) {
        if self.state != state {
            debug!(from = self.state.name(), to = state.name(), "state change");
            self.state = state;
            self.state_since_ms = now;
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::CaptureMessenger;
    use crate::store::mem::MemStore;
    use std::cell::Cell;
    use std::collections::HashMap as StdHashMap;

    fn test_config(name: &str) -> Config {
        let mut map = StdHashMap::new();
        map.insert("mon_name".to_string(), name.to_string());
        map.insert("mon_data".to_string(), format!("/tmp/{name}"));
        map.insert("mon_addr".to_string(), "127.0.0.1:6789".to_string());
        Config::from_map(&map).unwrap()
    }

    fn seed_map() -> MonMap {
        MonMap::build(
            Uuid::from_u128(0xabc),
            0,
            0,
            vec![
                ("a".to_string(), "127.0.0.1:6789".parse().unwrap()),
                ("b".to_string(), "127.0.0.1:6790".parse().unwrap()),
                ("c".to_string(), "127.0.0.1:6791".parse().unwrap()),
            ],
        )
    }

    #[test]
    fn new_requires_mkfs() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        let (_, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let err = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn mkfs_then_new() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        // Double mkfs refused.
        assert!(mkfs(&store, "a", &seed_map()).is_err());

        let (_, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();
        assert_eq!(mon.rank(), 0);
        assert_eq!(mon.state(), MonState::Probing);
        assert_eq!(mon.monmap().epoch, 1);
    }

    #[test]
    fn mkfs_rejects_unknown_name() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        assert!(mkfs(&store, "zed", &seed_map()).is_err());
    }

    #[test]
    fn wrong_name_rejected() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        let (_, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let err = Monitor::new(test_config("b"), store, net, clock, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn bootstrap_probes_all_peers() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        let (state, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let mut mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();
        mon.bootstrap().unwrap();
        let sent = state.borrow();
        assert_eq!(sent.mons.len(), 2);
        assert!(sent
            .mons
            .iter()
            .all(|(_, _, m)| matches!(m, Message::Probe(_))));
    }

    #[test]
    fn probe_reply_carries_state() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        let (state, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let mut mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();

        mon.dispatch_peer(Envelope {
            from: 1,
            epoch: 0,
            msg: Message::Probe(Probe {
                fsid: Uuid::from_u128(0xabc),
                name: "b".into(),
                monmap_epoch: 1,
                has_ever_joined: false,
                features: 0,
                versions: vec![],
            }),
        })
        .unwrap();

        let sent = state.borrow();
        let (to, _, reply) = &sent.mons[sent.mons.len() - 1];
        assert_eq!(*to, 1);
        match reply {
            Message::ProbeReply(r) => {
                assert!(!r.fsid_mismatch);
                assert!(!r.in_quorum);
                assert!(r.monmap.is_some());
            }
            other => panic!("expected probe reply, got {other:?}"),
        }
    }

    #[test]
    fn foreign_fsid_flagged() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        let (state, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let mut mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();

        mon.dispatch_peer(Envelope {
            from: 1,
            epoch: 0,
            msg: Message::Probe(Probe {
                fsid: Uuid::from_u128(0xdead),
                name: "b".into(),
                monmap_epoch: 1,
                has_ever_joined: false,
                features: 0,
                versions: vec![],
            }),
        })
        .unwrap();

        let sent = state.borrow();
        match &sent.mons[0].2 {
            Message::ProbeReply(r) => assert!(r.fsid_mismatch),
            other => panic!("expected probe reply, got {other:?}"),
        }
    }

    #[test]
    fn status_commands_answer_locally() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        let (state, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let mut mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();

        mon.dispatch_client(
            9,
            Message::Command(Command {
                tid: 4,
                argv: vec!["mon_status".into()],
            }),
        )
        .unwrap();

        let sent = state.borrow();
        let (con, reply) = &sent.clients[0];
        assert_eq!(*con, 9);
        match reply {
            Message::CommandReply(r) => {
                assert_eq!(r.tid, 4);
                assert_eq!(r.rc, 0);
                let text = String::from_utf8_lossy(&r.data).to_string();
                assert!(text.contains("state probing"));
                assert!(text.contains("rank 0"));
            }
            other => panic!("expected command reply, got {other:?}"),
        }
    }

    #[test]
    fn unknown_command_gets_error_kind() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        let (state, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let mut mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();

        mon.dispatch_client(
            1,
            Message::Command(Command {
                tid: 1,
                argv: vec!["frobnicate".into()],
            }),
        )
        .unwrap();

        let sent = state.borrow();
        match &sent.clients[0].1 {
            Message::CommandReply(r) => {
                assert_eq!(r.rc, -Error::CommandUnknown(String::new()).code());
                assert!(r.reason.contains("frobnicate"));
            }
            other => panic!("expected command reply, got {other:?}"),
        }
    }

    #[test]
    fn bootstrap_peer_hint_registered() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        let (state, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let mut mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();

        mon.dispatch_client(
            1,
            Message::Command(Command {
                tid: 1,
                argv: vec!["add_bootstrap_peer_hint".into(), "10.1.2.3:6789".into()],
            }),
        )
        .unwrap();
        assert_eq!(mon.extra_probe_peers.len(), 1);

        // The hint is probed on the next bootstrap.
        state.borrow_mut().clear();
        mon.bootstrap().unwrap();
        assert_eq!(state.borrow().addrs.len(), 1);
    }

    #[test]
    fn single_peer_map_elects_itself() {
        let map = MonMap::build(
            Uuid::from_u128(0xabc),
            0,
            0,
            vec![("a".to_string(), "127.0.0.1:6789".parse().unwrap())],
        );
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &map).unwrap();
        let (_, net) = CaptureMessenger::new();
        let cell = Rc::new(Cell::new(0));
        let clock = Clock::manual(cell.clone());
        let mut mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();

        mon.bootstrap().unwrap();
        // A majority of one needs no probe window and no messages.
        let _ = cell;
        assert_eq!(mon.state(), MonState::Leader);
        assert_eq!(mon.election_epoch(), 2);
        assert_eq!(mon.quorum(), &[0]);
        // The seed monmap was committed through paxos.
        assert_eq!(mon.paxos("monmap").unwrap().last_committed(), 1);
    }

    #[test]
    fn session_reset_drops_routed_state() {
        let store: Rc<dyn Store> = Rc::new(MemStore::new());
        mkfs(&store, "a", &seed_map()).unwrap();
        let (_, net) = CaptureMessenger::new();
        let clock = Clock::manual(Rc::new(Cell::new(0)));
        let mut mon = Monitor::new(test_config("a"), store, net, clock, Vec::new()).unwrap();

        mon.dispatch_client(
            3,
            Message::Subscribe(Subscribe {
                topic: "config".into(),
                start_version: 1,
                onetime: false,
            }),
        )
        .unwrap();
        assert_eq!(mon.sessions.len(), 1);
        mon.session_reset(3);
        assert!(mon.sessions.is_empty());
    }
}
