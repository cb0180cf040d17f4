//! In-process cluster harness.
//!
//! Monitors share a manual clock and exchange messages through one mesh
//! queue, so every multi-peer scenario runs deterministically: `pump`
//! delivers queued traffic until quiet, `advance` steps the clock in small
//! slices and ticks every live monitor.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use shoal_mon::clock::Clock;
use shoal_mon::config::Config;
use shoal_mon::messages::{Command, Envelope, Message};
use shoal_mon::monitor::{mkfs, Monitor};
use shoal_mon::monmap::{MonMap, Rank};
use shoal_mon::network::{ConnId, Messenger};
use shoal_mon::store::mem::MemStore;
use shoal_mon::store::Store;

pub struct Mesh {
    queue: RefCell<VecDeque<(Rank, Rank, u64, Message)>>,
    client_out: RefCell<Vec<(Rank, ConnId, Message)>>,
    down: RefCell<HashSet<Rank>>,
}

pub struct MeshMessenger {
    rank: Rank,
    mesh: Rc<Mesh>,
}

impl Messenger for MeshMessenger {
    fn send_mon(&self, to: Rank, epoch: u64, msg: Message) {
        self.mesh
            .queue
            .borrow_mut()
            .push_back((self.rank, to, epoch, msg));
    }

    fn send_client(&self, con: ConnId, msg: Message) {
        self.mesh.client_out.borrow_mut().push((self.rank, con, msg));
    }
}

pub struct Cluster {
    pub mesh: Rc<Mesh>,
    pub mons: Vec<Option<Monitor>>,
    pub stores: Vec<Rc<dyn Store>>,
    pub cell: Rc<Cell<u64>>,
    overrides: Vec<(String, String)>,
    fsid: uuid::Uuid,
    monmap: MonMap,
}

impl Cluster {
    pub fn new(n: usize) -> Cluster {
        Cluster::new_with(n, &[])
    }

    pub fn new_with(n: usize, overrides: &[(&str, &str)]) -> Cluster {
        let fsid = uuid::Uuid::from_u128(0x5105);
        let members: Vec<(String, std::net::SocketAddr)> = (0..n)
            .map(|i| {
                (
                    format!("m{i}"),
                    format!("127.0.0.1:{}", 16789 + i).parse().unwrap(),
                )
            })
            .collect();
        let monmap = MonMap::build(fsid, 1_000, 0, members);

        let mesh = Rc::new(Mesh {
            queue: RefCell::new(VecDeque::new()),
            client_out: RefCell::new(Vec::new()),
            down: RefCell::new(HashSet::new()),
        });
        let cell = Rc::new(Cell::new(10_000));

        let mut cluster = Cluster {
            mesh,
            mons: Vec::new(),
            stores: Vec::new(),
            cell,
            overrides: overrides
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fsid,
            monmap,
        };
        for i in 0..n {
            let store: Rc<dyn Store> = Rc::new(MemStore::new());
            mkfs(&store, &format!("m{i}"), &cluster.monmap).unwrap();
            cluster.stores.push(store);
            let mon = cluster.build_monitor(i);
            cluster.mons.push(Some(mon));
        }
        cluster
    }

    fn config(&self, i: usize) -> Config {
        let mut map = HashMap::new();
        map.insert("mon_name".to_string(), format!("m{i}"));
        map.insert("mon_data".to_string(), format!("/tmp/m{i}"));
        map.insert(
            "mon_addr".to_string(),
            format!("127.0.0.1:{}", 16789 + i),
        );
        for (k, v) in &self.overrides {
            map.insert(k.clone(), v.clone());
        }
        Config::from_map(&map).unwrap()
    }

    fn build_monitor(&self, i: usize) -> Monitor {
        let net: Rc<dyn Messenger> = Rc::new(MeshMessenger {
            rank: i as Rank,
            mesh: self.mesh.clone(),
        });
        Monitor::new(
            self.config(i),
            self.stores[i].clone(),
            net,
            Clock::manual(self.cell.clone()),
            Vec::new(),
        )
        .unwrap()
    }

    pub fn boot_all(&mut self) {
        for i in 0..self.mons.len() {
            if let Some(mon) = self.mons[i].as_mut() {
                mon.bootstrap().unwrap();
            }
        }
        self.pump();
    }

    /// Delivers queued peer traffic until the mesh is quiet.
    pub fn pump(&mut self) {
        let mut guard = 0;
        loop {
            let next = self.mesh.queue.borrow_mut().pop_front();
            let Some((from, to, epoch, msg)) = next else {
                break;
            };
            guard += 1;
            assert!(guard < 100_000, "mesh did not quiesce");
            if self.mesh.down.borrow().contains(&to) {
                continue;
            }
            if let Some(mon) = self.mons.get_mut(to as usize).and_then(|m| m.as_mut()) {
                mon.dispatch_peer(Envelope { from, epoch, msg }).unwrap();
            }
        }
    }

    /// Advances the shared clock in 100 ms slices, ticking every live
    /// monitor. The mesh drains after each individual tick, so a message
    /// sent from one timer callback is seen before the next peer's timer
    /// fires, as it would be with real (never perfectly equal) deadlines.
    pub fn advance(&mut self, total_ms: u64) {
        let mut left = total_ms;
        while left > 0 {
            let step = left.min(100);
            self.cell.set(self.cell.get() + step);
            left -= step;
            for i in 0..self.mons.len() {
                if let Some(mon) = self.mons[i].as_mut() {
                    mon.tick().unwrap();
                }
                self.pump();
            }
        }
    }

    pub fn crash(&mut self, rank: usize) {
        self.mesh.down.borrow_mut().insert(rank as Rank);
        self.mons[rank] = None;
    }

    /// Restarts a crashed monitor on its surviving store.
    pub fn restart(&mut self, rank: usize) {
        self.mesh.down.borrow_mut().remove(&(rank as Rank));
        let mut mon = self.build_monitor(rank);
        mon.bootstrap().unwrap();
        self.mons[rank] = Some(mon);
        self.pump();
    }

    pub fn mon(&self, rank: usize) -> &Monitor {
        self.mons[rank].as_ref().expect("monitor is down")
    }

    pub fn leader_rank(&self) -> Option<usize> {
        self.mons
            .iter()
            .position(|m| m.as_ref().map(|m| m.is_leader()).unwrap_or(false))
    }

    /// Sends a command to one monitor as a client and pumps to completion.
    pub fn client_command(&mut self, rank: usize, con: ConnId, tid: u64, argv: &[&str]) {
        let msg = Message::Command(Command {
            tid,
            argv: argv.iter().map(|s| s.to_string()).collect(),
        });
        self.mons[rank]
            .as_mut()
            .expect("monitor is down")
            .dispatch_client(con, msg)
            .unwrap();
        self.pump();
    }

    pub fn take_client_msgs(&mut self) -> Vec<(Rank, ConnId, Message)> {
        self.mesh.client_out.borrow_mut().drain(..).collect()
    }

    pub fn fsid(&self) -> uuid::Uuid {
        self.fsid
    }

    /// Safety check: every pair of live monitors agrees on every committed
    /// value.
    pub fn assert_committed_agreement(&self, svc: &str) {
        let live: Vec<&Monitor> = self.mons.iter().flatten().collect();
        let Some(first) = live.first() else { return };
        let min_last = live
            .iter()
            .map(|m| m.paxos(svc).unwrap().last_committed())
            .min()
            .unwrap();
        for v in 1..=min_last {
            let reference = first.paxos(svc).unwrap().get_version(v);
            for m in &live[1..] {
                let value = m.paxos(svc).unwrap().get_version(v);
                if reference.is_some() && value.is_some() {
                    assert_eq!(reference, value, "{svc} v{v} diverged");
                }
            }
        }
    }
}
