//! Client sessions, capabilities, subscriptions and routed requests.
//!
//! Every connection maps to one session whose lifetime is bound to the
//! transport connection. Peons wrap client writes into routed requests
//! forwarded to the leader; the reply retraces the same tid. Subscriptions
//! are walked on every commit.

use std::collections::HashMap;

use crate::messages::Message;
use crate::network::ConnId;
use crate::Version;

/// Parsed monitor capability string: `allow r | allow rw | allow x`,
/// combinable (`allow rwx`), with `allow *` granting everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonCaps {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl MonCaps {
    pub const ALL: MonCaps = MonCaps {
        read: true,
        write: true,
        exec: true,
    };

    pub const NONE: MonCaps = MonCaps {
        read: false,
        write: false,
        exec: false,
    };

    pub fn parse(raw: &str) -> MonCaps {
        let mut caps = MonCaps::NONE;
        for clause in raw.split(',') {
            let clause = clause.trim();
            let Some(rest) = clause.strip_prefix("allow") else {
                continue;
            };
            let rest = rest.trim();
            if rest == "*" {
                return MonCaps::ALL;
            }
            for c in rest.chars() {
                match c {
                    'r' => caps.read = true,
                    'w' => caps.write = true,
                    'x' => caps.exec = true,
                    _ => {}
                }
            }
        }
        caps
    }

    pub fn encode(&self) -> String {
        if *self == MonCaps::ALL {
            return "allow *".to_string();
        }
        let mut s = String::from("allow ");
        if self.read {
            s.push('r');
        }
        if self.write {
            s.push('w');
        }
        if self.exec {
            s.push('x');
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub start_version: Version,
    pub onetime: bool,
}

#[derive(Debug)]
pub struct Session {
    pub con: ConnId,
    pub name: String,
    pub caps: MonCaps,
    pub subs: HashMap<String, Subscription>,
}

#[derive(Default)]
pub struct SessionMap {
    sessions: HashMap<ConnId, Session>,
}

impl SessionMap {
    pub fn new() -> SessionMap {
        SessionMap::default()
    }

    /// Looks up or creates the session for a connection. Without an auth
    /// handshake in front of us, sessions start with full caps.
    pub fn ensure(&mut self, con: ConnId) -> &mut Session {
        self.sessions.entry(con).or_insert_with(|| Session {
            con,
            name: format!("client.{con}"),
            caps: MonCaps::ALL,
            subs: HashMap::new(),
        })
    }

    pub fn get(&self, con: ConnId) -> Option<&Session> {
        self.sessions.get(&con)
    }

    pub fn remove(&mut self, con: ConnId) -> Option<Session> {
        self.sessions.remove(&con)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// One write a peon has forwarded to the leader and still owes a reply for.
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub con: ConnId,
    pub msg: Message,
}

/// Routed-request table. tids are dense per monitor; entries die with the
/// reply or with the client session.
#[derive(Default)]
pub struct RoutedRequests {
    next_tid: u64,
    entries: HashMap<u64, RoutedRequest>,
}

impl RoutedRequests {
    pub fn new() -> RoutedRequests {
        RoutedRequests::default()
    }

    pub fn insert(&mut self, con: ConnId, msg: Message) -> u64 {
        self.next_tid += 1;
        let tid = self.next_tid;
        self.entries.insert(tid, RoutedRequest { con, msg });
        tid
    }

    pub fn take(&mut self, tid: u64) -> Option<RoutedRequest> {
        self.entries.remove(&tid)
    }

    pub fn drop_con(&mut self, con: ConnId) {
        self.entries.retain(|_, r| r.con != con);
    }

    /// Pending entries, oldest first, for resending after a leader change.
    pub fn pending(&self) -> Vec<(u64, RoutedRequest)> {
        let mut out: Vec<(u64, RoutedRequest)> = self
            .entries
            .iter()
            .map(|(tid, r)| (*tid, r.clone()))
            .collect();
        out.sort_by_key(|(tid, _)| *tid);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
