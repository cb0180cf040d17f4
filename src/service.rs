//! Services layered on the replicated log.
//!
//! A service owns a contiguous key range in the store and reacts to commit
//! callbacks; the monitor wires one paxos instance per registered service.
//! The domain services of the full system (osdmap, pgmap, mds, auth, log)
//! plug in through the same trait; this crate ships the monmap service,
//! which every cluster needs, and a small replicated config store.

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use crate::encoding;
use crate::monmap::MonMap;
use crate::store::{Store, Transaction, KEY_LATEST, PREFIX_MONMAP};
use crate::Version;

/// What a service-addressed command wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Reply {
        rc: i32,
        reason: String,
        data: Bytes,
    },
    /// Replicate this payload; the reply is sent once it commits.
    Propose(Bytes),
    Unknown,
}

pub trait Service {
    fn name(&self) -> &str;

    /// Commit callback. Fired in strict version order, inside the same
    /// event-loop turn that persisted the entry.
    fn on_commit(&mut self, store: &dyn Store, version: Version, value: &[u8]);

    /// Called when the cluster becomes active after an election.
    fn on_active(&mut self, _leading: bool) {}

    /// A fresh leader proposes this when the service has no committed state
    /// yet (its `last_committed` is zero).
    fn bootstrap_value(&self, _store: &dyn Store) -> Option<Bytes> {
        None
    }

    /// Service-addressed admin command (`<service> <verb> ...`).
    fn handle_command(&mut self, _store: &dyn Store, _argv: &[String]) -> CommandOutcome {
        CommandOutcome::Unknown
    }
}

/// Replicates the membership map itself. Version 1 is the seed map written
/// by mkfs; later versions come from membership changes.
pub struct MonmapService;

impl MonmapService {
    pub const NAME: &'static str = "monmap";
}

impl Service for MonmapService {
    fn name(&self) -> &str {
        MonmapService::NAME
    }

    fn on_commit(&mut self, store: &dyn Store, version: Version, value: &[u8]) {
        let Ok(map) = MonMap::decode(Bytes::copy_from_slice(value)) else {
            debug!(version, "ignoring undecodable monmap payload");
            return;
        };
        info!(epoch = map.epoch, version, "monmap committed");
        let mut tx = Transaction::new();
        tx.put(PREFIX_MONMAP, &map.epoch.to_be_bytes(), value);
        tx.put(PREFIX_MONMAP, KEY_LATEST, value);
        // Commit callbacks run under the event loop; a store failure here is
        // as fatal as the commit write itself and surfaces on the next one.
        let _ = store.apply(tx);
    }

    fn bootstrap_value(&self, store: &dyn Store) -> Option<Bytes> {
        store.get(PREFIX_MONMAP, KEY_LATEST)
    }
}

/// A small replicated key/value area for cluster-wide settings; mostly here
/// so the admin surface has something to write through the full paxos path.
pub struct ConfigService;

impl ConfigService {
    pub const NAME: &'static str = "config";

    fn encode_entry(key: &str, value: &str) -> Bytes {
        let mut buf = BytesMut::new();
        encoding::put_string(&mut buf, key);
        encoding::put_string(&mut buf, value);
        buf.freeze()
    }

    fn decode_entry(raw: &[u8]) -> Option<(String, String)> {
        let mut buf = Bytes::copy_from_slice(raw);
        let key = encoding::get_string(&mut buf).ok()?;
        let value = encoding::get_string(&mut buf).ok()?;
        Some((key, value))
    }
}

impl Service for ConfigService {
    fn name(&self) -> &str {
        ConfigService::NAME
    }

    fn on_commit(&mut self, store: &dyn Store, version: Version, value: &[u8]) {
        let Some((key, value)) = ConfigService::decode_entry(value) else {
            debug!(version, "ignoring undecodable config payload");
            return;
        };
        let mut tx = Transaction::new();
        tx.put(ConfigService::NAME, key.as_bytes(), value.as_bytes());
        let _ = store.apply(tx);
    }

    fn handle_command(&mut self, store: &dyn Store, argv: &[String]) -> CommandOutcome {
        match argv.get(1).map(String::as_str) {
            Some("set") if argv.len() == 4 => {
                CommandOutcome::Propose(ConfigService::encode_entry(&argv[2], &argv[3]))
            }
            Some("get") if argv.len() == 3 => {
                match store.get(ConfigService::NAME, argv[2].as_bytes()) {
                    Some(value) => CommandOutcome::Reply {
                        rc: 0,
                        reason: String::new(),
                        data: value,
                    },
                    None => CommandOutcome::Reply {
                        rc: -1,
                        reason: format!("no such key {:?}", argv[2]),
                        data: Bytes::new(),
                    },
                }
            }
            _ => CommandOutcome::Unknown,
        }
    }
}
