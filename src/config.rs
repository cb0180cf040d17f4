//! Runtime configuration.
//!
//! The daemon is configured through a flat key → string map (command line
//! `--set` pairs or a simple `key = value` file). `Config::from_map` applies
//! defaults and validates everything up front so the rest of the monitor can
//! assume a well-formed configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SLURP_THRESHOLD: u64 = 32;
pub const DEFAULT_PAXOS_TRIM_MIN: u64 = 500;
pub const DEFAULT_SYNC_CHUNK_MAX_BYTES: usize = 1 << 20;
pub const DEFAULT_SYNC_CHUNK_MAX_KEYS: usize = 256;

/// Probe retries back off exponentially up to this multiple of
/// `probe_timeout`.
pub const PROBE_BACKOFF_CEILING: u32 = 8;

#[derive(Debug, Clone)]
pub struct Config {
    /// This monitor's name; must appear in the monmap.
    pub name: String,
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub probe_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub lease_timeout_ms: u64,
    pub sync_timeout_ms: u64,
    /// Version gap beyond which a lagging peer syncs instead of replaying.
    pub slurp_threshold: u64,
    pub paxos_trim_min: u64,
    pub sync_chunk_max_bytes: usize,
    pub sync_chunk_max_keys: usize,
    pub features: u64,
    pub extra_probe_peers: Vec<SocketAddr>,
}

impl Config {
    pub fn from_map(map: &HashMap<String, String>) -> Result<Config> {
        let name = required(map, "mon_name")?;
        let data_dir = PathBuf::from(required(map, "mon_data")?);
        let bind_addr = parse_addr(&required(map, "mon_addr")?)?;

        let mut extra_probe_peers = Vec::new();
        if let Some(raw) = map.get("mon_probe_peers") {
            for part in raw.split(',').filter(|p| !p.is_empty()) {
                extra_probe_peers.push(parse_addr(part)?);
            }
        }

        let cfg = Config {
            name,
            data_dir,
            bind_addr,
            probe_timeout_ms: parse_ms(map, "probe_timeout", DEFAULT_PROBE_TIMEOUT_MS)?,
            election_timeout_ms: parse_ms(map, "election_timeout", DEFAULT_ELECTION_TIMEOUT_MS)?,
            lease_timeout_ms: parse_ms(map, "lease_timeout", DEFAULT_LEASE_TIMEOUT_MS)?,
            sync_timeout_ms: parse_ms(map, "sync_timeout", DEFAULT_SYNC_TIMEOUT_MS)?,
            slurp_threshold: parse_num(map, "slurp_threshold", DEFAULT_SLURP_THRESHOLD)?,
            paxos_trim_min: parse_num(map, "paxos_trim_min", DEFAULT_PAXOS_TRIM_MIN)?,
            sync_chunk_max_bytes: parse_num(
                map,
                "sync_chunk_max_bytes",
                DEFAULT_SYNC_CHUNK_MAX_BYTES as u64,
            )? as usize,
            sync_chunk_max_keys: parse_num(
                map,
                "sync_chunk_max_keys",
                DEFAULT_SYNC_CHUNK_MAX_KEYS as u64,
            )? as usize,
            features: parse_num(map, "mon_features", 0)?,
            extra_probe_peers,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ConfigInvalid("mon_name is empty".into()));
        }
        for (key, v) in [
            ("probe_timeout", self.probe_timeout_ms),
            ("election_timeout", self.election_timeout_ms),
            ("lease_timeout", self.lease_timeout_ms),
            ("sync_timeout", self.sync_timeout_ms),
        ] {
            if v == 0 {
                return Err(Error::ConfigInvalid(format!("{key} must be non-zero")));
            }
        }
        if self.paxos_trim_min == 0 {
            return Err(Error::ConfigInvalid("paxos_trim_min must be non-zero".into()));
        }
        Ok(())
    }

    /// Lease renewal cadence. One fifth of the election timeout, so a peon
    /// sees several renewals before it could ever conclude the leader died.
    pub fn lease_renew_ms(&self) -> u64 {
        (self.election_timeout_ms / 5).max(1)
    }

    pub fn sync_heartbeat_ms(&self) -> u64 {
        (self.sync_timeout_ms / 4).max(1)
    }
}

fn required(map: &HashMap<String, String>, key: &str) -> Result<String> {
    map.get(key)
        .cloned()
        .ok_or_else(|| Error::ConfigInvalid(format!("missing required key {key}")))
}

fn parse_addr(raw: &str) -> Result<SocketAddr> {
    raw.trim()
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("bad address {raw:?}")))
}

fn parse_num(map: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match map.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("bad value for {key}: {raw:?}"))),
    }
}

fn parse_ms(map: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
    parse_num(map, key, default)
}
