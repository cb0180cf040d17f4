//! Cluster membership map.
//!
//! A `MonMap` is an immutable snapshot identified by an epoch: the cluster
//! fsid, the ordered peer list and a feature bitset. The running copy is only
//! ever replaced wholesale, by a commit of the monmap service, so readers can
//! hold a cheap snapshot reference.

use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::encoding::{self, DecodeError};

/// Stable index of a monitor within the monmap.
pub type Rank = u16;

/// Sender rank used by clients, which have no seat in the monmap.
pub const RANK_NONE: Rank = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub rank: Rank,
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonMap {
    pub fsid: Uuid,
    pub epoch: u64,
    pub created_ms: u64,
    pub features: u64,
    peers: Vec<PeerInfo>,
}

const MONMAP_VERSION: u8 = 1;
const MONMAP_COMPAT: u8 = 1;

impl MonMap {
    /// Builds an initial map from `(name, addr)` pairs. Ranks are assigned by
    /// lexicographic peer name so every seed file yields the same map.
    pub fn build(
        fsid: Uuid,
        created_ms: u64,
        features: u64,
        mut members: Vec<(String, SocketAddr)>,
    ) -> MonMap {
        members.sort_by(|a, b| a.0.cmp(&b.0));
        let peers = members
            .into_iter()
            .enumerate()
            .map(|(i, (name, addr))| PeerInfo {
                rank: i as Rank,
                name,
                addr,
            })
            .collect();
        MonMap {
            fsid,
            epoch: 1,
            created_ms,
            features,
            peers,
        }
    }

    pub fn size(&self) -> usize {
        self.peers.len()
    }

    /// Smallest quorum: strictly more than half the map.
    pub fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    pub fn rank_of(&self, name: &str) -> Option<Rank> {
        self.peers.iter().find(|p| p.name == name).map(|p| p.rank)
    }

    pub fn addr_of(&self, rank: Rank) -> Option<SocketAddr> {
        self.peers.iter().find(|p| p.rank == rank).map(|p| p.addr)
    }

    pub fn name_of(&self, rank: Rank) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.rank == rank)
            .map(|p| p.name.as_str())
    }

    pub fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.peers.iter().any(|p| p.addr == *addr)
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    pub fn ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        self.peers.iter().map(|p| p.rank)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        encoding::put_header(&mut buf, MONMAP_COMPAT, MONMAP_VERSION);
        encoding::put_uuid(&mut buf, self.fsid);
        buf.put_u64_le(self.epoch);
        buf.put_u64_le(self.created_ms);
        buf.put_u64_le(self.features);
        encoding::put_varint(&mut buf, self.peers.len() as u64);
        for p in &self.peers {
            buf.put_u16_le(p.rank);
            encoding::put_string(&mut buf, &p.name);
            encoding::put_string(&mut buf, &p.addr.to_string());
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<MonMap, DecodeError> {
        encoding::get_header(&mut buf, MONMAP_VERSION)?;
        let fsid = encoding::get_uuid(&mut buf)?;
        let epoch = encoding::get_u64(&mut buf)?;
        let created_ms = encoding::get_u64(&mut buf)?;
        let features = encoding::get_u64(&mut buf)?;
        let n = encoding::get_varint(&mut buf)? as usize;
        let mut peers = Vec::with_capacity(n);
        for _ in 0..n {
            let rank = encoding::get_u16(&mut buf)?;
            let name = encoding::get_string(&mut buf)?;
            let addr = encoding::get_string(&mut buf)?
                .parse()
                .map_err(|_| DecodeError)?;
            peers.push(PeerInfo { rank, name, addr });
        }
        Ok(MonMap {
            fsid,
            epoch,
            created_ms,
            features,
            peers,
        })
    }
}

/// Shared, copy-on-update handle. Holders keep reading their snapshot until
/// the monitor swaps in a committed replacement.
pub type MonMapRef = Rc<MonMap>;
