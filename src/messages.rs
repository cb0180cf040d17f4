//! Wire messages exchanged between monitors and with clients.
//!
//! A frame on the wire is length-prefixed and carries a small header (compat
//! and encoding version, type tag, sender rank, sender's election epoch, and
//! a payload checksum) followed by the per-type payload. Decoders accept any
//! encoding version in `[compat, current]` and ignore trailing payload bytes
//! they do not understand.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::encoding::{self, DecodeError};
use crate::monmap::{Rank, RANK_NONE};
use crate::paxos::ProposalId;
use crate::Version;

const WIRE_COMPAT: u8 = 1;
const WIRE_VERSION: u8 = 1;

/// Frame header length past the u32 length prefix.
const HEADER_LEN: usize = 1 + 1 + 1 + 2 + 8 + 4;

/// Upper bound on one frame; anything larger is a protocol error, not a
/// request to buffer.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// Per-service commit pointers carried by probes and their replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvcVersions {
    pub svc: String,
    pub first_committed: Version,
    pub last_committed: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub fsid: uuid::Uuid,
    pub name: String,
    pub monmap_epoch: u64,
    pub has_ever_joined: bool,
    pub features: u64,
    pub versions: Vec<SvcVersions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReply {
    pub fsid: uuid::Uuid,
    pub name: String,
    /// Set when the probe's fsid did not match ours; everything else in the
    /// reply is then only good for logging.
    pub fsid_mismatch: bool,
    pub monmap_epoch: u64,
    pub has_ever_joined: bool,
    pub features: u64,
    pub in_quorum: bool,
    pub leader: Rank,
    pub quorum: Vec<Rank>,
    pub versions: Vec<SvcVersions>,
    /// Our monmap, so a cold or stale peer can adopt it before electing.
    pub monmap: Option<Bytes>,
}

/// Election ballot. The ballot epoch travels in the frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Propose {
    pub features: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victory {
    pub leader: Rank,
    pub quorum: Vec<Rank>,
    pub features: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosCollect {
    pub svc: String,
    pub pn: ProposalId,
    pub last_committed: Version,
    pub first_committed: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosLast {
    pub svc: String,
    /// The collect proposal this answers; bumped past ours if we had
    /// promised something higher.
    pub pn: ProposalId,
    pub last_committed: Version,
    pub first_committed: Version,
    pub uncommitted_pn: Option<ProposalId>,
    pub uncommitted_v: Version,
    pub uncommitted_value: Option<Bytes>,
    /// Entries the collector is missing, keyed by version.
    pub commits: Vec<(Version, Bytes)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosBegin {
    pub svc: String,
    pub pn: ProposalId,
    pub v: Version,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosAccept {
    pub svc: String,
    pub pn: ProposalId,
    pub v: Version,
    pub last_committed: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosCommit {
    pub svc: String,
    pub pn: ProposalId,
    pub last_committed: Version,
    /// Committed payloads at and below `last_committed` the recipient may be
    /// missing, in version order.
    pub values: Vec<(Version, Bytes)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosLease {
    pub svc: String,
    pub last_committed: Version,
    pub lease_expire_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosLeaseAck {
    pub svc: String,
    pub last_committed: Version,
}

pub type SyncCursor = (String, Bytes);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStart {
    pub cursor: Option<SyncCursor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStartReply {
    pub rc: i32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncChunk {
    pub pairs: Vec<(String, Bytes, Bytes)>,
    pub next_cursor: Option<SyncCursor>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHeartbeat {
    /// Set on the echo so one side's heartbeat doesn't ping-pong forever.
    pub reply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub tid: u64,
    pub client_name: String,
    pub caps: String,
    /// The client's message, encoded as a frame payload.
    pub req: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub tid: u64,
    /// The reply message, encoded as a frame payload.
    pub reply: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub topic: String,
    pub start_version: Version,
    pub onetime: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePush {
    pub topic: String,
    pub entries: Vec<(Version, Bytes)>,
    pub last_committed: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVersion {
    pub tid: u64,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVersionReply {
    pub tid: u64,
    pub version: Version,
    pub first_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub tid: u64,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub tid: u64,
    pub rc: i32,
    pub reason: String,
    pub data: Bytes,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Probe(Probe),
    ProbeReply(ProbeReply),
    Propose(Propose),
    Victory(Victory),
    PaxosCollect(PaxosCollect),
    PaxosLast(PaxosLast),
    PaxosBegin(PaxosBegin),
    PaxosAccept(PaxosAccept),
    PaxosCommit(PaxosCommit),
    PaxosLease(PaxosLease),
    PaxosLeaseAck(PaxosLeaseAck),
    SyncStart(SyncStart),
    SyncStartReply(SyncStartReply),
    SyncChunk(SyncChunk),
    SyncChunkReply,
    SyncHeartbeat(SyncHeartbeat),
    SyncFinish,
    Forward(Forward),
    Route(Route),
    Subscribe(Subscribe),
    SubscribePush(SubscribePush),
    GetVersion(GetVersion),
    GetVersionReply(GetVersionReply),
    Command(Command),
    CommandReply(CommandReply),
}

/// A message plus the frame header fields that matter to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: Rank,
    pub epoch: u64,
    pub msg: Message,
}

impl Envelope {
    pub fn from_client(msg: Message) -> Envelope {
        Envelope {
            from: RANK_NONE,
            epoch: 0,
            msg,
        }
    }
}

impl Message {
    pub fn type_tag(&self) -> u8 {
        match self {
            Message::Probe(_) => 1,
            Message::ProbeReply(_) => 2,
            Message::Propose(_) => 3,
            Message::Victory(_) => 4,
            Message::PaxosCollect(_) => 5,
            Message::PaxosLast(_) => 6,
            Message::PaxosBegin(_) => 7,
            Message::PaxosAccept(_) => 8,
            Message::PaxosCommit(_) => 9,
            Message::PaxosLease(_) => 10,
            Message::PaxosLeaseAck(_) => 11,
            Message::SyncStart(_) => 12,
            Message::SyncStartReply(_) => 13,
            Message::SyncChunk(_) => 14,
            Message::SyncChunkReply => 15,
            Message::SyncHeartbeat(_) => 16,
            Message::SyncFinish => 17,
            Message::Forward(_) => 18,
            Message::Route(_) => 19,
            Message::Subscribe(_) => 20,
            Message::SubscribePush(_) => 21,
            Message::GetVersion(_) => 22,
            Message::GetVersionReply(_) => 23,
            Message::Command(_) => 24,
            Message::CommandReply(_) => 25,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Probe(m) => {
                encoding::put_uuid(&mut buf, m.fsid);
                encoding::put_string(&mut buf, &m.name);
                buf.put_u64_le(m.monmap_epoch);
                buf.put_u8(m.has_ever_joined as u8);
                buf.put_u64_le(m.features);
                put_versions(&mut buf, &m.versions);
            }
            Message::ProbeReply(m) => {
                encoding::put_uuid(&mut buf, m.fsid);
                encoding::put_string(&mut buf, &m.name);
                buf.put_u8(m.fsid_mismatch as u8);
                buf.put_u64_le(m.monmap_epoch);
                buf.put_u8(m.has_ever_joined as u8);
                buf.put_u64_le(m.features);
                buf.put_u8(m.in_quorum as u8);
                buf.put_u16_le(m.leader);
                put_ranks(&mut buf, &m.quorum);
                put_versions(&mut buf, &m.versions);
                put_opt_bytes(&mut buf, m.monmap.as_deref());
            }
            Message::Propose(m) => {
                buf.put_u64_le(m.features);
            }
            Message::Victory(m) => {
                buf.put_u16_le(m.leader);
                put_ranks(&mut buf, &m.quorum);
                buf.put_u64_le(m.features);
            }
            Message::PaxosCollect(m) => {
                encoding::put_string(&mut buf, &m.svc);
                put_pn(&mut buf, m.pn);
                buf.put_u64_le(m.last_committed);
                buf.put_u64_le(m.first_committed);
            }
            Message::PaxosLast(m) => {
                encoding::put_string(&mut buf, &m.svc);
                put_pn(&mut buf, m.pn);
                buf.put_u64_le(m.last_committed);
                buf.put_u64_le(m.first_committed);
                put_opt_pn(&mut buf, m.uncommitted_pn);
                buf.put_u64_le(m.uncommitted_v);
                put_opt_bytes(&mut buf, m.uncommitted_value.as_deref());
                put_entries(&mut buf, &m.commits);
            }
            Message::PaxosBegin(m) => {
                encoding::put_string(&mut buf, &m.svc);
                put_pn(&mut buf, m.pn);
                buf.put_u64_le(m.v);
                encoding::put_bytes(&mut buf, &m.value);
            }
            Message::PaxosAccept(m) => {
                encoding::put_string(&mut buf, &m.svc);
                put_pn(&mut buf, m.pn);
                buf.put_u64_le(m.v);
                buf.put_u64_le(m.last_committed);
            }
            Message::PaxosCommit(m) => {
                encoding::put_string(&mut buf, &m.svc);
                put_pn(&mut buf, m.pn);
                buf.put_u64_le(m.last_committed);
                put_entries(&mut buf, &m.values);
            }
            Message::PaxosLease(m) => {
                encoding::put_string(&mut buf, &m.svc);
                buf.put_u64_le(m.last_committed);
                buf.put_u64_le(m.lease_expire_ms);
            }
            Message::PaxosLeaseAck(m) => {
                encoding::put_string(&mut buf, &m.svc);
                buf.put_u64_le(m.last_committed);
            }
            Message::SyncStart(m) => {
                put_cursor(&mut buf, m.cursor.as_ref());
            }
            Message::SyncStartReply(m) => {
                buf.put_u32_le(m.rc as u32);
                encoding::put_string(&mut buf, &m.reason);
            }
            Message::SyncChunk(m) => {
                encoding::put_varint(&mut buf, m.pairs.len() as u64);
                for (prefix, key, value) in &m.pairs {
                    encoding::put_string(&mut buf, prefix);
                    encoding::put_bytes(&mut buf, key);
                    encoding::put_bytes(&mut buf, value);
                }
                put_cursor(&mut buf, m.next_cursor.as_ref());
                buf.put_u8(m.done as u8);
            }
            Message::SyncChunkReply => {}
            Message::SyncHeartbeat(m) => {
                buf.put_u8(m.reply as u8);
            }
            Message::SyncFinish => {}
            Message::Forward(m) => {
                buf.put_u64_le(m.tid);
                encoding::put_string(&mut buf, &m.client_name);
                encoding::put_string(&mut buf, &m.caps);
                encoding::put_bytes(&mut buf, &m.req);
            }
            Message::Route(m) => {
                buf.put_u64_le(m.tid);
                encoding::put_bytes(&mut buf, &m.reply);
            }
            Message::Subscribe(m) => {
                encoding::put_string(&mut buf, &m.topic);
                buf.put_u64_le(m.start_version);
                buf.put_u8(m.onetime as u8);
            }
            Message::SubscribePush(m) => {
                encoding::put_string(&mut buf, &m.topic);
                put_entries(&mut buf, &m.entries);
                buf.put_u64_le(m.last_committed);
            }
            Message::GetVersion(m) => {
                buf.put_u64_le(m.tid);
                encoding::put_string(&mut buf, &m.service);
            }
            Message::GetVersionReply(m) => {
                buf.put_u64_le(m.tid);
                buf.put_u64_le(m.version);
                buf.put_u64_le(m.first_version);
            }
            Message::Command(m) => {
                buf.put_u64_le(m.tid);
                encoding::put_varint(&mut buf, m.argv.len() as u64);
                for arg in &m.argv {
                    encoding::put_string(&mut buf, arg);
                }
            }
            Message::CommandReply(m) => {
                buf.put_u64_le(m.tid);
                buf.put_u32_le(m.rc as u32);
                encoding::put_string(&mut buf, &m.reason);
                encoding::put_bytes(&mut buf, &m.data);
                buf.put_u64_le(m.version);
            }
        }
        buf.freeze()
    }

    pub fn decode_payload(tag: u8, mut buf: Bytes) -> Result<Message, DecodeError> {
        let buf = &mut buf;
        let msg = match tag {
            1 => Message::Probe(Probe {
                fsid: encoding::get_uuid(buf)?,
                name: encoding::get_string(buf)?,
                monmap_epoch: encoding::get_u64(buf)?,
                has_ever_joined: encoding::get_u8(buf)? != 0,
                features: encoding::get_u64(buf)?,
                versions: get_versions(buf)?,
            }),
            2 => Message::ProbeReply(ProbeReply {
                fsid: encoding::get_uuid(buf)?,
                name: encoding::get_string(buf)?,
                fsid_mismatch: encoding::get_u8(buf)? != 0,
                monmap_epoch: encoding::get_u64(buf)?,
                has_ever_joined: encoding::get_u8(buf)? != 0,
                features: encoding::get_u64(buf)?,
                in_quorum: encoding::get_u8(buf)? != 0,
                leader: encoding::get_u16(buf)?,
                quorum: get_ranks(buf)?,
                versions: get_versions(buf)?,
                monmap: get_opt_bytes(buf)?,
            }),
            3 => Message::Propose(Propose {
                features: encoding::get_u64(buf)?,
            }),
            4 => Message::Victory(Victory {
                leader: encoding::get_u16(buf)?,
                quorum: get_ranks(buf)?,
                features: encoding::get_u64(buf)?,
            }),
            5 => Message::PaxosCollect(PaxosCollect {
                svc: encoding::get_string(buf)?,
                pn: get_pn(buf)?,
                last_committed: encoding::get_u64(buf)?,
                first_committed: encoding::get_u64(buf)?,
            }),
            6 => Message::PaxosLast(PaxosLast {
                svc: encoding::get_string(buf)?,
                pn: get_pn(buf)?,
                last_committed: encoding::get_u64(buf)?,
                first_committed: encoding::get_u64(buf)?,
                uncommitted_pn: get_opt_pn(buf)?,
                uncommitted_v: encoding::get_u64(buf)?,
                uncommitted_value: get_opt_bytes(buf)?,
                commits: get_entries(buf)?,
            }),
            7 => Message::PaxosBegin(PaxosBegin {
                svc: encoding::get_string(buf)?,
                pn: get_pn(buf)?,
                v: encoding::get_u64(buf)?,
                value: encoding::get_bytes(buf)?,
            }),
            8 => Message::PaxosAccept(PaxosAccept {
                svc: encoding::get_string(buf)?,
                pn: get_pn(buf)?,
                v: encoding::get_u64(buf)?,
                last_committed: encoding::get_u64(buf)?,
            }),
            9 => Message::PaxosCommit(PaxosCommit {
                svc: encoding::get_string(buf)?,
                pn: get_pn(buf)?,
                last_committed: encoding::get_u64(buf)?,
                values: get_entries(buf)?,
            }),
            10 => Message::PaxosLease(PaxosLease {
                svc: encoding::get_string(buf)?,
                last_committed: encoding::get_u64(buf)?,
                lease_expire_ms: encoding::get_u64(buf)?,
            }),
            11 => Message::PaxosLeaseAck(PaxosLeaseAck {
                svc: encoding::get_string(buf)?,
                last_committed: encoding::get_u64(buf)?,
            }),
            12 => Message::SyncStart(SyncStart {
                cursor: get_cursor(buf)?,
            }),
            13 => Message::SyncStartReply(SyncStartReply {
                rc: encoding::get_u32(buf)? as i32,
                reason: encoding::get_string(buf)?,
            }),
            14 => {
                let n = encoding::get_varint(buf)? as usize;
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let prefix = encoding::get_string(buf)?;
                    let key = encoding::get_bytes(buf)?;
                    let value = encoding::get_bytes(buf)?;
                    pairs.push((prefix, key, value));
                }
                Message::SyncChunk(SyncChunk {
                    pairs,
                    next_cursor: get_cursor(buf)?,
                    done: encoding::get_u8(buf)? != 0,
                })
            }
            15 => Message::SyncChunkReply,
            16 => Message::SyncHeartbeat(SyncHeartbeat {
                reply: encoding::get_u8(buf)? != 0,
            }),
            17 => Message::SyncFinish,
            18 => Message::Forward(Forward {
                tid: encoding::get_u64(buf)?,
                client_name: encoding::get_string(buf)?,
                caps: encoding::get_string(buf)?,
                req: encoding::get_bytes(buf)?,
            }),
            19 => Message::Route(Route {
                tid: encoding::get_u64(buf)?,
                reply: encoding::get_bytes(buf)?,
            }),
            20 => Message::Subscribe(Subscribe {
                topic: encoding::get_string(buf)?,
                start_version: encoding::get_u64(buf)?,
                onetime: encoding::get_u8(buf)? != 0,
            }),
            21 => Message::SubscribePush(SubscribePush {
                topic: encoding::get_string(buf)?,
                entries: get_entries(buf)?,
                last_committed: encoding::get_u64(buf)?,
            }),
            22 => Message::GetVersion(GetVersion {
                tid: encoding::get_u64(buf)?,
                service: encoding::get_string(buf)?,
            }),
            23 => Message::GetVersionReply(GetVersionReply {
                tid: encoding::get_u64(buf)?,
                version: encoding::get_u64(buf)?,
                first_version: encoding::get_u64(buf)?,
            }),
            24 => {
                let tid = encoding::get_u64(buf)?;
                let n = encoding::get_varint(buf)? as usize;
                let mut argv = Vec::with_capacity(n);
                for _ in 0..n {
                    argv.push(encoding::get_string(buf)?);
                }
                Message::Command(Command { tid, argv })
            }
            25 => Message::CommandReply(CommandReply {
                tid: encoding::get_u64(buf)?,
                rc: encoding::get_u32(buf)? as i32,
                reason: encoding::get_string(buf)?,
                data: encoding::get_bytes(buf)?,
                version: encoding::get_u64(buf)?,
            }),
            _ => return Err(DecodeError),
        };
        Ok(msg)
    }
}

/// Encodes a message as `[tag][payload]`, the shape carried inside
/// `Forward.req` and `Route.reply`.
pub fn encode_inner(msg: &Message) -> Bytes {
    let payload = msg.encode_payload();
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(msg.type_tag());
    buf.put_slice(&payload);
    buf.freeze()
}

pub fn decode_inner(mut raw: Bytes) -> Result<Message, DecodeError> {
    let tag = encoding::get_u8(&mut raw)?;
    Message::decode_payload(tag, raw)
}

/// Encodes a full frame: length prefix, header, checksummed payload.
pub fn encode_frame(env: &Envelope) -> Bytes {
    let payload = env.msg.encode_payload();
    let mut buf = BytesMut::with_capacity(4 + HEADER_LEN + payload.len());
    buf.put_u32_le((HEADER_LEN + payload.len()) as u32);
    buf.put_u8(WIRE_COMPAT);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(env.msg.type_tag());
    buf.put_u16_le(env.from);
    buf.put_u64_le(env.epoch);
    buf.put_u32_le(crc32fast::hash(&payload));
    buf.put_slice(&payload);
    buf.freeze()
}

/// Consumes one frame from a streaming buffer, if a complete one is present.
///
/// Returns `Ok(None)` when more bytes are needed. A checksum or header error
/// consumes the frame and reports `DecodeError`; the stream can keep going.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Envelope>, DecodeError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < HEADER_LEN || len > MAX_FRAME_LEN {
        return Err(DecodeError);
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    let mut frame = buf.split_to(len).freeze();

    let compat = encoding::get_u8(&mut frame)?;
    let _version = encoding::get_u8(&mut frame)?;
    if compat > WIRE_VERSION {
        return Err(DecodeError);
    }
    let tag = encoding::get_u8(&mut frame)?;
    let from = encoding::get_u16(&mut frame)?;
    let epoch = encoding::get_u64(&mut frame)?;
    let crc = encoding::get_u32(&mut frame)?;
    if crc32fast::hash(&frame) != crc {
        return Err(DecodeError);
    }
    let msg = Message::decode_payload(tag, frame)?;
    Ok(Some(Envelope { from, epoch, msg }))
}

fn put_pn(buf: &mut BytesMut, pn: ProposalId) {
    buf.put_u64_le(pn.counter);
    buf.put_u16_le(pn.rank);
}

fn get_pn(buf: &mut Bytes) -> Result<ProposalId, DecodeError> {
    Ok(ProposalId {
        counter: encoding::get_u64(buf)?,
        rank: encoding::get_u16(buf)?,
    })
}

fn put_opt_pn(buf: &mut BytesMut, pn: Option<ProposalId>) {
    match pn {
        Some(pn) => {
            buf.put_u8(1);
            put_pn(buf, pn);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_pn(buf: &mut Bytes) -> Result<Option<ProposalId>, DecodeError> {
    if encoding::get_u8(buf)? == 0 {
        Ok(None)
    } else {
        Ok(Some(get_pn(buf)?))
    }
}

fn put_opt_bytes(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.put_u8(1);
            encoding::put_bytes(buf, data);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, DecodeError> {
    if encoding::get_u8(buf)? == 0 {
        Ok(None)
    } else {
        Ok(Some(encoding::get_bytes(buf)?))
    }
}

fn put_ranks(buf: &mut BytesMut, ranks: &[Rank]) {
    encoding::put_varint(buf, ranks.len() as u64);
    for r in ranks {
        buf.put_u16_le(*r);
    }
}

fn get_ranks(buf: &mut Bytes) -> Result<Vec<Rank>, DecodeError> {
    let n = encoding::get_varint(buf)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(encoding::get_u16(buf)?);
    }
    Ok(out)
}

fn put_versions(buf: &mut BytesMut, versions: &[SvcVersions]) {
    encoding::put_varint(buf, versions.len() as u64);
    for v in versions {
        encoding::put_string(buf, &v.svc);
        buf.put_u64_le(v.first_committed);
        buf.put_u64_le(v.last_committed);
    }
}

fn get_versions(buf: &mut Bytes) -> Result<Vec<SvcVersions>, DecodeError> {
    let n = encoding::get_varint(buf)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(SvcVersions {
            svc: encoding::get_string(buf)?,
            first_committed: encoding::get_u64(buf)?,
            last_committed: encoding::get_u64(buf)?,
        });
    }
    Ok(out)
}

fn put_entries(buf: &mut BytesMut, entries: &[(Version, Bytes)]) {
    encoding::put_varint(buf, entries.len() as u64);
    for (v, data) in entries {
        buf.put_u64_le(*v);
        encoding::put_bytes(buf, data);
    }
}

fn get_entries(buf: &mut Bytes) -> Result<Vec<(Version, Bytes)>, DecodeError> {
    let n = encoding::get_varint(buf)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let v = encoding::get_u64(buf)?;
        let data = encoding::get_bytes(buf)?;
        out.push((v, data));
    }
    Ok(out)
}

fn put_cursor(buf: &mut BytesMut, cursor: Option<&SyncCursor>) {
    match cursor {
        Some((prefix, key)) => {
            buf.put_u8(1);
            encoding::put_string(buf, prefix);
            encoding::put_bytes(buf, key);
        }
        None => buf.put_u8(0),
    }
}

fn get_cursor(buf: &mut Bytes) -> Result<Option<SyncCursor>, DecodeError> {
    if encoding::get_u8(buf)? == 0 {
        Ok(None)
    } else {
        let prefix = encoding::get_string(buf)?;
        let key = encoding::get_bytes(buf)?;
        Ok(Some((prefix, key)))
    }
}
