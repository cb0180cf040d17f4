use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the monitor can surface, internally or to a client.
///
/// Each kind carries a stable numeric code; `CommandReply` reports the code
/// alongside the textual reason so scripted callers can branch without
/// parsing strings.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("store i/o error: {0}")]
    StoreIO(#[from] std::io::Error),

    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("peer unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("message epoch {got} does not match local epoch {local}")]
    PeerEpochMismatch { got: u64, local: u64 },

    #[error("cluster fsid mismatch: peer has {peer}, local is {local}")]
    FsidMismatch { peer: uuid::Uuid, local: uuid::Uuid },

    #[error("peer features {peer:#x} incompatible with required {required:#x}")]
    FeatureIncompatible { peer: u64, required: u64 },

    #[error("quorum lost")]
    QuorumLost,

    #[error("not the leader; current leader is rank {leader}")]
    NotLeader { leader: crate::monmap::Rank },

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("access denied: {0}")]
    AuthDenied(String),

    #[error("request of {size} bytes exceeds limit of {limit}")]
    RequestTooLarge { size: usize, limit: usize },

    #[error("unknown command: {0}")]
    CommandUnknown(String),
}

impl Error {
    /// Stable numeric code surfaced in `CommandReply.rc`.
    pub fn code(&self) -> i32 {
        match self {
            Error::ConfigInvalid(_) => 1,
            Error::StoreIO(_) => 2,
            Error::StoreCorrupt(_) => 3,
            Error::NetworkUnreachable(_) => 4,
            Error::PeerEpochMismatch { .. } => 5,
            Error::FsidMismatch { .. } => 6,
            Error::FeatureIncompatible { .. } => 7,
            Error::QuorumLost => 8,
            Error::NotLeader { .. } => 9,
            Error::Busy(_) => 10,
            Error::AuthDenied(_) => 11,
            Error::RequestTooLarge { .. } => 12,
            Error::CommandUnknown(_) => 13,
        }
    }

    /// Write failures to the store are fatal; the supervisor restarts the
    /// monitor, which re-enters probing with whatever state persisted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StoreIO(_) | Error::StoreCorrupt(_))
    }
}
