use thiserror::Error;

use super::registry::TxnId;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted packet: {0}")]
    Corrupted(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("invalid network address: {0}")]
    InvalidAddress(String),

    #[error("output buffer too small")]
    BufferTooSmall,

    #[error("transaction registry full")]
    RegistryFull,

    #[error("another transaction already targets this address")]
    TargetBusy,

    #[error("unknown transaction {0:?}")]
    UnknownTransaction(TxnId),

    #[error("private swarm check failed")]
    PrivateSwarmRejected,

    #[error("address family not enabled")]
    FamilyDisabled,
}
