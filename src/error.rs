use thiserror::Error;
use tracing::{debug, error, warn};

use crate::types::Node;

/// Top-level error of the replication core.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Failures of a call to a peer. All of them count as "no response" for the protocol.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Target node {0} not found")]
    NodeNotFound(Node),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Leader unknown")]
    LeaderUnknown,

    #[error("Remote failure: {0}")]
    Remote(String),
}

/// Log store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log entry at index {0} not found")]
    LogNotFound(u64),

    #[error("Log entries before index {0} have been compacted")]
    Compacted(u64),

    #[error("Corrupted data at index {0}")]
    DataCorruption(u64),

    #[error("Corrupted meta file: {0}")]
    MetaCorruption(String),

    #[error("Record of {size} bytes does not fit the {capacity} byte write buffer")]
    BufferCapacityExceeded { size: usize, capacity: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Consistency check failed: {0}")]
    Consistency(String),

    #[error("Log store is closed")]
    Closed,
}

/// Log entry decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Unknown log payload type {0}")]
    UnknownPayloadType(u8),

    #[error("Unexpected end of buffer: need {need} bytes, {left} left")]
    Truncated { need: usize, left: usize },

    #[error("Invalid utf-8 string")]
    InvalidString,

    #[error("{0} trailing bytes after entry")]
    TrailingBytes(usize),
}

/// Proposal outcomes visible to callers of the leader.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not leader (current leader: {0:?})")]
    NotLeader(Option<Node>),

    #[error("Group is read-only")]
    ReadOnly,

    #[error("Replication timed out")]
    Timeout,

    #[error("Leadership is stale")]
    LeadershipStale,

    #[error("Apply failed: {0}")]
    Apply(#[from] ApplyError),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Errors reported by the state machine applying committed entries.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The effect already exists; treated as a successful idempotent retry.
    #[error("Already applied: {0}")]
    Duplicate(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("State machine error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot not available")]
    NotAvailable,

    #[error("Snapshot data corrupted")]
    DataCorrupted(anyhow::Error),

    #[error("Snapshot transfer failed: {0}")]
    Transfer(#[from] RpcError),

    #[error("Snapshot install failed: {0}")]
    Install(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Fatal,
    Recoverable,
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for RpcError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RpcError::NodeNotFound(_) => ErrorSeverity::Recoverable,
            RpcError::Network(_) => ErrorSeverity::Recoverable,
            RpcError::Timeout => ErrorSeverity::Ignorable,
            RpcError::LeaderUnknown => ErrorSeverity::Ignorable,
            RpcError::Remote(_) => ErrorSeverity::Recoverable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Io(_) => ErrorSeverity::Fatal,
            StorageError::LogNotFound(_) => ErrorSeverity::Recoverable,
            StorageError::Compacted(_) => ErrorSeverity::Recoverable,
            StorageError::DataCorruption(_) => ErrorSeverity::Fatal,
            StorageError::MetaCorruption(_) => ErrorSeverity::Fatal,
            StorageError::BufferCapacityExceeded { .. } => ErrorSeverity::Fatal,
            StorageError::Codec(_) => ErrorSeverity::Fatal,
            StorageError::Consistency(_) => ErrorSeverity::Fatal,
            StorageError::Closed => ErrorSeverity::Ignorable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for SnapshotError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            SnapshotError::NotAvailable => ErrorSeverity::Recoverable,
            SnapshotError::DataCorrupted(_) => ErrorSeverity::Fatal,
            SnapshotError::Transfer(e) => e.severity(),
            SnapshotError::Install(_) => ErrorSeverity::Fatal,
            SnapshotError::Storage(e) => e.severity(),
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

/// Logs a failed operation at the level its severity calls for and drops the error.
pub fn report<T, E: ErrorHandler>(
    result: Result<T, E>,
    name: &str,
    operation: &str,
    target: Option<&Node>,
) -> Option<T> {
    match result {
        Ok(val) => Some(val),
        Err(e) => {
            let ctx = match target {
                Some(t) => format!("{} from {} to {}", operation, name, t),
                None => format!("{} on {}", operation, name),
            };
            match e.severity() {
                ErrorSeverity::Fatal => error!("[FATAL] {} failed: {}", ctx, e.context()),
                ErrorSeverity::Recoverable => warn!("[RECOVERABLE] {} failed: {}", ctx, e.context()),
                ErrorSeverity::Ignorable => debug!("[IGNORABLE] {} failed: {}", ctx, e.context()),
            }
            None
        }
    }
}
