//! Replication core of a slot-partitioned time-series database.
//!
//! Every data group is a small Raft-style replica set: a [`member::RaftMember`] elects a
//! leader, replicates log entries to a quorum and hands committed entries to an
//! [`traits::Applier`]. [`group::DataGroupMember`] adds slot rebalancing on membership
//! changes, and [`storage::LogStore`] keeps the log in length-framed segment files next to a
//! CRC-checked meta file.

pub mod error;
pub mod group;
pub mod member;
pub mod message;
pub mod mock;
pub mod storage;
pub mod traits;
pub mod transfer;
pub mod types;

pub use error::{ApplyError, ClientError, RaftError, RpcError, SnapshotError, StorageError};
pub use group::{DataGroupMember, SlotHolder};
pub use member::{AppendLogResult, RaftMember, RaftOptions};
pub use message::{HardState, LogEntry, LogPayload, Response, Snapshot};
pub use storage::{LogStore, LogStoreOptions};
pub use traits::{
    Applier, ApplyResult, ClientResult, RaftClient, RpcResult, SecondaryLog, SnapshotResult,
    StorageResult,
};
pub use types::{GroupId, LogPosition, Node, NodeId, PartitionGroup, Role, Slot};
