use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{ApplyError, ClientError, RpcError, SnapshotError, StorageError};
use crate::message::{
    AppendEntryRequest, AppendEntryResponse, HeartbeatRequest, HeartbeatResponse,
    InstallSnapshotRequest, LogEntry, PullSnapshotRequest, PullSnapshotResponse, ReadFileRequest,
    Response, VoteRequest,
};
use crate::types::{GroupId, LogPosition, Node, Slot};

pub type RpcResult<T> = Result<T, RpcError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ApplyResult<T> = Result<T, ApplyError>;
pub type SnapshotResult<T> = Result<T, SnapshotError>;
pub type ClientResult<T> = Result<T, ClientError>;

/// Outbound RPC surface to the other members of a group.
///
/// Implementations wrap whatever transport the surrounding application uses. Every call is
/// additionally bounded by the member's connection timeout.
#[async_trait]
pub trait RaftClient: Send + Sync {
    async fn send_heartbeat(
        &self,
        target: &Node,
        request: HeartbeatRequest,
    ) -> RpcResult<HeartbeatResponse>;

    async fn request_vote(&self, target: &Node, request: VoteRequest) -> RpcResult<Response>;

    async fn append_entry(
        &self,
        target: &Node,
        request: AppendEntryRequest,
    ) -> RpcResult<AppendEntryResponse>;

    async fn install_snapshot(
        &self,
        target: &Node,
        request: InstallSnapshotRequest,
    ) -> RpcResult<Response>;

    async fn pull_snapshot(
        &self,
        target: &Node,
        request: PullSnapshotRequest,
    ) -> RpcResult<PullSnapshotResponse>;

    async fn request_commit_index(&self, target: &Node, group: &GroupId) -> RpcResult<u64>;

    async fn read_file(&self, target: &Node, request: ReadFileRequest) -> RpcResult<Vec<u8>>;
}

/// The storage engine seen from the replication core.
///
/// # Methods
/// - `apply`: called once per committed entry, strictly in index order.
/// - `take_snapshot`: serialized state of the requested slots, or of every held slot.
/// - `install_snapshot`: replaces the state of one slot.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, entry: &LogEntry) -> ApplyResult<()>;

    async fn take_snapshot(&self, slots: Option<&[Slot]>) -> SnapshotResult<BTreeMap<Slot, Vec<u8>>>;

    async fn install_snapshot(&self, slot: Slot, data: Vec<u8>) -> SnapshotResult<()>;
}

/// Higher-level log an elector must be caught up on before a data-group vote is granted.
pub trait SecondaryLog: Send + Sync {
    fn last_log_position(&self) -> LogPosition;
}
