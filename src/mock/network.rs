//! In-process network connecting the members of test clusters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::trace;

use crate::error::RpcError;
use crate::group::DataGroupMember;
use crate::message::{
    AppendEntryRequest, AppendEntryResponse, HeartbeatRequest, HeartbeatResponse,
    InstallSnapshotRequest, PullSnapshotRequest, PullSnapshotResponse, ReadFileRequest, Response,
    VoteRequest,
};
use crate::traits::{RaftClient, RpcResult};
use crate::types::{GroupId, Node, NodeId};

/// Latency and loss applied to every call.
#[derive(Debug, Clone)]
pub struct MockNetworkConfig {
    pub base_latency_ms: u64,
    pub jitter_max_ms: u64,
    /// Probability (0.0 - 1.0) that a call fails as lost
    pub drop_rate: f64,
}

impl Default for MockNetworkConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 1,
            jitter_max_ms: 2,
            drop_rate: 0.0,
        }
    }
}

#[derive(Default)]
struct MockNetworkInner {
    members: RwLock<HashMap<(NodeId, GroupId), Arc<DataGroupMember>>>,
    isolated: RwLock<HashSet<NodeId>>,
    // extra latency per target node
    slow: RwLock<HashMap<NodeId, Duration>>,
    config: RwLock<MockNetworkConfig>,
}

/// Hub routing calls to registered members by node id and group.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<MockNetworkInner>,
}

impl MockNetwork {
    pub fn new(config: MockNetworkConfig) -> Self {
        Self {
            inner: Arc::new(MockNetworkInner {
                config: RwLock::new(config),
                ..Default::default()
            }),
        }
    }

    /// The client `node` uses to reach the others.
    pub fn client(&self, node: &Node) -> Arc<MockNodeNetwork> {
        Arc::new(MockNodeNetwork {
            from: node.clone(),
            hub: self.inner.clone(),
        })
    }

    pub async fn register(&self, member: Arc<DataGroupMember>) {
        let key = (
            member.member().this_node().id,
            member.member().group().clone(),
        );
        self.inner.members.write().await.insert(key, member);
    }

    pub async fn unregister(&self, node: NodeId, group: &GroupId) {
        self.inner
            .members
            .write()
            .await
            .remove(&(node, group.clone()));
    }

    /// Cuts `node` off: calls from and to it fail.
    pub async fn isolate(&self, node: NodeId) {
        self.inner.isolated.write().await.insert(node);
    }

    pub async fn heal(&self, node: NodeId) {
        self.inner.isolated.write().await.remove(&node);
    }

    /// Delays every call to `node` by `delay` on top of the configured latency.
    pub async fn set_delay(&self, node: NodeId, delay: Duration) {
        self.inner.slow.write().await.insert(node, delay);
    }

    pub async fn clear_delay(&self, node: NodeId) {
        self.inner.slow.write().await.remove(&node);
    }

    pub async fn update_config(&self, config: MockNetworkConfig) {
        *self.inner.config.write().await = config;
    }
}

/// Client side of one node.
pub struct MockNodeNetwork {
    from: Node,
    hub: Arc<MockNetworkInner>,
}

impl MockNodeNetwork {
    /// Applies isolation, loss and latency, then resolves the target member.
    async fn route(&self, target: &Node, group: &GroupId) -> RpcResult<Arc<DataGroupMember>> {
        {
            let isolated = self.hub.isolated.read().await;
            if isolated.contains(&self.from.id) || isolated.contains(&target.id) {
                return Err(RpcError::Network(format!(
                    "{} cannot reach {}",
                    self.from, target
                )));
            }
        }

        let (delay, dropped) = {
            let config = self.hub.config.read().await;
            let mut rng = rand::rngs::StdRng::from_os_rng();
            let latency = config.base_latency_ms + rng.random_range(0..=config.jitter_max_ms);
            (
                Duration::from_millis(latency),
                rng.random::<f64>() < config.drop_rate,
            )
        };
        if dropped {
            trace!("MockNetwork: dropping a call from {} to {}", self.from, target);
            return Err(RpcError::Network("message lost".to_string()));
        }
        let extra = self
            .hub
            .slow
            .read()
            .await
            .get(&target.id)
            .copied()
            .unwrap_or_default();
        tokio::time::sleep(delay + extra).await;

        self.hub
            .members
            .read()
            .await
            .get(&(target.id, group.clone()))
            .cloned()
            .ok_or_else(|| RpcError::NodeNotFound(target.clone()))
    }
}

#[async_trait]
impl RaftClient for MockNodeNetwork {
    async fn send_heartbeat(
        &self,
        target: &Node,
        request: HeartbeatRequest,
    ) -> RpcResult<HeartbeatResponse> {
        let member = self.route(target, &request.group).await?;
        Ok(member.member().on_heartbeat(request).await)
    }

    async fn request_vote(&self, target: &Node, request: VoteRequest) -> RpcResult<Response> {
        let member = self.route(target, &request.group).await?;
        Ok(member.member().on_vote_request(request).await)
    }

    async fn append_entry(
        &self,
        target: &Node,
        request: AppendEntryRequest,
    ) -> RpcResult<AppendEntryResponse> {
        let member = self.route(target, &request.group).await?;
        member
            .member()
            .on_append_entry(request)
            .await
            .map_err(|e| RpcError::Remote(e.to_string()))
    }

    async fn install_snapshot(
        &self,
        target: &Node,
        request: InstallSnapshotRequest,
    ) -> RpcResult<Response> {
        let member = self.route(target, &request.group).await?;
        member
            .member()
            .on_install_snapshot(request)
            .await
            .map_err(|e| RpcError::Remote(e.to_string()))
    }

    async fn pull_snapshot(
        &self,
        target: &Node,
        request: PullSnapshotRequest,
    ) -> RpcResult<PullSnapshotResponse> {
        let member = self.route(target, &request.group).await?;
        member
            .on_pull_snapshot(request)
            .await
            .map_err(|e| RpcError::Remote(e.to_string()))
    }

    async fn request_commit_index(&self, target: &Node, group: &GroupId) -> RpcResult<u64> {
        let member = self.route(target, group).await?;
        member.member().on_request_commit_index().await
    }

    async fn read_file(&self, target: &Node, request: ReadFileRequest) -> RpcResult<Vec<u8>> {
        let member = self.route(target, &request.group).await?;
        member.on_read_file(request)
    }
}
