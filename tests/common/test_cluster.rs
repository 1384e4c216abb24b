// test_cluster.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::info;
use tsraft::mock::{MemoryApplier, MockNetwork, MockNetworkConfig};
use tsraft::{
    DataGroupMember, LogStore, LogStoreOptions, Node, NodeId, PartitionGroup, RaftMember,
    RaftOptions, Role,
};

#[derive(Clone)]
pub struct TestClusterConfig {
    pub group: String,
    pub node_ids: Vec<NodeId>,
    /// Elections only happen when a test calls `start_election`
    pub manual_election: bool,
    pub max_segment_size: u64,
    pub network: MockNetworkConfig,
}

impl TestClusterConfig {
    pub fn new(node_ids: &[NodeId]) -> Self {
        Self::with_group("data-group-0", node_ids)
    }

    pub fn with_group(group: &str, node_ids: &[NodeId]) -> Self {
        Self {
            group: group.to_string(),
            node_ids: node_ids.to_vec(),
            manual_election: true,
            max_segment_size: 64 * 1024 * 1024,
            network: MockNetworkConfig::default(),
        }
    }
}

pub struct TestNode {
    pub node: Node,
    pub member: Arc<DataGroupMember>,
    pub applier: Arc<MemoryApplier>,
}

impl TestNode {
    pub fn raft(&self) -> &RaftMember {
        self.member.member()
    }
}

pub struct TestCluster {
    pub config: TestClusterConfig,
    pub network: MockNetwork,
    pub nodes: Vec<TestNode>,
    dir: TempDir,
}

pub fn test_node(id: NodeId) -> Node {
    Node::new(id, "127.0.0.1", 9000 + id as u16)
}

pub fn raft_options(config: &TestClusterConfig, root: PathBuf) -> RaftOptions {
    let (min, max) = if config.manual_election {
        (60_000, 60_000)
    } else {
        (300, 600)
    };
    RaftOptions {
        heartbeat_interval_ms: 50,
        election_timeout_min_ms: min,
        election_timeout_max_ms: max,
        connection_timeout_ms: 300,
        sync_leader_max_wait_ms: 3000,
        transfer_root: root,
        ..RaftOptions::with_group(config.group.clone())
    }
}

impl TestCluster {
    pub async fn new(config: TestClusterConfig) -> Self {
        let network = MockNetwork::new(config.network.clone());
        Self::start_on(config, network).await
    }

    /// Starts the group on a network shared with other groups.
    pub async fn start_on(config: TestClusterConfig, network: MockNetwork) -> Self {
        let dir = TempDir::new().unwrap();
        let all_nodes =
            PartitionGroup::new(config.node_ids.iter().map(|id| test_node(*id)).collect());

        let mut nodes = Vec::new();
        for id in &config.node_ids {
            let node = test_node(*id);
            let node_dir = dir.path().join(format!("node-{}", id));
            let log = LogStore::open(LogStoreOptions {
                max_segment_size: config.max_segment_size,
                flush_interval_ms: 50,
                ..LogStoreOptions::with_dir(node_dir.join("raft"))
            })
            .unwrap();
            let applier = Arc::new(MemoryApplier::new());
            let member = RaftMember::new(
                raft_options(&config, node_dir.join("data")),
                node.clone(),
                all_nodes.clone(),
                log,
                network.client(&node),
                applier.clone(),
                None,
            );
            let member = Arc::new(DataGroupMember::new(member));
            network.register(member.clone()).await;
            nodes.push(TestNode {
                node,
                member,
                applier,
            });
        }
        for node in &nodes {
            node.raft().start().await.unwrap();
        }
        info!("Started group {} on {} nodes", config.group, nodes.len());

        Self {
            config,
            network,
            nodes,
            dir,
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes.iter().find(|n| n.node.id == id).unwrap()
    }

    /// Runs one election on `id` and waits until the leader's first entry is committed.
    pub async fn elect(&self, id: NodeId) -> &TestNode {
        let leader = self.node(id);
        assert!(leader.raft().start_election().await, "node {} lost the election", id);
        let raft = leader.raft().clone();
        let term = raft.term();
        wait_until(Duration::from_secs(3), || {
            let last = raft.last_log_position();
            last.term == term && raft.commit_index() >= last.index
        })
        .await;
        leader
    }

    /// Waits until exactly one node leads and the others follow it in the same term.
    pub async fn wait_for_leader(&self, timeout: Duration) -> &TestNode {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let leaders: Vec<&TestNode> =
                self.nodes.iter().filter(|n| n.raft().is_leader()).collect();
            if let [leader] = leaders.as_slice() {
                let term = leader.raft().term();
                let settled = self.nodes.iter().all(|n| {
                    n.raft().term() == term
                        && n.raft().leader().map(|l| l.id) == Some(leader.node.id)
                });
                if settled {
                    return *leader;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no stable leader within {:?}",
                timeout
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn followers(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.iter().filter(|n| n.raft().role() == Role::Follower)
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.raft().stop().await.unwrap();
        }
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A physical plan routed to `slot` by the in-memory applier.
pub fn plan(slot: u8, value: u8) -> tsraft::LogPayload {
    tsraft::LogPayload::PhysicalPlan(vec![slot, value])
}
