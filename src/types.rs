use std::fmt::{self, Display};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

pub type GroupId = String;
/// Position of a node on the hash ring.
pub type NodeId = u64;
pub type Slot = u32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Elector,
    Follower,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Elector => write!(f, "Elector"),
            Role::Follower => write!(f, "Follower"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Index/term pair identifying the tail of a log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogPosition {
    pub index: u64,
    pub term: u64,
}

impl LogPosition {
    pub fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}

/// Ordered replica list of a slot range. The first node is the group header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PartitionGroup {
    nodes: Vec<Node>,
}

impl PartitionGroup {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn header(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.iter().any(|n| n.id == node.id)
    }

    pub fn peers<'a>(&'a self, this: &'a Node) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.id != this.id)
    }

    /// Number of peer acknowledgements that, together with the local copy, form a strict majority.
    pub fn quorum_acks(&self) -> usize {
        self.nodes.len() / 2
    }

    /// Splices `node` into ring order and evicts the tail member to keep the group size.
    /// Returns the evicted node, or `None` when the node does not belong in this group.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        if self.contains(&node) || self.nodes.len() < 2 {
            return None;
        }

        let id = node.id;
        let mut insert_at = None;
        for i in 0..self.nodes.len() - 1 {
            let prev = self.nodes[i].id;
            let next = self.nodes[i + 1].id;
            // plain gap, or one of the two wrap-around cases of the ring
            if (prev < id && id < next)
                || (prev < id && next < prev)
                || (id < next && next < prev)
            {
                insert_at = Some(i + 1);
                break;
            }
        }

        let at = insert_at?;
        self.nodes.insert(at, node);
        self.nodes.pop()
    }

    pub fn remove(&mut self, node: &Node) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != node.id);
        before != self.nodes.len()
    }
}
