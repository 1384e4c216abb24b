//! Data group membership and slot rebalancing on top of the replication member.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ClientError, RpcError, SnapshotError};
use crate::member::RaftMember;
use crate::message::{LogPayload, PullSnapshotRequest, PullSnapshotResponse, ReadFileRequest};
use crate::traits::{ClientResult, RpcResult, SnapshotResult};
use crate::transfer::{self, remote_error};
use crate::types::{GroupId, Node, PartitionGroup, Role, Slot};

/// The group a slot was assigned to before a membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotHolder {
    pub group: GroupId,
    pub nodes: PartitionGroup,
}

/// A member of a data group: replication plus the slots it serves.
pub struct DataGroupMember {
    member: RaftMember,
    pulled_slots: Mutex<BTreeSet<Slot>>,
}

impl DataGroupMember {
    pub fn new(member: RaftMember) -> Self {
        Self {
            member,
            pulled_slots: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn member(&self) -> &RaftMember {
        &self.member
    }

    pub fn pulled_slots(&self) -> BTreeSet<Slot> {
        self.pulled_slots.lock().clone()
    }

    /// Splices a new node into the group's ring order. The group then elects a new leader in a
    /// higher term. Returns true when the local node was pushed out of the group, in which case
    /// it turns read-only.
    pub fn add_node(&self, node: Node) -> bool {
        let inner = &self.member.inner;
        let evicted = inner.all_nodes.write().insert(node.clone());
        let Some(evicted) = evicted else {
            debug!("Node {} ignores the addition of {}", self.member.name(), node);
            return false;
        };

        let term = self.member.update_state(|state| {
            state.term += 1;
            state.role = Role::Elector;
            state.leader = None;
            state.voted_for = None;
            state.last_heartbeat = Instant::now();
            state.term
        });
        info!(
            "Node {} added {} to the group, {} leaves, term is now {}",
            self.member.name(),
            node,
            evicted,
            term
        );

        let removed_self = evicted.id == inner.this_node.id;
        if removed_self {
            self.member.set_read_only();
        }
        removed_self
    }

    /// Drops `removed` from the group and pulls the slots this group inherits from it. If the
    /// removed node led the group an election starts right away.
    pub async fn remove_node(
        &self,
        removed: &Node,
        new_slots: &BTreeMap<Slot, SlotHolder>,
    ) -> SnapshotResult<usize> {
        let inner = &self.member.inner;
        if !inner.all_nodes.write().remove(removed) {
            debug!("Node {} has no member {}", self.member.name(), removed);
        }
        let election_timeout = Duration::from_millis(inner.options.election_timeout_max_ms);
        self.member.update_state(|state| {
            if state.leader.as_ref().is_some_and(|l| l.id == removed.id) {
                state.role = Role::Elector;
                state.leader = None;
                // expire the timer so the next tick starts an election
                state.last_heartbeat = Instant::now()
                    .checked_sub(election_timeout)
                    .unwrap_or_else(Instant::now);
            }
        });
        info!(
            "Node {} removed {} from the group, {} slots to pull",
            self.member.name(),
            removed,
            new_slots.len()
        );
        self.pull_slots(new_slots, true).await
    }

    /// Pulls the data of `slots` from their previous holders after a node joined.
    pub async fn pull_node_addition_snapshots(
        &self,
        slots: &[Slot],
        previous_holders: &BTreeMap<Slot, SlotHolder>,
    ) -> SnapshotResult<usize> {
        let wanted: BTreeMap<Slot, SlotHolder> = slots
            .iter()
            .filter_map(|slot| previous_holders.get(slot).map(|h| (*slot, h.clone())))
            .collect();
        info!(
            "Node {} pulling {} slots from remote",
            self.member.name(),
            wanted.len()
        );
        self.pull_slots(&wanted, false).await
    }

    async fn pull_slots(
        &self,
        holders: &BTreeMap<Slot, SlotHolder>,
        require_read_only: bool,
    ) -> SnapshotResult<usize> {
        let mut by_holder: BTreeMap<GroupId, (SlotHolder, Vec<Slot>)> = BTreeMap::new();
        {
            let pulled = self.pulled_slots.lock();
            for (slot, holder) in holders {
                if pulled.contains(slot) {
                    continue;
                }
                by_holder
                    .entry(holder.group.clone())
                    .or_insert_with(|| (holder.clone(), Vec::new()))
                    .1
                    .push(*slot);
            }
        }

        let mut installed = 0;
        for (holder, slots) in by_holder.into_values() {
            installed += self
                .pull_slot_snapshots(&holder, &slots, require_read_only)
                .await?;
        }
        Ok(installed)
    }

    /// Asks the holder's members in order until one serves the slots, then installs them.
    async fn pull_slot_snapshots(
        &self,
        holder: &SlotHolder,
        slots: &[Slot],
        require_read_only: bool,
    ) -> SnapshotResult<usize> {
        let request = PullSnapshotRequest {
            group: holder.group.clone(),
            required_slots: slots.to_vec(),
            require_read_only,
        };
        let client = self.member.inner.client.clone();
        let mut last_error = SnapshotError::NotAvailable;
        for node in holder.nodes.nodes() {
            if node.id == self.member.this_node().id {
                continue;
            }
            let result = self
                .member
                .call(client.pull_snapshot(node, request.clone()))
                .await;
            match result {
                Ok(response) => return self.install_pulled(response).await,
                Err(e) => {
                    warn!(
                        "Node {} cannot pull {} slots from {}: {}",
                        self.member.name(),
                        slots.len(),
                        node,
                        e
                    );
                    last_error = e.into();
                }
            }
        }
        Err(last_error)
    }

    async fn install_pulled(&self, response: PullSnapshotResponse) -> SnapshotResult<usize> {
        let applier = &self.member.inner.applier;
        let mut installed = 0;
        for (slot, data) in response.snapshots {
            applier.install_snapshot(slot, data).await?;
            self.pulled_slots.lock().insert(slot);
            installed += 1;
        }
        debug!(
            "Node {} installed {} pulled slots up to index {}",
            self.member.name(),
            installed,
            response.last_log_index
        );
        Ok(installed)
    }

    /// Serves a slot pull on the leader; followers forward it to their leader.
    pub async fn on_pull_snapshot(
        &self,
        request: PullSnapshotRequest,
    ) -> SnapshotResult<PullSnapshotResponse> {
        if !self.member.is_leader() {
            let leader = self
                .member
                .leader()
                .ok_or(SnapshotError::Transfer(RpcError::LeaderUnknown))?;
            debug!(
                "Node {} forwarding a pull snapshot request to the leader {}",
                self.member.name(),
                leader
            );
            let client = self.member.inner.client.clone();
            return Ok(self.member.call(client.pull_snapshot(&leader, request)).await?);
        }
        if request.require_read_only {
            self.member.set_read_only();
        }

        let snapshot = self
            .member
            .take_snapshot(Some(request.required_slots.as_slice()))
            .await?;
        debug!(
            "Node {}: sending {} of {} requested slots",
            self.member.name(),
            snapshot.slots.len(),
            request.required_slots.len()
        );
        Ok(PullSnapshotResponse {
            last_log_index: snapshot.last_log_index,
            last_log_term: snapshot.last_log_term,
            snapshots: snapshot.slots,
        })
    }

    /// Lets every member seal the working file of a partition. Leader only.
    pub async fn close_partition(
        &self,
        storage_group: &str,
        partition_id: u64,
        is_seq: bool,
    ) -> ClientResult<u64> {
        if !self.member.is_leader() {
            return Err(ClientError::NotLeader(self.member.leader()));
        }
        self.member
            .propose_and_commit(LogPayload::CloseFile {
                storage_group: storage_group.to_string(),
                partition_id,
                is_seq,
            })
            .await
    }

    pub fn on_read_file(&self, request: ReadFileRequest) -> RpcResult<Vec<u8>> {
        let root = &self.member.options().transfer_root;
        transfer::read_file(root, &request).map_err(|e| {
            warn!(
                "Node {} cannot serve {} at offset {}: {}",
                self.member.name(),
                request.path,
                request.offset,
                e
            );
            remote_error(e)
        })
    }

    /// Downloads a file of `node` below the local `dest`.
    pub async fn pull_remote_file(
        &self,
        node: &Node,
        remote_path: &str,
        dest: &Path,
        chunk_size: u32,
    ) -> SnapshotResult<u64> {
        let client = self.member.inner.client.clone();
        transfer::pull_remote_file(
            client.as_ref(),
            node,
            self.member.group(),
            remote_path,
            dest,
            chunk_size,
        )
        .await
    }
}
