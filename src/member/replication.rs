//! Heartbeats, entry replication and proposals.

use std::time::Instant;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RaftMember;
use crate::error::{ClientError, RpcError, report};
use crate::message::{
    AppendEntryRequest, AppendEntryResponse, HeartbeatRequest, HeartbeatResponse, LogEntry,
    LogPayload, Response,
};
use crate::traits::{ClientResult, RpcResult, StorageResult};
use crate::types::{LogPosition, Node, Role};

/// Outcome of one replication round of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendLogResult {
    Ok,
    TimedOut,
    LeadershipStale,
}

impl RaftMember {
    /// Accepts `leader` for `term` unless the term is stale. Returns the current term when the
    /// message must be rejected.
    pub(crate) async fn follow(&self, term: u64, leader: &Node) -> Result<(), u64> {
        self.update_state_durable(|state| {
            if term < state.term {
                return Err(state.term);
            }
            if term > state.term {
                state.voted_for = None;
                state.term = term;
            }
            if state.role != Role::Follower || state.leader.as_ref() != Some(leader) {
                info!(
                    "Node {} follows {} in term {}",
                    self.inner.name, leader, term
                );
            }
            state.role = Role::Follower;
            state.leader = Some(leader.clone());
            state.last_heartbeat = Instant::now();
            Ok(())
        })
        .await
    }

    pub async fn on_heartbeat(&self, request: HeartbeatRequest) -> HeartbeatResponse {
        let response = match self.follow(request.term, &request.leader).await {
            Err(term) => Response::Term(term),
            Ok(()) => {
                let last = self.inner.log.last_position();
                // entries of older terms may still be replaced by this leader
                if last.term == request.term {
                    self.advance_commit(request.commit_log_index).await;
                }
                Response::Agree
            }
        };
        let last = self.inner.log.last_position();
        HeartbeatResponse {
            response,
            follower: self.inner.this_node.clone(),
            last_log_index: last.index,
            last_log_term: last.term,
        }
    }

    async fn advance_commit(&self, leader_commit: u64) {
        let moved = report(
            self.inner.log.commit_to(leader_commit).await,
            &self.inner.name,
            "commit_to",
            None,
        );
        if moved == Some(true) {
            if let Err(e) = self.apply_committed().await {
                warn!("Node {} failed to apply committed entries: {}", self.inner.name, e);
            }
        }
    }

    pub async fn on_append_entry(
        &self,
        request: AppendEntryRequest,
    ) -> StorageResult<AppendEntryResponse> {
        let reply = |response, last: LogPosition| AppendEntryResponse {
            response,
            last_log_index: last.index,
            last_log_term: last.term,
        };
        if let Err(term) = self.follow(request.term, &request.leader).await {
            return Ok(reply(Response::Term(term), self.inner.log.last_position()));
        }
        let entry = match LogEntry::deserialize(&request.entry) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    "Node {} received an undecodable entry from {}: {}",
                    self.inner.name, request.leader, e
                );
                return Ok(reply(Response::LogMismatch, self.inner.log.last_position()));
            }
        };

        let log = &self.inner.log;
        let _guard = self.inner.append_lock.lock().await;
        let last = log.last_position();
        let previous = entry.previous();
        let accepted = if previous == last {
            true
        } else if previous.index + 1 == last.index
            && entry.curr_log_term >= last.term
            && last.index > log.commit_index()
            && log.term_at(previous.index).await? == previous.term
        {
            debug!(
                "Node {} replaces uncommitted entry {} (term {}) with term {}",
                self.inner.name, last.index, last.term, entry.curr_log_term
            );
            log.truncate_after(previous.index).await?;
            true
        } else {
            false
        };
        if !accepted {
            debug!(
                "Node {} cannot append entry {} after {:?}, local last is {:?}",
                self.inner.name, entry.curr_log_index, previous, last
            );
            return Ok(reply(Response::LogMismatch, last));
        }

        log.append(std::slice::from_ref(&entry), 0).await?;
        if self.inner.options.flush_before_ack {
            log.flush(false).await?;
        }
        Ok(reply(Response::Agree, entry.position()))
    }

    pub(crate) async fn send_append(
        &self,
        peer: &Node,
        request: AppendEntryRequest,
    ) -> RpcResult<AppendEntryResponse> {
        self.call(self.inner.client.append_entry(peer, request)).await
    }

    /// Sends `entry` to every peer and waits for `quorum_acks` acknowledgements within the
    /// connection timeout. Slow peers keep going in the background.
    pub async fn replicate_to_quorum(&self, entry: &LogEntry, term: u64) -> AppendLogResult {
        let (peers, required) = self.peers();
        if required == 0 {
            return AppendLogResult::Ok;
        }
        let request = AppendEntryRequest {
            group: self.inner.options.group.clone(),
            term,
            leader: self.inner.this_node.clone(),
            entry: entry.serialize(),
        };

        let (tx, mut rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            let member = self.clone();
            let request = request.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = member.send_append(&peer, request).await;
                let _ = tx.send((peer, result)).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + self.inner.options.connection_timeout();
        let mut acks = 0;
        loop {
            let (peer, result) = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => reply,
                Ok(None) | Err(_) => {
                    debug!(
                        "Node {} got {} of {} acks for entry {}",
                        self.inner.name, acks, required, entry.curr_log_index
                    );
                    return AppendLogResult::TimedOut;
                }
            };
            let Some(response) = report(result, &self.inner.name, "append_entry", Some(&peer)) else {
                continue;
            };
            match response.response {
                Response::Agree => {
                    acks += 1;
                    if acks >= required {
                        return AppendLogResult::Ok;
                    }
                }
                Response::Term(peer_term) if peer_term > term => {
                    self.retire_from_leader(peer_term);
                    return AppendLogResult::LeadershipStale;
                }
                Response::LogMismatch => {
                    self.spawn_catch_up(
                        peer,
                        LogPosition::new(response.last_log_index, response.last_log_term),
                        term,
                    );
                }
                other => debug!("Node {} got {:?} from {}", self.inner.name, other, peer),
            }
        }
    }

    /// Appends `payload` as a new entry and blocks until it is committed and applied.
    /// Returns the index of the entry.
    pub async fn propose_and_commit(&self, payload: LogPayload) -> ClientResult<u64> {
        if self.is_read_only() {
            return Err(ClientError::ReadOnly);
        }
        self.propose(payload).await
    }

    pub(crate) async fn propose(&self, payload: LogPayload) -> ClientResult<u64> {
        let log = &self.inner.log;
        let guard = self.inner.append_lock.lock().await;
        let term = {
            let state = self.inner.state.lock();
            if state.role != Role::Leader {
                return Err(ClientError::NotLeader(state.leader.clone()));
            }
            state.term
        };
        let last = log.last_position();
        let entry = LogEntry::new(last.index + 1, term, last, payload);
        let index = entry.curr_log_index;
        if let Err(e) = log.append(std::slice::from_ref(&entry), 0).await {
            warn!("Node {} failed to append entry {}: {}", self.inner.name, index, e);
            report(log.truncate_after(index - 1).await, &self.inner.name, "rollback", None);
            return Err(e.into());
        }

        let retries = self.inner.options.send_log_retry.max(1);
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            match self.replicate_to_quorum(&entry, term).await {
                AppendLogResult::Ok => break None,
                AppendLogResult::LeadershipStale => break Some(ClientError::LeadershipStale),
                AppendLogResult::TimedOut if attempt >= retries => break Some(ClientError::Timeout),
                AppendLogResult::TimedOut => {
                    debug!(
                        "Node {} retries entry {}, {} attempts left",
                        self.inner.name,
                        index,
                        retries - attempt
                    );
                }
            }
        };
        if let Some(error) = failure {
            warn!(
                "Node {} rolls back entry {} of term {}: {}",
                self.inner.name, index, term, error
            );
            report(log.truncate_after(index - 1).await, &self.inner.name, "rollback", None);
            // followers may hold the dropped entry, so its index must never come back in this term
            self.retire_from_leader(term + 1);
            return Err(error);
        }

        log.commit_to(index).await?;
        drop(guard);
        self.apply_entries(Some(index)).await?;
        Ok(index)
    }

    /// Waits until this member has applied everything the leader had committed when asked.
    pub async fn sync_with_leader(&self) -> bool {
        let leader = {
            let state = self.inner.state.lock();
            if state.role == Role::Leader {
                return true;
            }
            state.leader.clone()
        };
        let Some(leader) = leader else {
            debug!("Node {} cannot sync, the leader is unknown", self.inner.name);
            return false;
        };

        let deadline = Instant::now() + self.inner.options.sync_leader_max_wait();
        let target = match self
            .call(
                self.inner
                    .client
                    .request_commit_index(&leader, &self.inner.options.group),
            )
            .await
        {
            Ok(index) => index,
            Err(e) => {
                warn!("Node {} cannot get the commit index from {}: {}", self.inner.name, leader, e);
                return false;
            }
        };

        loop {
            let notified = self.inner.commit_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.log.applied_index() >= target {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Node {} did not reach commit index {} of {} in time",
                    self.inner.name, target, leader
                );
                return false;
            }
            let round = self.inner.options.heartbeat_interval().min(deadline - now);
            let _ = tokio::time::timeout(round, notified).await;
        }
    }

    /// The leader answers its commit index, a follower asks the leader.
    pub async fn on_request_commit_index(&self) -> RpcResult<u64> {
        let leader = {
            let state = self.inner.state.lock();
            if state.role == Role::Leader {
                return Ok(self.inner.log.commit_index());
            }
            state.leader.clone()
        };
        let leader = leader.ok_or(RpcError::LeaderUnknown)?;
        debug!("Node {} forwards a commit index request to {}", self.inner.name, leader);
        self.call(
            self.inner
                .client
                .request_commit_index(&leader, &self.inner.options.group),
        )
        .await
    }

    /// Sends one heartbeat to every peer and starts catch-up for lagging ones.
    pub async fn send_heartbeats(&self) {
        let (term, commit) = {
            let state = self.inner.state.lock();
            if state.role != Role::Leader {
                return;
            }
            (state.term, self.inner.log.commit_index())
        };
        let (peers, _) = self.peers();
        let request = HeartbeatRequest {
            group: self.inner.options.group.clone(),
            term,
            leader: self.inner.this_node.clone(),
            commit_log_index: commit,
        };

        let replies = join_all(peers.into_iter().map(|peer| {
            let request = request.clone();
            async move {
                let result = self
                    .call(self.inner.client.send_heartbeat(&peer, request))
                    .await;
                (peer, result)
            }
        }))
        .await;

        let last = self.inner.log.last_position();
        for (peer, result) in replies {
            let Some(reply) = report(result, &self.inner.name, "send_heartbeat", Some(&peer)) else {
                continue;
            };
            match reply.response {
                Response::Term(peer_term) if peer_term > term => {
                    self.retire_from_leader(peer_term);
                    return;
                }
                Response::Agree => {
                    let follower = LogPosition::new(reply.last_log_index, reply.last_log_term);
                    if follower != last {
                        self.spawn_catch_up(peer, follower, term);
                    }
                }
                _ => {}
            }
        }
    }
}
