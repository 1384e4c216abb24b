//! Vote handling and elections.

use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use super::RaftMember;
use crate::error::report;
use crate::message::{LogPayload, Response, VoteRequest};
use crate::types::{LogPosition, Role};

/// Whether a log ending at `candidate` is at least as new as one ending at `local`.
fn is_up_to_date(candidate: LogPosition, local: LogPosition) -> bool {
    candidate.term > local.term || (candidate.term == local.term && candidate.index >= local.index)
}

impl RaftMember {
    pub async fn on_vote_request(&self, request: VoteRequest) -> Response {
        let last = self.inner.log.last_position();
        let response = self
            .update_state_durable(|state| {
                if state.leader.as_ref() == Some(&request.elector) {
                    return Response::Agree;
                }
                if state.role != Role::Elector {
                    return Response::LeaderStillOnline;
                }
                if let Some(secondary) = &self.inner.secondary_log {
                    let local = secondary.last_log_position();
                    if !request.secondary.is_some_and(|p| is_up_to_date(p, local)) {
                        return Response::SecondaryLogStale;
                    }
                }
                if request.term <= state.term {
                    return Response::Term(state.term);
                }
                let candidate = LogPosition::new(request.last_log_index, request.last_log_term);
                if !is_up_to_date(candidate, last) {
                    return Response::LogMismatch;
                }

                state.term = request.term;
                state.role = Role::Follower;
                state.leader = Some(request.elector.clone());
                state.voted_for = Some(request.elector.clone());
                state.last_heartbeat = Instant::now();
                Response::Agree
            })
            .await;

        match response {
            Response::Agree => info!(
                "Node {} voted for {} in term {}",
                self.inner.name, request.elector, request.term
            ),
            other => debug!(
                "Node {} rejected the vote of {} in term {}: {:?}",
                self.inner.name, request.elector, request.term, other
            ),
        }
        response
    }

    /// Runs one election round: bumps the term, votes for itself and asks every peer in
    /// parallel. Returns whether this member became the leader.
    pub async fn start_election(&self) -> bool {
        let last = self.inner.log.last_position();
        let request = self.update_state_durable(|state| {
            if state.role != Role::Elector {
                return None;
            }
            state.term += 1;
            state.voted_for = Some(self.inner.this_node.clone());
            state.leader = None;
            state.last_heartbeat = Instant::now();
            Some(VoteRequest {
                group: self.inner.options.group.clone(),
                elector: self.inner.this_node.clone(),
                term: state.term,
                last_log_index: last.index,
                last_log_term: last.term,
                secondary: self
                    .inner
                    .secondary_log
                    .as_ref()
                    .map(|s| s.last_log_position()),
            })
        })
        .await;
        let Some(request) = request else {
            return self.is_leader();
        };
        let term = request.term;
        let (peers, required) = self.peers();
        info!(
            "Node {} starting election for term {}, {} votes needed",
            self.inner.name, term, required
        );

        let mut calls: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| {
                let request = request.clone();
                async move {
                    let result = self
                        .call(self.inner.client.request_vote(&peer, request))
                        .await;
                    (peer, result)
                }
            })
            .collect();

        let mut granted = 0;
        while granted < required {
            let Some((peer, result)) = calls.next().await else {
                break;
            };
            match report(result, &self.inner.name, "request_vote", Some(&peer)) {
                Some(Response::Agree) => granted += 1,
                Some(Response::Term(peer_term)) if peer_term > term => {
                    info!(
                        "Node {} found term {} at {}, abandoning election",
                        self.inner.name, peer_term, peer
                    );
                    self.retire_from_leader(peer_term);
                    return false;
                }
                Some(other) => debug!("Node {} got {:?} from {}", self.inner.name, other, peer),
                None => {}
            }
            if self.term() != term {
                return false;
            }
        }

        if granted < required {
            warn!(
                "Node {} lost the election for term {} with {} of {} votes",
                self.inner.name, term, granted, required
            );
            return false;
        }
        self.become_leader(term)
    }

    fn become_leader(&self, term: u64) -> bool {
        let elected = self.update_state(|state| {
            if state.term != term || state.role != Role::Elector {
                return false;
            }
            state.role = Role::Leader;
            state.leader = Some(self.inner.this_node.clone());
            true
        });
        if !elected {
            return false;
        }
        info!("Node {} became the leader in term {}", self.inner.name, term);
        *self.inner.snapshot_cache.lock() = None;

        // an entry of the new term lets followers commit what earlier terms left behind
        let member = self.clone();
        self.spawn_task(async move {
            member.send_heartbeats().await;
            if let Err(e) = member.propose(LogPayload::Empty).await {
                warn!(
                    "Node {} could not commit its first entry in term {}: {}",
                    member.inner.name, term, e
                );
            }
        });
        true
    }
}
