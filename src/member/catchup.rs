//! Catching lagging followers up by log replay or snapshot install.

use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

use super::RaftMember;
use crate::error::{SnapshotError, StorageError};
use crate::message::{AppendEntryRequest, InstallSnapshotRequest, Response, Snapshot};
use crate::traits::SnapshotResult;
use crate::types::{LogPosition, Node, NodeId, Slot};

/// At most one catch-up per peer, on a bounded number of workers.
pub(crate) struct CatchUpTracker {
    // peer -> (last activity, ticket)
    in_flight: Mutex<HashMap<NodeId, (Instant, u64)>>,
    next_ticket: Mutex<u64>,
    permits: Arc<Semaphore>,
    stale_after: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl CatchUpTracker {
    pub(crate) fn new(workers: usize, stale_after: Duration) -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            next_ticket: Mutex::new(0),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            stale_after,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Registers a catch-up of `peer`. An entry idle for longer than `stale_after` is taken
    /// over.
    fn try_begin(&self, peer: NodeId) -> Option<u64> {
        let mut in_flight = self.in_flight.lock();
        if let Some((last_active, _)) = in_flight.get(&peer) {
            if last_active.elapsed() < self.stale_after {
                return None;
            }
        }
        let ticket = {
            let mut next = self.next_ticket.lock();
            *next += 1;
            *next
        };
        in_flight.insert(peer, (Instant::now(), ticket));
        Some(ticket)
    }

    fn touch(&self, peer: NodeId) {
        if let Some(entry) = self.in_flight.lock().get_mut(&peer) {
            entry.0 = Instant::now();
        }
    }

    fn finish(&self, peer: NodeId, ticket: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&peer).is_some_and(|(_, t)| *t == ticket) {
            in_flight.remove(&peer);
        }
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub(crate) fn abort_all(&self) {
        self.tasks.lock().abort_all();
        self.in_flight.lock().clear();
    }
}

/// Releases the tracker entry when the catch-up task ends or is aborted.
struct Ticket {
    member: RaftMember,
    peer: NodeId,
    ticket: u64,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.member.inner.catch_up.finish(self.peer, self.ticket);
    }
}

enum Replay {
    CaughtUp,
    NeedsSnapshot,
    Aborted,
}

impl RaftMember {
    /// Starts catching `peer` up from its reported last position unless one is running.
    pub(crate) fn spawn_catch_up(&self, peer: Node, follower: LogPosition, term: u64) {
        let tracker = &self.inner.catch_up;
        let Some(ticket) = tracker.try_begin(peer.id) else {
            debug!("Node {} is already catching up {}", self.inner.name, peer);
            return;
        };
        let member = self.clone();
        tracker.spawn(async move {
            let _ticket = Ticket {
                member: member.clone(),
                peer: peer.id,
                ticket,
            };
            let Ok(_permit) = member.inner.catch_up.permits.clone().acquire_owned().await else {
                return;
            };
            match member.catch_up(&peer, follower, term).await {
                Ok(true) => debug!("Node {} caught up {}", member.inner.name, peer),
                Ok(false) => debug!("Node {} gave up catching up {}", member.inner.name, peer),
                Err(e) => warn!("Node {} failed to catch up {}: {}", member.inner.name, peer, e),
            }
        });
    }

    pub fn catch_ups_in_flight(&self) -> usize {
        self.inner.catch_up.in_flight()
    }

    /// Brings `peer`, whose log ends at `follower`, level with the local log. Replays entries
    /// when the peer's position exists locally, otherwise installs a snapshot first. Returns
    /// false when leadership in `term` was lost on the way.
    pub async fn catch_up(
        &self,
        peer: &Node,
        follower: LogPosition,
        term: u64,
    ) -> SnapshotResult<bool> {
        if !self.leads_in(term) {
            return Ok(false);
        }
        if self.is_consistent(follower).await {
            match self.replay_logs(peer, follower.index + 1, term).await? {
                Replay::CaughtUp => return Ok(true),
                Replay::Aborted => return Ok(false),
                Replay::NeedsSnapshot => {}
            }
        }

        info!(
            "Node {} sends a snapshot to {}, whose log ends at {:?}",
            self.inner.name, peer, follower
        );
        let Some(snapshot_index) = self.send_snapshot(peer, term).await? else {
            return Ok(false);
        };
        match self.replay_logs(peer, snapshot_index + 1, term).await? {
            Replay::CaughtUp => Ok(true),
            Replay::Aborted => Ok(false),
            Replay::NeedsSnapshot => Err(SnapshotError::Install(format!(
                "{} still diverges after installing the snapshot at {}",
                peer, snapshot_index
            ))),
        }
    }

    /// Whether `position` is an entry of the local log.
    async fn is_consistent(&self, position: LogPosition) -> bool {
        let log = &self.inner.log;
        if position.index > log.last_log_index() || position.index + 1 < log.first_index() {
            return false;
        }
        matches!(log.term_at(position.index).await, Ok(term) if term == position.term)
    }

    async fn replay_logs(&self, peer: &Node, mut next: u64, term: u64) -> SnapshotResult<Replay> {
        let log = &self.inner.log;
        'replay: loop {
            let last = log.last_log_index();
            if next > last {
                return Ok(Replay::CaughtUp);
            }
            let entries = match log.get_logs(next, last).await {
                Ok(entries) => entries,
                Err(StorageError::Compacted(_)) => return Ok(Replay::NeedsSnapshot),
                Err(e) => return Err(e.into()),
            };
            if entries.is_empty() {
                return Ok(Replay::CaughtUp);
            }
            for entry in entries {
                if !self.leads_in(term) {
                    return Ok(Replay::Aborted);
                }
                self.inner.catch_up.touch(peer.id);
                let request = AppendEntryRequest {
                    group: self.inner.options.group.clone(),
                    term,
                    leader: self.inner.this_node.clone(),
                    entry: entry.serialize(),
                };
                let reply = self.send_append(peer, request).await?;
                match reply.response {
                    Response::Agree => next = entry.curr_log_index + 1,
                    Response::Term(peer_term) if peer_term > term => {
                        self.retire_from_leader(peer_term);
                        return Ok(Replay::Aborted);
                    }
                    Response::LogMismatch => {
                        let follower = LogPosition::new(reply.last_log_index, reply.last_log_term);
                        if follower.index + 1 != entry.curr_log_index
                            && self.is_consistent(follower).await
                        {
                            next = follower.index + 1;
                            continue 'replay;
                        }
                        return Ok(Replay::NeedsSnapshot);
                    }
                    other => {
                        debug!(
                            "Node {} stops replaying to {} on {:?}",
                            self.inner.name, peer, other
                        );
                        return Ok(Replay::Aborted);
                    }
                }
            }
        }
    }

    /// Snapshot of the applied state of `slots`, or of every held slot.
    pub async fn take_snapshot(&self, slots: Option<&[Slot]>) -> SnapshotResult<Snapshot> {
        let _guard = self.inner.apply_lock.lock().await;
        let applied = self.inner.log.applied_index();
        let last_log_term = self.inner.log.term_at(applied).await?;
        let slots = self.inner.applier.take_snapshot(slots).await?;
        Ok(Snapshot {
            last_log_index: applied,
            last_log_term,
            slots,
        })
    }

    /// The cached snapshot while the log still holds everything after it.
    async fn leader_snapshot(&self) -> SnapshotResult<Arc<Snapshot>> {
        let cached = self.inner.snapshot_cache.lock().clone();
        if let Some(snapshot) = cached {
            if snapshot.last_log_index + 1 >= self.inner.log.first_index() {
                return Ok(snapshot);
            }
        }
        let snapshot = Arc::new(self.take_snapshot(None).await?);
        *self.inner.snapshot_cache.lock() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Installs a snapshot on `peer`. Returns its last index, or `None` if leadership was lost.
    async fn send_snapshot(&self, peer: &Node, term: u64) -> SnapshotResult<Option<u64>> {
        let snapshot = self.leader_snapshot().await?;
        let request = InstallSnapshotRequest {
            group: self.inner.options.group.clone(),
            term,
            leader: self.inner.this_node.clone(),
            snapshot: snapshot.serialize().map_err(SnapshotError::DataCorrupted)?,
        };
        let response = self
            .call(self.inner.client.install_snapshot(peer, request))
            .await?;
        match response {
            Response::Agree => Ok(Some(snapshot.last_log_index)),
            Response::Term(peer_term) if peer_term > term => {
                self.retire_from_leader(peer_term);
                Ok(None)
            }
            other => Err(SnapshotError::Install(format!(
                "{} answered {:?}",
                peer, other
            ))),
        }
    }

    pub async fn on_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> SnapshotResult<Response> {
        if let Err(term) = self.follow(request.term, &request.leader).await {
            return Ok(Response::Term(term));
        }
        let snapshot = Snapshot::deserialize(&request.snapshot).map_err(SnapshotError::DataCorrupted)?;

        let log = &self.inner.log;
        let _append = self.inner.append_lock.lock().await;
        let _apply = self.inner.apply_lock.lock().await;
        let commit = log.commit_index();
        if snapshot.last_log_index <= commit {
            if log.last_log_index() > commit {
                log.truncate_after(commit).await?;
            }
            debug!(
                "Node {} already committed {}, snapshot at {} only drops the uncommitted tail",
                self.inner.name, commit, snapshot.last_log_index
            );
            return Ok(Response::Agree);
        }

        let slots = snapshot.slots.len();
        for (slot, data) in snapshot.slots {
            self.inner.applier.install_snapshot(slot, data).await?;
        }
        log.reset(snapshot.last_log_index + 1, snapshot.last_log_term)
            .await?;
        log.set_applied(snapshot.last_log_index);
        self.inner.commit_notify.notify_waiters();
        info!(
            "Node {} installed a snapshot of {} slots at index {} (term {}) from {}",
            self.inner.name, slots, snapshot.last_log_index, snapshot.last_log_term, request.leader
        );
        Ok(Response::Agree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_allows_one_catch_up_per_peer() {
        let tracker = CatchUpTracker::new(2, Duration::from_secs(60));
        let first = tracker.try_begin(1).unwrap();
        assert!(tracker.try_begin(1).is_none());
        assert!(tracker.try_begin(2).is_some());
        assert_eq!(tracker.in_flight(), 2);

        tracker.finish(1, first);
        assert!(tracker.try_begin(1).is_some());
    }

    #[test]
    fn test_stale_catch_up_is_taken_over() {
        let tracker = CatchUpTracker::new(1, Duration::ZERO);
        let old = tracker.try_begin(7).unwrap();
        let new = tracker.try_begin(7).unwrap();
        assert_ne!(old, new);

        // the superseded task must not release the new entry
        tracker.finish(7, old);
        assert_eq!(tracker.in_flight(), 1);
        tracker.finish(7, new);
        assert_eq!(tracker.in_flight(), 0);
    }
}
