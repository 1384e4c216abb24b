//! Replication state machine of one group member.
//!
//! A member is one node's view of a replicated group: its role, term and leader, the group's
//! log, and the applier the committed entries are handed to. Peer RPCs arrive through the
//! `on_*` handlers; outgoing traffic goes through the injected [`RaftClient`].

mod catchup;
mod election;
mod replication;
mod ticker;

use std::{
    future::Future,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ApplyError, ClientError, RpcError},
    message::{HardState, LogPayload, Snapshot},
    storage::LogStore,
    traits::{Applier, ClientResult, RaftClient, RpcResult, SecondaryLog, StorageResult},
    types::{GroupId, LogPosition, Node, PartitionGroup, Role},
};

use catchup::CatchUpTracker;

pub use replication::AppendLogResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftOptions {
    pub group: GroupId,
    pub heartbeat_interval_ms: u64,
    /// A follower without heartbeats for a random time in this range becomes an elector
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Bound of every peer call and of one replication round
    pub connection_timeout_ms: u64,
    pub sync_leader_max_wait_ms: u64,
    /// Replication attempts of a proposal before it is rolled back
    pub send_log_retry: usize,
    // 0 uses the available parallelism
    pub catch_up_parallelism: usize,
    /// Directory `ReadFile` requests are confined to
    pub transfer_root: PathBuf,
    pub flush_before_ack: bool,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            heartbeat_interval_ms: 1000,
            election_timeout_min_ms: 3000,
            election_timeout_max_ms: 6000,
            connection_timeout_ms: 2000,
            sync_leader_max_wait_ms: 20_000,
            send_log_retry: 3,
            catch_up_parallelism: 0,
            transfer_root: PathBuf::from("./data"),
            flush_before_ack: true,
        }
    }
}

impl RaftOptions {
    pub fn with_group(group: impl Into<GroupId>) -> Self {
        Self {
            group: group.into(),
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.max(1))
    }

    pub fn sync_leader_max_wait(&self) -> Duration {
        Duration::from_millis(self.sync_leader_max_wait_ms)
    }

    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min = self.election_timeout_min_ms;
        let max = self.election_timeout_max_ms.max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    fn catch_up_workers(&self) -> usize {
        if self.catch_up_parallelism > 0 {
            return self.catch_up_parallelism;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Term, role and leader change together under one lock.
#[derive(Debug)]
pub(crate) struct MemberState {
    pub(crate) role: Role,
    pub(crate) term: u64,
    pub(crate) leader: Option<Node>,
    pub(crate) voted_for: Option<Node>,
    pub(crate) last_heartbeat: Instant,
    pub(crate) read_only: bool,
}

impl MemberState {
    fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.term,
            voted_for: self.voted_for.clone(),
        }
    }
}

pub(crate) struct MemberInner {
    pub(crate) name: String,
    pub(crate) options: RaftOptions,
    pub(crate) this_node: Node,
    pub(crate) state: Mutex<MemberState>,
    pub(crate) all_nodes: RwLock<PartitionGroup>,
    pub(crate) log: LogStore,
    /// Serializes local log mutations
    pub(crate) append_lock: tokio::sync::Mutex<()>,
    pub(crate) apply_lock: tokio::sync::Mutex<()>,
    pub(crate) client: Arc<dyn RaftClient>,
    pub(crate) applier: Arc<dyn Applier>,
    pub(crate) secondary_log: Option<Arc<dyn SecondaryLog>>,
    pub(crate) commit_notify: Notify,
    pub(crate) catch_up: CatchUpTracker,
    pub(crate) snapshot_cache: Mutex<Option<Arc<Snapshot>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct RaftMember {
    pub(crate) inner: Arc<MemberInner>,
}

impl RaftMember {
    /// Builds a member over an opened log. The member starts as an elector in the persisted
    /// term.
    pub fn new(
        options: RaftOptions,
        this_node: Node,
        all_nodes: PartitionGroup,
        log: LogStore,
        client: Arc<dyn RaftClient>,
        applier: Arc<dyn Applier>,
        secondary_log: Option<Arc<dyn SecondaryLog>>,
    ) -> Self {
        let name = format!("{}[{}]", options.group, this_node.id);
        let hard_state = log.hard_state();
        let (shutdown, _) = watch::channel(false);
        let catch_up = CatchUpTracker::new(options.catch_up_workers(), options.connection_timeout());
        let inner = MemberInner {
            name,
            this_node,
            state: Mutex::new(MemberState {
                role: Role::Elector,
                term: hard_state.current_term,
                leader: None,
                voted_for: hard_state.voted_for,
                last_heartbeat: Instant::now(),
                read_only: false,
            }),
            all_nodes: RwLock::new(all_nodes),
            log,
            append_lock: tokio::sync::Mutex::new(()),
            apply_lock: tokio::sync::Mutex::new(()),
            client,
            applier,
            secondary_log,
            commit_notify: Notify::new(),
            catch_up,
            snapshot_cache: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            options,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Applies entries committed before a restart and starts the election ticker.
    pub async fn start(&self) -> ClientResult<()> {
        self.apply_committed().await?;
        let ticker = tokio::spawn(ticker::run(self.clone(), self.inner.shutdown.subscribe()));
        self.inner.tasks.lock().push(ticker);
        info!(
            "Node {} started in term {} with log {:?}",
            self.name(),
            self.term(),
            self.last_log_position()
        );
        Ok(())
    }

    pub async fn stop(&self) -> StorageResult<()> {
        let _ = self.inner.shutdown.send(true);
        for task in std::mem::take(&mut *self.inner.tasks.lock()) {
            task.abort();
        }
        self.inner.catch_up.abort_all();
        info!("Node {} stopped", self.name());
        self.inner.log.close().await
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn group(&self) -> &GroupId {
        &self.inner.options.group
    }

    pub fn options(&self) -> &RaftOptions {
        &self.inner.options
    }

    pub fn this_node(&self) -> &Node {
        &self.inner.this_node
    }

    pub fn log(&self) -> &LogStore {
        &self.inner.log
    }

    pub fn role(&self) -> Role {
        self.inner.state.lock().role
    }

    pub fn term(&self) -> u64 {
        self.inner.state.lock().term
    }

    pub fn leader(&self) -> Option<Node> {
        self.inner.state.lock().leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn all_nodes(&self) -> PartitionGroup {
        self.inner.all_nodes.read().clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.log.commit_index()
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.log.applied_index()
    }

    pub fn last_log_position(&self) -> LogPosition {
        self.inner.log.last_position()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.state.lock().read_only
    }

    /// Blocks further proposals through this member.
    pub fn set_read_only(&self) {
        let mut state = self.inner.state.lock();
        if !state.read_only {
            state.read_only = true;
            info!("Node {} is now read-only", self.inner.name);
        }
    }

    /// Runs `f` on the state. A changed hard state is staged in the log under the state lock
    /// and written out on the blocking pool in the background.
    pub(crate) fn update_state<R>(&self, f: impl FnOnce(&mut MemberState) -> R) -> R {
        let (result, changed) = self.stage_state(f);
        if changed {
            let member = self.clone();
            tokio::spawn(async move { member.persist_hard_state().await });
        }
        result
    }

    /// Like [`Self::update_state`], returning only once the hard state is on disk. Votes and
    /// adopted terms go through here before they are answered.
    pub(crate) async fn update_state_durable<R>(&self, f: impl FnOnce(&mut MemberState) -> R) -> R {
        let (result, changed) = self.stage_state(f);
        if changed {
            self.persist_hard_state().await;
        }
        result
    }

    fn stage_state<R>(&self, f: impl FnOnce(&mut MemberState) -> R) -> (R, bool) {
        let mut state = self.inner.state.lock();
        let before = state.hard_state();
        let result = f(&mut state);
        let after = state.hard_state();
        // staged in state order, each write then takes the newest
        let changed = before != after && self.inner.log.stage_hard_state(after);
        (result, changed)
    }

    async fn persist_hard_state(&self) {
        if let Err(e) = self.inner.log.persist_hard_state().await {
            error!("Node {} failed to persist its hard state: {}", self.inner.name, e);
        }
    }

    /// Adopts `term` from a higher-term message and drops any leadership.
    pub fn retire_from_leader(&self, term: u64) {
        let stepped_down = self.update_state(|state| {
            if term <= state.term {
                return false;
            }
            let was_leader = state.role == Role::Leader;
            state.term = term;
            state.role = Role::Elector;
            state.leader = None;
            state.voted_for = None;
            state.last_heartbeat = Instant::now();
            was_leader
        });
        if stepped_down {
            info!(
                "Node {} stepped down from leader, term is now {}",
                self.inner.name, term
            );
            *self.inner.snapshot_cache.lock() = None;
        }
    }

    /// Whether this member still leads in `term`.
    pub(crate) fn leads_in(&self, term: u64) -> bool {
        let state = self.inner.state.lock();
        state.role == Role::Leader && state.term == term
    }

    pub(crate) fn peers(&self) -> (Vec<Node>, usize) {
        let nodes = self.inner.all_nodes.read();
        let peers = nodes.peers(&self.inner.this_node).cloned().collect();
        (peers, nodes.quorum_acks())
    }

    /// Bounds a peer call by the connection timeout.
    pub(crate) async fn call<T>(&self, call: impl Future<Output = RpcResult<T>>) -> RpcResult<T> {
        match tokio::time::timeout(self.inner.options.connection_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    pub(crate) fn spawn_task(&self, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Applies every committed entry not applied yet, in index order.
    pub async fn apply_committed(&self) -> ClientResult<()> {
        self.apply_entries(None).await
    }

    /// Like [`Self::apply_committed`], also reporting the apply result of entry `watch`.
    pub(crate) async fn apply_entries(&self, watch: Option<u64>) -> ClientResult<()> {
        let _guard = self.inner.apply_lock.lock().await;
        let log = &self.inner.log;
        let mut watched = Ok(());
        loop {
            let (applied, commit) = (log.applied_index(), log.commit_index());
            if applied >= commit {
                break;
            }
            let entries = log.get_logs(applied + 1, commit).await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                let index = entry.curr_log_index;
                if entry.payload != LogPayload::Empty {
                    match self.inner.applier.apply(&entry).await {
                        Ok(()) => {}
                        Err(ApplyError::Duplicate(msg)) => {
                            debug!("Node {} ignores duplicate entry {}: {}", self.inner.name, index, msg);
                        }
                        Err(ApplyError::Rejected(msg)) => {
                            warn!("Node {} could not apply entry {}: {}", self.inner.name, index, msg);
                            if watch == Some(index) {
                                watched = Err(ClientError::Apply(ApplyError::Rejected(msg)));
                            }
                        }
                        Err(e) => {
                            error!("Node {} failed to apply entry {}: {}", self.inner.name, index, e);
                            self.inner.commit_notify.notify_waiters();
                            return Err(e.into());
                        }
                    }
                }
                log.set_applied(index);
            }
        }
        self.inner.commit_notify.notify_waiters();
        watched
    }
}
