use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tsraft::message::{AppendEntryRequest, HeartbeatRequest, VoteRequest};
use tsraft::mock::{ApplyFailure, MemoryApplier, MockNetwork};
use tsraft::{
    ApplyError, ClientError, LogEntry, LogPosition, LogStore, LogStoreOptions, PartitionGroup,
    RaftMember, Response, Role, SecondaryLog,
};

mod common;
use common::test_cluster::{
    TestCluster, TestClusterConfig, plan, raft_options, test_node, wait_until,
};

/// Secondary log parked at a fixed position.
struct FixedSecondaryLog(LogPosition);

impl SecondaryLog for FixedSecondaryLog {
    fn last_log_position(&self) -> LogPosition {
        self.0
    }
}

fn chained_entry(index: u64, term: u64, previous_term: u64) -> LogEntry {
    LogEntry::new(
        index,
        term,
        LogPosition::new(index - 1, previous_term),
        plan(0, index as u8),
    )
}

fn append_request(cluster: &TestCluster, leader: u64, term: u64, entry: &LogEntry) -> AppendEntryRequest {
    AppendEntryRequest {
        group: cluster.config.group.clone(),
        term,
        leader: test_node(leader),
        entry: entry.serialize(),
    }
}

#[tokio::test]
async fn test_leader_election() {
    let _ = tracing_subscriber::fmt::try_init();
    let config = TestClusterConfig {
        manual_election: false,
        ..TestClusterConfig::new(&[1, 2, 3])
    };
    let cluster = TestCluster::new(config).await;

    let leader = cluster.wait_for_leader(Duration::from_secs(10)).await;
    assert_eq!(cluster.followers().count(), 2);
    for node in &cluster.nodes {
        let hard_state = node.raft().log().hard_state();
        assert_eq!(hard_state.current_term, leader.raft().term());
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_propose_replicates_and_applies() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let leader = cluster.elect(1).await;

    let first = leader.raft().propose_and_commit(plan(1, 10)).await.unwrap();
    let second = leader.raft().propose_and_commit(plan(2, 20)).await.unwrap();
    assert_eq!(second, first + 1);
    assert_eq!(leader.raft().commit_index(), second);
    assert_eq!(leader.raft().applied_index(), second);
    assert_eq!(leader.applier.plans(1), vec![vec![1, 10]]);

    for id in [2, 3] {
        let follower = cluster.node(id);
        assert_eq!(follower.raft().role(), Role::Follower);
        assert!(follower.raft().sync_with_leader().await);
        assert!(follower.raft().applied_index() >= second);
        assert_eq!(follower.applier.plans(1), vec![vec![1, 10]]);
        assert_eq!(follower.applier.plans(2), vec![vec![2, 20]]);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_quorum_tolerates_unreachable_follower() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let leader = cluster.elect(1).await;
    let lagging = cluster.node(3);
    let start = leader.raft().last_log_position();
    wait_until(Duration::from_secs(2), || lagging.raft().last_log_position() == start).await;

    cluster.network.isolate(3).await;
    for value in 0..3 {
        leader.raft().propose_and_commit(plan(5, value)).await.unwrap();
    }
    assert_eq!(lagging.raft().last_log_position(), start);

    // heartbeats find the gap and replay the missing entries
    cluster.network.heal(3).await;
    let target = leader.raft().last_log_position();
    wait_until(Duration::from_secs(3), || {
        lagging.raft().last_log_position() == target && lagging.applier.plans(5).len() == 3
    })
    .await;
    assert_eq!(lagging.raft().commit_index(), target.index);
    wait_until(Duration::from_secs(2), || leader.raft().catch_ups_in_flight() == 0).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_proposal_rolls_back_without_quorum() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let leader = cluster.elect(1).await;
    let term = leader.raft().term();
    let before = leader.raft().last_log_position();

    cluster.network.isolate(2).await;
    cluster.network.isolate(3).await;
    let result = leader.raft().propose_and_commit(plan(1, 1)).await;
    assert!(matches!(result, Err(ClientError::Timeout)));
    assert_eq!(leader.raft().last_log_position(), before);
    assert_eq!(leader.raft().commit_index(), before.index);
    assert!(leader.applier.plans(1).is_empty());
    // the rolled back index is never reused in the same term
    assert_eq!(leader.raft().role(), Role::Elector);
    assert_eq!(leader.raft().term(), term + 1);

    cluster.network.heal(2).await;
    cluster.network.heal(3).await;
    let leader = cluster.elect(1).await;
    let index = leader.raft().propose_and_commit(plan(1, 2)).await.unwrap();
    assert_eq!(index, before.index + 2);
    assert_eq!(leader.applier.plans(1), vec![vec![1, 2]]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rolled_back_entry_is_not_committed_on_followers() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let leader = cluster.elect(1).await;
    let term = leader.raft().term();
    let before = leader.raft().last_log_position();
    let stale = cluster.node(2);
    wait_until(Duration::from_secs(2), || {
        stale.raft().last_log_position() == before && stale.raft().commit_index() == before.index
    })
    .await;

    cluster.network.isolate(2).await;
    cluster.network.isolate(3).await;
    // node 2 stores the entry but its acknowledgement never arrives
    let lost = LogEntry::new(before.index + 1, term, before, plan(9, 0xAA));
    let reply = stale
        .raft()
        .on_append_entry(append_request(&cluster, 1, term, &lost))
        .await
        .unwrap();
    assert_eq!(reply.response, Response::Agree);
    let result = leader.raft().propose_and_commit(plan(9, 0xAA)).await;
    assert!(matches!(result, Err(ClientError::Timeout)));
    assert_eq!(leader.raft().role(), Role::Elector);

    cluster.network.heal(3).await;
    let leader = cluster.elect(1).await;
    assert!(leader.raft().term() > term + 1);
    leader.raft().propose_and_commit(plan(9, 0xBB)).await.unwrap();
    leader.raft().propose_and_commit(plan(9, 0xCC)).await.unwrap();
    assert_eq!(leader.applier.plans(9), vec![vec![9, 0xBB], vec![9, 0xCC]]);

    cluster.network.heal(2).await;
    let target = leader.raft().last_log_position();
    wait_until(Duration::from_secs(5), || {
        stale.raft().last_log_position() == target && stale.raft().applied_index() >= target.index
    })
    .await;
    assert_eq!(stale.applier.plans(9), leader.applier.plans(9));
    assert!(!stale.applier.plans(9).contains(&vec![9, 0xAA]));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_higher_term_reply_aborts_proposal() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let leader = cluster.elect(1).await;
    let term = leader.raft().term();
    let before = leader.raft().last_log_position();

    // node 2 moves on while the leader's heartbeats cannot reach it
    cluster.network.isolate(2).await;
    cluster.network.isolate(3).await;
    let heartbeat = HeartbeatRequest {
        group: cluster.config.group.clone(),
        term: term + 5,
        leader: test_node(3),
        commit_log_index: 0,
    };
    cluster.node(2).raft().on_heartbeat(heartbeat).await;
    assert_eq!(cluster.node(2).raft().term(), term + 5);
    cluster.network.heal(2).await;

    let result = leader.raft().propose_and_commit(plan(4, 1)).await;
    assert!(matches!(result, Err(ClientError::LeadershipStale)));
    assert_eq!(leader.raft().role(), Role::Elector);
    assert_eq!(leader.raft().term(), term + 5);
    assert!(leader.raft().leader().is_none());
    assert_eq!(leader.raft().last_log_position(), before);
    assert_eq!(leader.raft().commit_index(), before.index);
    assert!(leader.applier.plans(4).is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_proposals_need_an_active_leader() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let leader = cluster.elect(1).await;

    let follower = cluster.node(2);
    match follower.raft().propose_and_commit(plan(1, 1)).await {
        Err(ClientError::NotLeader(Some(node))) => assert_eq!(node.id, 1),
        other => panic!("unexpected result {:?}", other),
    }

    leader.raft().set_read_only();
    assert!(matches!(
        leader.raft().propose_and_commit(plan(1, 1)).await,
        Err(ClientError::ReadOnly)
    ));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rejected_apply_is_reported_to_proposer() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let leader = cluster.elect(1).await;

    leader.applier.fail_next(ApplyFailure::Rejected);
    let result = leader.raft().propose_and_commit(plan(1, 1)).await;
    assert!(matches!(
        result,
        Err(ClientError::Apply(ApplyError::Rejected(_)))
    ));
    // the entry stays committed and counts as applied
    assert_eq!(leader.raft().applied_index(), leader.raft().commit_index());

    leader.applier.fail_next(ApplyFailure::Duplicate);
    let index = leader.raft().propose_and_commit(plan(1, 2)).await.unwrap();
    assert_eq!(leader.raft().applied_index(), index);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_vote_rules() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let vote = |elector: u64, term: u64, last: LogPosition| VoteRequest {
        group: cluster.config.group.clone(),
        elector: test_node(elector),
        term,
        last_log_index: last.index,
        last_log_term: last.term,
        secondary: None,
    };

    let node2 = cluster.node(2).raft();
    assert_eq!(node2.on_vote_request(vote(1, 0, LogPosition::default())).await, Response::Term(0));
    assert_eq!(node2.on_vote_request(vote(1, 1, LogPosition::default())).await, Response::Agree);
    assert_eq!(node2.role(), Role::Follower);
    assert_eq!(node2.log().hard_state().voted_for.map(|n| n.id), Some(1));
    // the known leader is always agreed with, anyone else finds it online
    assert_eq!(node2.on_vote_request(vote(1, 1, LogPosition::default())).await, Response::Agree);
    assert_eq!(
        node2.on_vote_request(vote(3, 5, LogPosition::default())).await,
        Response::LeaderStillOnline
    );

    let node3 = cluster.node(3).raft();
    let entries: Vec<LogEntry> = (1..=3).map(|i| chained_entry(i, 1, if i == 1 { 0 } else { 1 })).collect();
    node3.log().append(&entries, 0).await.unwrap();
    assert_eq!(
        node3.on_vote_request(vote(1, 2, LogPosition::new(2, 1))).await,
        Response::LogMismatch
    );
    assert_eq!(node3.role(), Role::Elector);
    assert_eq!(
        node3.on_vote_request(vote(1, 2, LogPosition::new(1, 2))).await,
        Response::Agree
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_vote_requires_caught_up_secondary_log() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    let config = TestClusterConfig::new(&[1, 2, 3]);
    let network = MockNetwork::new(config.network.clone());
    let node = test_node(2);
    let log = LogStore::open(LogStoreOptions::with_dir(dir.path().join("raft"))).unwrap();
    let member = RaftMember::new(
        raft_options(&config, dir.path().join("data")),
        node.clone(),
        PartitionGroup::new(config.node_ids.iter().map(|id| test_node(*id)).collect()),
        log,
        network.client(&node),
        Arc::new(MemoryApplier::new()),
        Some(Arc::new(FixedSecondaryLog(LogPosition::new(5, 2)))),
    );
    // eligible by its raft log in every request below
    let vote = |secondary: Option<LogPosition>| VoteRequest {
        group: config.group.clone(),
        elector: test_node(1),
        term: 1,
        last_log_index: 0,
        last_log_term: 0,
        secondary,
    };

    assert_eq!(member.on_vote_request(vote(None)).await, Response::SecondaryLogStale);
    assert_eq!(
        member.on_vote_request(vote(Some(LogPosition::new(4, 2)))).await,
        Response::SecondaryLogStale
    );
    assert_eq!(
        member.on_vote_request(vote(Some(LogPosition::new(9, 1)))).await,
        Response::SecondaryLogStale
    );
    assert_eq!(member.role(), Role::Elector);
    assert_eq!(member.term(), 0);
    assert!(member.log().hard_state().voted_for.is_none());

    assert_eq!(
        member.on_vote_request(vote(Some(LogPosition::new(5, 2)))).await,
        Response::Agree
    );
    assert_eq!(member.role(), Role::Follower);
    assert_eq!(member.term(), 1);
    assert_eq!(member.log().hard_state().voted_for.map(|n| n.id), Some(1));
    member.log().close().await.unwrap();
}

#[tokio::test]
async fn test_append_entry_acceptance() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let follower = cluster.node(2).raft();

    for index in 1..=8 {
        let entry = chained_entry(index, 1, if index == 1 { 0 } else { 1 });
        let reply = follower
            .on_append_entry(append_request(&cluster, 1, 1, &entry))
            .await
            .unwrap();
        assert_eq!(reply.response, Response::Agree);
    }
    assert_eq!(follower.leader().map(|n| n.id), Some(1));

    // a gap is reported with the local tail
    let reply = follower
        .on_append_entry(append_request(&cluster, 1, 1, &chained_entry(11, 1, 1)))
        .await
        .unwrap();
    assert_eq!(reply.response, Response::LogMismatch);
    assert_eq!((reply.last_log_index, reply.last_log_term), (8, 1));

    // a newer leader replaces the uncommitted last entry
    let reply = follower
        .on_append_entry(append_request(&cluster, 3, 2, &chained_entry(8, 2, 1)))
        .await
        .unwrap();
    assert_eq!(reply.response, Response::Agree);
    assert_eq!(follower.last_log_position(), LogPosition::new(8, 2));
    assert_eq!(follower.log().term_at(7).await.unwrap(), 1);

    // stale leaders learn the current term
    let reply = follower
        .on_append_entry(append_request(&cluster, 1, 1, &chained_entry(9, 1, 2)))
        .await
        .unwrap();
    assert_eq!(reply.response, Response::Term(2));

    // once committed the last entry can no longer be replaced
    let heartbeat = HeartbeatRequest {
        group: cluster.config.group.clone(),
        term: 2,
        leader: test_node(3),
        commit_log_index: 8,
    };
    assert_eq!(follower.on_heartbeat(heartbeat).await.response, Response::Agree);
    assert_eq!(follower.commit_index(), 8);
    assert_eq!(cluster.node(2).applier.plans(0).len(), 8);
    let reply = follower
        .on_append_entry(append_request(&cluster, 3, 3, &chained_entry(8, 3, 1)))
        .await
        .unwrap();
    assert_eq!(reply.response, Response::LogMismatch);
    assert_eq!(follower.last_log_position(), LogPosition::new(8, 2));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_commits_only_current_term_logs() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let follower = cluster.node(2).raft();
    let entries: Vec<LogEntry> = (1..=4).map(|i| chained_entry(i, 1, if i == 1 { 0 } else { 1 })).collect();
    follower.log().append(&entries, 0).await.unwrap();

    let heartbeat = |term| HeartbeatRequest {
        group: cluster.config.group.clone(),
        term,
        leader: test_node(1),
        commit_log_index: 4,
    };
    let reply = follower.on_heartbeat(heartbeat(2)).await;
    assert_eq!(reply.response, Response::Agree);
    assert_eq!((reply.last_log_index, reply.last_log_term), (4, 1));
    assert_eq!(follower.commit_index(), 0);

    let reply = follower.on_heartbeat(heartbeat(1)).await;
    assert_eq!(reply.response, Response::Term(2));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_steps_down_on_higher_term() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    let leader = cluster.elect(1).await;
    let term = leader.raft().term();

    let heartbeat = HeartbeatRequest {
        group: cluster.config.group.clone(),
        term: term + 1,
        leader: test_node(2),
        commit_log_index: 0,
    };
    leader.raft().on_heartbeat(heartbeat).await;
    assert_eq!(leader.raft().role(), Role::Follower);
    assert_eq!(leader.raft().term(), term + 1);
    match leader.raft().propose_and_commit(plan(1, 1)).await {
        Err(ClientError::NotLeader(Some(node))) => assert_eq!(node.id, 2),
        other => panic!("unexpected result {:?}", other),
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_sync_with_leader() {
    let _ = tracing_subscriber::fmt::try_init();
    let cluster = TestCluster::new(TestClusterConfig::new(&[1, 2, 3])).await;
    // no leader known yet
    assert!(!cluster.node(2).raft().sync_with_leader().await);

    let leader = cluster.elect(1).await;
    assert!(leader.raft().sync_with_leader().await);
    let index = leader.raft().propose_and_commit(plan(3, 3)).await.unwrap();

    let follower = cluster.node(3);
    assert!(follower.raft().sync_with_leader().await);
    assert!(follower.raft().applied_index() >= index);
    assert_eq!(
        follower.raft().on_request_commit_index().await.unwrap(),
        leader.raft().commit_index()
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_catch_up_after_compaction() {
    let _ = tracing_subscriber::fmt::try_init();
    let config = TestClusterConfig {
        max_segment_size: 200,
        ..TestClusterConfig::new(&[1, 2, 3])
    };
    let cluster = TestCluster::new(config).await;
    let leader = cluster.elect(1).await;
    let lagging = cluster.node(3);
    let start = leader.raft().last_log_position();
    wait_until(Duration::from_secs(2), || lagging.raft().last_log_position() == start).await;

    cluster.network.isolate(3).await;
    for value in 0..12 {
        leader.raft().propose_and_commit(plan(7, value)).await.unwrap();
    }
    let log = leader.raft().log();
    log.flush(true).await.unwrap();
    assert!(log.compact(leader.raft().applied_index()).await.unwrap() > 0);
    assert!(log.first_index() > start.index + 1);

    cluster.network.heal(3).await;
    let target = leader.raft().last_log_position();
    wait_until(Duration::from_secs(5), || {
        lagging.raft().last_log_position() == target && lagging.applier.plans(7).len() == 12
    })
    .await;
    assert_eq!(lagging.applier.plans(7), leader.applier.plans(7));
    assert!(lagging.raft().log().first_index() > 1);
    assert!(lagging.raft().applied_index() >= lagging.raft().log().first_index() - 1);

    // replication continues on top of the installed snapshot
    let index = leader.raft().propose_and_commit(plan(7, 100)).await.unwrap();
    wait_until(Duration::from_secs(3), || lagging.raft().applied_index() >= index).await;
    assert_eq!(lagging.applier.plans(7).len(), 13);
    cluster.shutdown().await;
}
