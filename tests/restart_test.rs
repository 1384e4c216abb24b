use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tsraft::message::VoteRequest;
use tsraft::mock::{MemoryApplier, MockNetwork, MockNetworkConfig};
use tsraft::{LogStore, LogStoreOptions, PartitionGroup, RaftMember, RaftOptions, Response, Role};

mod common;
use common::test_cluster::{plan, test_node, wait_until};

fn single_node_member(dir: &Path, network: &MockNetwork, applier: Arc<MemoryApplier>) -> RaftMember {
    let node = test_node(1);
    let log = LogStore::open(LogStoreOptions::with_dir(dir.join("raft"))).unwrap();
    RaftMember::new(
        RaftOptions {
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 60_000,
            election_timeout_max_ms: 60_000,
            transfer_root: dir.join("data"),
            ..RaftOptions::with_group("data-group-0")
        },
        node.clone(),
        PartitionGroup::new(vec![node.clone()]),
        log,
        network.client(&node),
        applier,
        None,
    )
}

#[tokio::test]
async fn test_member_state_survives_restart() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    let network = MockNetwork::new(MockNetworkConfig::default());

    let applier = Arc::new(MemoryApplier::new());
    let member = single_node_member(dir.path(), &network, applier.clone());
    member.start().await.unwrap();
    assert!(member.start_election().await);
    let term = member.term();
    wait_until(Duration::from_secs(2), || {
        let last = member.last_log_position();
        last.term == term && member.commit_index() == last.index
    })
    .await;
    let mut last = 0;
    for value in 0..5 {
        last = member.propose_and_commit(plan(2, value)).await.unwrap();
    }
    assert_eq!(applier.plans(2).len(), 5);
    let position = member.last_log_position();
    member.stop().await.unwrap();

    let applier = Arc::new(MemoryApplier::new());
    let member = single_node_member(dir.path(), &network, applier.clone());
    member.start().await.unwrap();
    assert_eq!(member.role(), Role::Elector);
    assert_eq!(member.term(), term);
    assert_eq!(member.log().hard_state().voted_for.map(|n| n.id), Some(1));
    assert_eq!(member.last_log_position(), position);
    assert_eq!(member.commit_index(), last);
    // everything was applied before the restart
    assert_eq!(member.applied_index(), last);
    assert!(applier.applied().is_empty());

    assert!(member.start_election().await);
    assert_eq!(member.term(), term + 1);
    let index = member.propose_and_commit(plan(2, 9)).await.unwrap();
    assert!(index > last);
    assert_eq!(applier.plans(2), vec![vec![2, 9]]);
    member.stop().await.unwrap();
}

#[tokio::test]
async fn test_unapplied_entries_are_applied_on_start() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    let network = MockNetwork::new(MockNetworkConfig::default());

    let log = LogStore::open(LogStoreOptions::with_dir(dir.path().join("raft"))).unwrap();
    let entries: Vec<tsraft::LogEntry> = (1..=3)
        .map(|i| {
            tsraft::LogEntry::new(
                i,
                1,
                tsraft::LogPosition::new(i - 1, if i == 1 { 0 } else { 1 }),
                plan(4, i as u8),
            )
        })
        .collect();
    log.append(&entries, 0).await.unwrap();
    log.commit_to(3).await.unwrap();
    log.close().await.unwrap();

    let applier = Arc::new(MemoryApplier::new());
    let member = single_node_member(dir.path(), &network, applier.clone());
    member.start().await.unwrap();
    assert_eq!(applier.applied(), vec![1, 2, 3]);
    assert_eq!(member.applied_index(), 3);
    member.stop().await.unwrap();
}

#[tokio::test]
async fn test_vote_is_on_disk_when_answered() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    let network = MockNetwork::new(MockNetworkConfig::default());
    let node = test_node(2);
    let log = LogStore::open(LogStoreOptions::with_dir(dir.path().join("raft"))).unwrap();
    let member = RaftMember::new(
        RaftOptions {
            transfer_root: dir.path().join("data"),
            ..RaftOptions::with_group("data-group-0")
        },
        node.clone(),
        PartitionGroup::new(vec![test_node(1), node.clone(), test_node(3)]),
        log,
        network.client(&node),
        Arc::new(MemoryApplier::new()),
        None,
    );

    let request = VoteRequest {
        group: "data-group-0".to_string(),
        elector: test_node(3),
        term: 4,
        last_log_index: 0,
        last_log_term: 0,
        secondary: None,
    };
    assert_eq!(member.on_vote_request(request).await, Response::Agree);

    // a second store sees what the meta file holds right now
    let reader = LogStore::open(LogStoreOptions::with_dir(dir.path().join("raft"))).unwrap();
    assert_eq!(reader.hard_state().current_term, 4);
    assert_eq!(reader.hard_state().voted_for.map(|n| n.id), Some(3));
    reader.close().await.unwrap();
    member.log().close().await.unwrap();
}
