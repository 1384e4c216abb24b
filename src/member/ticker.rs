use std::time::Instant;

use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info};

use super::RaftMember;
use crate::types::Role;

/// Drives heartbeats on the leader and elections everywhere else until shutdown.
pub(super) async fn run(member: RaftMember, mut shutdown: watch::Receiver<bool>) {
    let options = member.options().clone();
    let mut ticker = tokio::time::interval(options.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut election_timeout = options.random_election_timeout();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let (role, since_heartbeat) = {
            let state = member.inner.state.lock();
            (state.role, state.last_heartbeat.elapsed())
        };
        match role {
            Role::Leader => member.send_heartbeats().await,
            Role::Follower if since_heartbeat >= election_timeout => {
                let lost = member.update_state(|state| {
                    if state.role != Role::Follower {
                        return false;
                    }
                    state.role = Role::Elector;
                    state.leader = None;
                    state.last_heartbeat = Instant::now();
                    true
                });
                if lost {
                    info!(
                        "Node {} lost the leader after {:?}, becoming an elector",
                        member.name(),
                        since_heartbeat
                    );
                }
                election_timeout = options.random_election_timeout();
            }
            Role::Elector if since_heartbeat >= election_timeout => {
                if !member.start_election().await {
                    debug!("Node {} will retry the election", member.name());
                }
                election_timeout = options.random_election_timeout();
            }
            _ => {}
        }
    }
    debug!("Ticker of {} stopped", member.name());
}
