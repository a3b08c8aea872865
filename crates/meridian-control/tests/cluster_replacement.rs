//! Integration tests for rolling cluster replacement.

mod common;

use chrono::{Duration, Utc};
use common::fixtures::{AgentBuilder, EventBuilder, HostBuilder, CLUSTER};
use common::TestControl;
use meridian_control::config::ReplacementConfig;
use meridian_control::engine::{lock_name, Advance, TickReport};
use meridian_control::item::{ItemStatus, UpgradeState};
use meridian_control::store::FleetStore;
use meridian_control::types::{AgentState, ClusterState, HostId, HostState};
use meridian_state::LockBackend;

#[tokio::test]
async fn init_launches_parallelism_target() {
    let control = TestControl::new();
    let id = control.insert_event(&EventBuilder::new().build()).await;

    let report = control.tick.run(&control.replacement()).await;
    assert_eq!(report.processed, 1);

    let event = control.event(&id).await;
    assert_eq!(event.host_ids.len(), 3);
    assert_eq!(event.state, UpgradeState::Launching);
    assert_eq!(event.header.status, Some(ItemStatus::Succeeded));

    let launches = control.fleet.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].count, 3);
    assert!(launches[0].image.is_none());
}

#[tokio::test]
async fn launch_failure_alerts_and_stays_in_init() {
    let control = TestControl::new();
    control.fleet.fail_launches(true);
    let id = control.insert_event(&EventBuilder::new().build()).await;
    let before = control.event(&id).await;

    let report = control.tick.run(&control.replacement()).await;
    assert_eq!(report.failed, 1);

    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Init);
    assert!(event.host_ids.is_empty());
    assert_eq!(event.header.last_worked_on, before.header.last_worked_on);

    let sent = control.notifications(1).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("Launch failure"));
    assert_eq!(sent[0].room.as_deref(), Some("#web-deploys"));
}

fn batched(launch_batch: usize) -> ReplacementConfig {
    ReplacementConfig {
        launch_batch,
        ..ReplacementConfig::default()
    }
}

fn launch_counts(control: &TestControl) -> Vec<usize> {
    control.fleet.launches().iter().map(|call| call.count).collect()
}

#[tokio::test]
async fn init_launches_in_batches() {
    let control = TestControl::new();
    let id = control.insert_event(&EventBuilder::new().build()).await;

    control.tick.run(&control.replacement_with(batched(2))).await;

    assert_eq!(launch_counts(&control), vec![2, 1]);
    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Launching);
    assert_eq!(event.host_ids.len(), 3);
}

#[tokio::test]
async fn partial_launch_keeps_hosts_and_retries_in_init() {
    let control = TestControl::new();
    control.fleet.set_launch_capacity(Some(2));
    let id = control
        .insert_event(&EventBuilder::new().idle_for(Duration::minutes(5)).build())
        .await;
    let before = control.event(&id).await;
    let controller = control.replacement_with(batched(1));

    let report = control.tick.run(&controller).await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(launch_counts(&control), vec![1, 1, 0]);

    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Init);
    assert_eq!(event.host_ids.len(), 2);
    assert!(event.header.last_worked_on > before.header.last_worked_on);
    assert_eq!(event.header.state_start_time, before.header.state_start_time);
    let sent = control.notifications(1).await;
    assert!(sent[0].subject.contains("Launch failure"));

    // Capacity is back; only the missing host is requested.
    control.fleet.set_launch_capacity(None);
    control.tick.run(&controller).await;

    assert_eq!(launch_counts(&control), vec![1, 1, 0, 1]);
    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Launching);
    assert_eq!(event.host_ids.len(), 3);
}

#[tokio::test]
async fn reentered_init_launches_only_the_difference() {
    let control = TestControl::new();
    let a = control.add_host(HostBuilder::new("i-1"), None).await;
    let b = control.add_host(HostBuilder::new("i-2"), None).await;
    let id = control
        .insert_event(&EventBuilder::new().tracking(&[&a, &b]).build())
        .await;

    control.tick.run(&control.replacement()).await;

    assert_eq!(launch_counts(&control), vec![1]);
    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Launching);
    assert_eq!(event.host_ids.len(), 3);
    assert!(event.host_ids.contains(&a));
    assert!(event.host_ids.contains(&b));
}

#[tokio::test]
async fn launching_drops_terminated_host_and_returns_to_init() {
    let control = TestControl::new();
    let mut hosts = Vec::new();
    for name in ["i-t1", "i-t2", "i-t3"] {
        hosts.push(
            control
                .add_host(
                    HostBuilder::new(name),
                    Some(AgentBuilder::new(name).deploying()),
                )
                .await,
        );
    }
    let tracked: Vec<&HostId> = hosts.iter().collect();
    let id = control
        .insert_event(
            &EventBuilder::new()
                .in_state(UpgradeState::Launching)
                .tracking(&tracked)
                .build(),
        )
        .await;

    control.fleet.mark_terminated(&hosts[0]);
    control.tick.run(&control.replacement()).await;

    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Init);
    assert_eq!(event.header.status, Some(ItemStatus::Succeeded));
    assert_eq!(event.host_ids.len(), 2);
    assert!(!event.host_ids.contains(&hosts[0]));

    let terminations = control.fleet.terminations();
    assert_eq!(terminations.len(), 1);
    assert_eq!(terminations[0].ids, vec![hosts[0].clone()]);
}

#[tokio::test]
async fn launching_waits_for_every_host_to_serve() {
    let control = TestControl::new();
    let ready = control
        .add_host(HostBuilder::new("i-t1"), Some(AgentBuilder::new("i-t1")))
        .await;
    let slow = control
        .add_host(
            HostBuilder::new("i-t2"),
            Some(AgentBuilder::new("i-t2").deploying()),
        )
        .await;
    let id = control
        .insert_event(
            &EventBuilder::new()
                .in_state(UpgradeState::Launching)
                .tracking(&[&ready, &slow])
                .build(),
        )
        .await;

    control.tick.run(&control.replacement()).await;
    assert_eq!(control.event(&id).await.state, UpgradeState::Launching);

    control
        .store
        .upsert_agent(AgentBuilder::new("i-t2").build())
        .unwrap();
    control.tick.run(&control.replacement()).await;
    assert_eq!(control.event(&id).await.state, UpgradeState::Replacing);
}

#[tokio::test]
async fn replacing_drains_failed_hosts_within_budget() {
    let control = TestControl::new();

    // Five retirable pool hosts, two of them with failed deploys.
    let mut failed = Vec::new();
    for name in ["i-r1", "i-r2"] {
        failed.push(
            control
                .add_host(
                    HostBuilder::new(name).retirable(),
                    Some(AgentBuilder::new(name).failed()),
                )
                .await,
        );
    }
    let mut healthy = Vec::new();
    for name in ["i-r3", "i-r4", "i-r5"] {
        healthy.push(
            control
                .add_host(HostBuilder::new(name).retirable(), Some(AgentBuilder::new(name)))
                .await,
        );
    }
    // Seven more serving hosts bring serving capacity to ten.
    for n in 1..=7 {
        let name = format!("i-p{n}");
        control
            .add_host(HostBuilder::new(&name), Some(AgentBuilder::new(&name)))
            .await;
    }
    control.fleet.set_pool_size(CLUSTER, 9);

    let id = control
        .insert_event(&EventBuilder::new().in_state(UpgradeState::Replacing).build())
        .await;

    control.tick.run(&control.replacement()).await;

    assert_eq!(control.event(&id).await.state, UpgradeState::Replacing);

    let mut drained = 0;
    for host in &failed {
        let host = control.store.get_host(host).await.unwrap().unwrap();
        if host.state == HostState::PendingTerminate {
            drained += 1;
        }
    }
    assert_eq!(drained, 1);

    for host in &healthy {
        let host = control.store.get_host(host).await.unwrap().unwrap();
        assert_eq!(host.state, HostState::Running);
    }
}

#[tokio::test]
async fn replacing_holds_without_spare_capacity() {
    let control = TestControl::new();
    let host = control
        .add_host(HostBuilder::new("i-r1").retirable(), Some(AgentBuilder::new("i-r1")))
        .await;
    control.fleet.set_pool_size(CLUSTER, 1);

    let id = control
        .insert_event(&EventBuilder::new().in_state(UpgradeState::Replacing).build())
        .await;
    control.tick.run(&control.replacement()).await;

    assert_eq!(control.event(&id).await.state, UpgradeState::Replacing);
    let host = control.store.get_host(&host).await.unwrap().unwrap();
    assert_eq!(host.state, HostState::Running);
    let agents = control.store.agents_on(&host.id).unwrap();
    assert_eq!(agents[0].state, AgentState::Normal);
}

#[tokio::test]
async fn replacing_without_retirable_hosts_moves_to_completing() {
    let control = TestControl::new();
    let id = control
        .insert_event(&EventBuilder::new().in_state(UpgradeState::Replacing).build())
        .await;

    control.tick.run(&control.replacement()).await;

    assert_eq!(control.event(&id).await.state, UpgradeState::Completing);
}

#[tokio::test]
async fn completing_without_temporary_hosts_restores_cluster() {
    let control = TestControl::new();
    control.fleet.set_pool_size(CLUSTER, 4);
    let id = control
        .insert_event(&EventBuilder::new().in_state(UpgradeState::Completing).build())
        .await;

    control.tick.run(&control.replacement()).await;

    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Completed);
    assert_eq!(event.header.status, Some(ItemStatus::Succeeded));
    let cluster = control.store.get_cluster(CLUSTER).await.unwrap().unwrap();
    assert_eq!(cluster.state, ClusterState::Normal);
    assert!(control.fleet.terminations().is_empty());
}

#[tokio::test]
async fn completing_swaps_healthy_temporary_hosts_for_failed_pool_hosts() {
    let control = TestControl::new();
    let healthy_temp = control
        .add_host(HostBuilder::new("i-t1"), Some(AgentBuilder::new("i-t1")))
        .await;
    let failed_temp = control
        .add_host(HostBuilder::new("i-t2"), Some(AgentBuilder::new("i-t2").failed()))
        .await;
    let failed_pool = control
        .add_host(HostBuilder::new("i-p1"), Some(AgentBuilder::new("i-p1").failed()))
        .await;
    for name in ["i-p2", "i-p3"] {
        control
            .add_host(HostBuilder::new(name), Some(AgentBuilder::new(name)))
            .await;
    }
    control.fleet.set_pool_size(CLUSTER, 2);

    let id = control
        .insert_event(
            &EventBuilder::new()
                .in_state(UpgradeState::Completing)
                .tracking(&[&healthy_temp, &failed_temp])
                .build(),
        )
        .await;

    control.tick.run(&control.replacement()).await;

    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Completed);
    assert!(event.host_ids.is_empty());

    assert_eq!(
        control.fleet.attachments(),
        vec![(CLUSTER.to_owned(), vec![healthy_temp.clone()])]
    );
    let terminated = control.fleet.terminated_ids();
    assert!(terminated.contains(&failed_temp));
    assert!(terminated.contains(&failed_pool));
    assert!(!terminated.contains(&healthy_temp));

    // The failed temporary host is cleaned up as a temporary host only.
    let failed_temp_calls = control
        .fleet
        .terminations()
        .into_iter()
        .filter(|call| call.ids.contains(&failed_temp))
        .count();
    assert_eq!(failed_temp_calls, 1);
}

#[tokio::test]
async fn timeout_forces_completing_without_running_state_logic() {
    let control = TestControl::new();
    let retirable = control
        .add_host(HostBuilder::new("i-r1").retirable(), Some(AgentBuilder::new("i-r1")))
        .await;
    for name in ["i-p1", "i-p2"] {
        control
            .add_host(HostBuilder::new(name), Some(AgentBuilder::new(name)))
            .await;
    }
    control.fleet.set_pool_size(CLUSTER, 1);

    let id = control
        .insert_event(
            &EventBuilder::new()
                .in_state(UpgradeState::Replacing)
                .idle_for(Duration::minutes(31))
                .build(),
        )
        .await;

    control.tick.run(&control.replacement()).await;

    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Completing);
    assert_eq!(event.header.status, Some(ItemStatus::Timeout));
    assert_eq!(
        event.header.error_message.as_deref(),
        Some("Cluster upgrade event timeout at state REPLACING")
    );

    let host = control.store.get_host(&retirable).await.unwrap().unwrap();
    assert_eq!(host.state, HostState::Running);

    let sent = control.notifications(1).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("Timeout"));
}

#[tokio::test]
async fn paused_cluster_only_refreshes_heartbeat() {
    let control = TestControl::new();
    control
        .store
        .set_cluster_state(CLUSTER, ClusterState::Pause)
        .await
        .unwrap();
    let id = control
        .insert_event(&EventBuilder::new().idle_for(Duration::minutes(5)).build())
        .await;
    let before = control.event(&id).await;

    let report = control.tick.run(&control.replacement()).await;
    assert_eq!(report.processed, 1);

    let event = control.event(&id).await;
    assert_eq!(event.state, UpgradeState::Init);
    assert_eq!(event.header.state_start_time, before.header.state_start_time);
    assert!(event.header.last_worked_on > before.header.last_worked_on);
    assert!(control.fleet.launches().is_empty());
}

#[tokio::test]
async fn paused_cluster_never_times_out() {
    let control = TestControl::new();
    control
        .store
        .set_cluster_state(CLUSTER, ClusterState::Pause)
        .await
        .unwrap();
    let id = control
        .insert_event(
            &EventBuilder::new()
                .in_state(UpgradeState::Replacing)
                .idle_for(Duration::hours(2))
                .build(),
        )
        .await;

    let outcome = control.replacement().advance(&id, Utc::now()).await.unwrap();

    assert_eq!(outcome, Advance::Paused);
    assert_eq!(control.event(&id).await.state, UpgradeState::Replacing);
}

#[tokio::test]
async fn contended_lock_skips_event() {
    let control = TestControl::new();
    let id = control.insert_event(&EventBuilder::new().build()).await;

    let guard = control
        .locks
        .try_acquire(&lock_name("CLUSTERREPLACER", &id))
        .await
        .unwrap()
        .unwrap();

    let report = control.tick.run(&control.replacement()).await;
    assert_eq!(
        report,
        TickReport {
            candidates: 1,
            processed: 0,
            contended: 1,
            failed: 0,
        }
    );
    assert_eq!(control.event(&id).await.state, UpgradeState::Init);
    assert!(control.fleet.launches().is_empty());

    guard.release().await.unwrap();
    let report = control.tick.run(&control.replacement()).await;
    assert_eq!(report.processed, 1);
    assert_eq!(control.event(&id).await.state, UpgradeState::Launching);
}

#[tokio::test]
async fn completed_events_are_left_alone() {
    let control = TestControl::new();
    let id = control
        .insert_event(&EventBuilder::new().in_state(UpgradeState::Completed).build())
        .await;

    let report = control.tick.run(&control.replacement()).await;
    assert_eq!(report.candidates, 0);

    let outcome = control.replacement().advance(&id, Utc::now()).await.unwrap();
    assert_eq!(outcome, Advance::Skipped);
    assert_eq!(control.event(&id).await.state, UpgradeState::Completed);
}

#[tokio::test]
async fn missing_environment_leaves_event_untouched() {
    let control = TestControl::new();
    let mut event = EventBuilder::new().build();
    event.env_id = meridian_control::types::EnvId::new("env-missing");
    let id = control.insert_event(&event).await;

    let report = control.tick.run(&control.replacement()).await;

    assert_eq!(report.failed, 1);
    let stored = control.event(&id).await;
    assert_eq!(stored.state, UpgradeState::Init);
    assert_eq!(stored.header.last_worked_on, event.header.last_worked_on);
}
