//! Integration tests for image health checks.

mod common;

use chrono::{Duration, Utc};
use common::fixtures::{health_check, AgentBuilder, HostBuilder, CLUSTER};
use common::TestControl;
use meridian_control::controllers::UPDATE_IMAGE_LOCK_PREFIX;
use meridian_control::engine::lock_name;
use meridian_control::item::{HealthCheck, HealthCheckKind, HealthCheckState, ItemStatus};
use meridian_control::store::FleetStore;
use meridian_control::types::{HostId, HostState, Image};
use meridian_state::LockBackend;

fn seed_images(control: &TestControl) {
    let now = Utc::now();
    control
        .store
        .insert_image(Image {
            id: "ami-old".to_owned(),
            publish_date: now - Duration::days(7),
        })
        .unwrap();
    control
        .store
        .insert_image(Image {
            id: "ami-new".to_owned(),
            publish_date: now - Duration::hours(1),
        })
        .unwrap();
}

/// A check already past INIT, probing `host`.
fn probing(state: HealthCheckState, host: &HostId) -> HealthCheck {
    let mut check = health_check("ami-new", HealthCheckKind::AmiTriggered, Duration::zero());
    check.state = state;
    check.header.status = Some(ItemStatus::Succeeded);
    check.host_id = Some(host.clone());
    check.host_launch_time = Some(Utc::now());
    check
}

async fn finished_check(control: &TestControl, status: ItemStatus, ago: Duration) {
    let mut check = health_check("ami-old", HealthCheckKind::TimeTriggered, ago);
    check.state = HealthCheckState::Completed;
    check.header.status = Some(status);
    control.insert_check(&check).await;
}

#[tokio::test]
async fn qualified_image_is_promoted_to_cluster() {
    let control = TestControl::new();
    seed_images(&control);
    control
        .store
        .set_cluster_image(CLUSTER, "ami-old")
        .await
        .unwrap();
    let controller = control.health_checks();
    let id = control
        .insert_check(&health_check("ami-new", HealthCheckKind::AmiTriggered, Duration::zero()))
        .await;

    // INIT launches one probe host from the image under test.
    control.tick.run(&controller).await;
    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Launching);
    assert_eq!(check.header.status, Some(ItemStatus::Succeeded));
    let launches = control.fleet.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].count, 1);
    assert_eq!(launches[0].image.as_deref(), Some("ami-new"));
    let probe = check.host_id.clone().unwrap();
    assert!(check.host_launch_time.is_some());

    // Still provisioning within the grace period.
    control.tick.run(&controller).await;
    assert_eq!(control.check(&id).await.state, HealthCheckState::Launching);

    control
        .store
        .set_host_state(&[probe.clone()], HostState::Running)
        .await
        .unwrap();
    control.tick.run(&controller).await;
    assert_eq!(control.check(&id).await.state, HealthCheckState::PendingVerify);

    // No agents yet.
    control.tick.run(&controller).await;
    assert_eq!(control.check(&id).await.state, HealthCheckState::PendingVerify);

    let started = Utc::now() - Duration::minutes(4);
    let completed = Utc::now() - Duration::minutes(1);
    control
        .store
        .upsert_agent(
            AgentBuilder::for_host(&probe)
                .deployed_between(started, completed)
                .build(),
        )
        .unwrap();
    control.tick.run(&controller).await;
    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Completing);
    assert_eq!(check.header.status, Some(ItemStatus::Qualified));
    assert_eq!(check.deploy_start_time, Some(started));
    assert_eq!(check.deploy_complete_time, Some(completed));

    control.tick.run(&controller).await;
    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Completed);
    assert_eq!(check.header.status, Some(ItemStatus::Qualified));
    assert!(check.host_terminated);

    let cluster = control.store.get_cluster(CLUSTER).await.unwrap().unwrap();
    assert_eq!(cluster.image_id.as_deref(), Some("ami-new"));
    assert_eq!(control.fleet.terminated_ids(), vec![probe]);
    assert!(control.sink.sent().is_empty());
}

#[tokio::test]
async fn time_triggered_check_keeps_cluster_image() {
    let control = TestControl::new();
    seed_images(&control);
    control
        .store
        .set_cluster_image(CLUSTER, "ami-old")
        .await
        .unwrap();
    let host = HostId::new("i-probe");
    control.fleet.add_host(CLUSTER, &host);

    let mut check = probing(HealthCheckState::Completing, &host);
    check.kind = HealthCheckKind::TimeTriggered;
    check.header.status = Some(ItemStatus::Qualified);
    let id = control.insert_check(&check).await;

    control.tick.run(&control.health_checks()).await;

    assert_eq!(control.check(&id).await.state, HealthCheckState::Completed);
    let cluster = control.store.get_cluster(CLUSTER).await.unwrap().unwrap();
    assert_eq!(cluster.image_id.as_deref(), Some("ami-old"));
}

#[tokio::test]
async fn older_image_does_not_replace_newer_one() {
    let control = TestControl::new();
    seed_images(&control);
    control
        .store
        .set_cluster_image(CLUSTER, "ami-new")
        .await
        .unwrap();
    let host = HostId::new("i-probe");
    control.fleet.add_host(CLUSTER, &host);

    let mut check = probing(HealthCheckState::Completing, &host);
    check.image_id = "ami-old".to_owned();
    check.header.status = Some(ItemStatus::Qualified);
    let id = control.insert_check(&check).await;

    control.tick.run(&control.health_checks()).await;

    assert_eq!(control.check(&id).await.state, HealthCheckState::Completed);
    let cluster = control.store.get_cluster(CLUSTER).await.unwrap().unwrap();
    assert_eq!(cluster.image_id.as_deref(), Some("ami-new"));
}

#[tokio::test]
async fn busy_image_lock_delays_completion() {
    let control = TestControl::new();
    seed_images(&control);
    let host = HostId::new("i-probe");
    control.fleet.add_host(CLUSTER, &host);

    let mut check = probing(HealthCheckState::Completing, &host);
    check.header.status = Some(ItemStatus::Qualified);
    let id = control.insert_check(&check).await;

    let guard = control
        .locks
        .try_acquire(&lock_name(UPDATE_IMAGE_LOCK_PREFIX, CLUSTER))
        .await
        .unwrap()
        .unwrap();

    control.tick.run(&control.health_checks()).await;
    let stored = control.check(&id).await;
    assert_eq!(stored.state, HealthCheckState::Completing);
    assert!(!stored.host_terminated);

    guard.release().await.unwrap();
    control.tick.run(&control.health_checks()).await;
    assert_eq!(control.check(&id).await.state, HealthCheckState::Completed);
    let cluster = control.store.get_cluster(CLUSTER).await.unwrap().unwrap();
    assert_eq!(cluster.image_id.as_deref(), Some("ami-new"));
}

#[tokio::test]
async fn launch_failure_completes_check_and_emails() {
    let control = TestControl::new();
    control.fleet.fail_launches(true);
    let id = control
        .insert_check(&health_check("ami-new", HealthCheckKind::AmiTriggered, Duration::zero()))
        .await;

    control.tick.run(&control.health_checks()).await;

    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Completed);
    assert_eq!(check.header.status, Some(ItemStatus::Failed));
    assert!(check.header.error_message.is_some());

    let sent = control.notifications(1).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("Launch Host Failed"));
    assert_eq!(sent[0].recipients, vec!["team@example.com".to_owned()]);
}

#[tokio::test]
async fn unresponsive_probe_host_fails_after_grace_period() {
    let control = TestControl::new();
    let host = HostId::new("i-probe");
    control.fleet.add_host(CLUSTER, &host);
    control
        .store
        .insert_host(
            &HostBuilder::new("i-probe")
                .with_state(HostState::Provisioned)
                .build(),
        )
        .await
        .unwrap();

    let mut check = probing(HealthCheckState::Launching, &host);
    check.host_launch_time = Some(Utc::now() - Duration::minutes(11));
    let id = control.insert_check(&check).await;

    control.tick.run(&control.health_checks()).await;

    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Completing);
    assert_eq!(check.header.status, Some(ItemStatus::Failed));

    // COMPLETING cleans up the probe host without touching the image.
    control.tick.run(&control.health_checks()).await;
    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Completed);
    assert_eq!(check.header.status, Some(ItemStatus::Failed));
    assert!(check.host_terminated);
    assert!(control.fleet.is_terminated(&host));
    let cluster = control.store.get_cluster(CLUSTER).await.unwrap().unwrap();
    assert!(cluster.image_id.is_none());
}

#[tokio::test]
async fn failed_deploy_script_fails_check() {
    let control = TestControl::new();
    let host = HostId::new("i-probe");
    control.fleet.add_host(CLUSTER, &host);
    control
        .store
        .upsert_agent(AgentBuilder::for_host(&host).failed().build())
        .unwrap();
    let id = control
        .insert_check(&probing(HealthCheckState::PendingVerify, &host))
        .await;

    control.tick.run(&control.health_checks()).await;

    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Completing);
    assert_eq!(check.header.status, Some(ItemStatus::Failed));
    let sent = control.notifications(1).await;
    assert!(sent[0].subject.contains("Deploy/Health Check Script Failed"));
}

#[tokio::test]
async fn repeated_failures_page_oncall() {
    let control = TestControl::new();
    finished_check(&control, ItemStatus::Failed, Duration::hours(2)).await;
    finished_check(&control, ItemStatus::Timeout, Duration::hours(1)).await;
    control.fleet.fail_launches(true);
    control
        .insert_check(&health_check("ami-new", HealthCheckKind::AmiTriggered, Duration::zero()))
        .await;

    control.tick.run(&control.health_checks()).await;

    let sent = control.notifications(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipients, vec!["oncall@example.com".to_owned()]);
    assert!(sent[0].message.starts_with("Health check is failing for 3 times."));
}

#[tokio::test]
async fn recent_success_keeps_alerts_on_email() {
    let control = TestControl::new();
    finished_check(&control, ItemStatus::Qualified, Duration::hours(2)).await;
    finished_check(&control, ItemStatus::Failed, Duration::hours(1)).await;
    control.fleet.fail_launches(true);
    control
        .insert_check(&health_check("ami-new", HealthCheckKind::AmiTriggered, Duration::zero()))
        .await;

    control.tick.run(&control.health_checks()).await;

    let sent = control.notifications(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipients, vec!["team@example.com".to_owned()]);
}

#[tokio::test]
async fn timeout_is_measured_from_state_start() {
    let control = TestControl::new();
    let host = HostId::new("i-probe");
    control.fleet.add_host(CLUSTER, &host);

    let mut check = probing(HealthCheckState::PendingVerify, &host);
    check.header.state_start_time = Utc::now() - Duration::minutes(31);
    check.header.last_worked_on = Utc::now();
    let id = control.insert_check(&check).await;

    control.tick.run(&control.health_checks()).await;

    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Completing);
    assert_eq!(check.header.status, Some(ItemStatus::Timeout));
    assert_eq!(
        check.header.error_message.as_deref(),
        Some("Health check timeout at state PENDING_VERIFY")
    );
    let sent = control.notifications(1).await;
    assert!(sent[0].subject.contains("Health Check Timeout"));
}

#[tokio::test]
async fn timeout_in_completing_still_terminates_probe_host() {
    let control = TestControl::new();
    seed_images(&control);
    let host = control
        .add_host(HostBuilder::new("i-probe"), Some(AgentBuilder::new("i-probe")))
        .await;

    let mut check = probing(HealthCheckState::Completing, &host);
    check.header.status = Some(ItemStatus::Qualified);
    check.header.state_start_time = Utc::now() - Duration::minutes(31);
    let id = control.insert_check(&check).await;

    // The image lock never frees up, so COMPLETING cannot finish on its own.
    let _guard = control
        .locks
        .try_acquire(&lock_name(UPDATE_IMAGE_LOCK_PREFIX, CLUSTER))
        .await
        .unwrap()
        .unwrap();

    control.tick.run(&control.health_checks()).await;
    control.tick.run(&control.health_checks()).await;

    let check = control.check(&id).await;
    assert_eq!(check.state, HealthCheckState::Completed);
    assert_eq!(check.header.status, Some(ItemStatus::Timeout));
    assert!(check.host_terminated);
    assert!(control.fleet.is_terminated(&host));
    assert_eq!(control.fleet.terminated_ids(), vec![host.clone()]);
    let stored = control.store.get_host(&host).await.unwrap().unwrap();
    assert_eq!(stored.state, HostState::Terminating);

    let sent = control.notifications(1).await;
    assert!(sent[0].subject.contains("Health Check Timeout"));
}
