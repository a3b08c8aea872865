//! Common test utilities for control integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use meridian_control::config::{
    HealthCheckConfig, PromotionConfig, ReplacementConfig, TagSyncConfig,
};
use meridian_control::controllers::{
    ClusterReplacementController, HealthCheckController, HealthCheckFsm, PromotionController,
    ReplacementFsm, TagSyncController, TerminationController,
};
use meridian_control::engine::{ControllerTick, WorkItemSelector};
use meridian_control::item::{ClusterUpgradeEvent, HealthCheck};
use meridian_control::notify::{Notification, Notifier, RecordingSink};
use meridian_control::store::{FleetStore, MemoryStore, WorkItemStore};
use meridian_control::types::{HostId, ItemId};
use meridian_control::{Collaborators, MockFleet};
use meridian_state::MemoryLock;

use fixtures::{cluster, environment, AgentBuilder, HostBuilder, CLUSTER, ENV};

/// A control worker wired to in-memory collaborators.
pub struct TestControl {
    pub store: Arc<MemoryStore>,
    pub fleet: Arc<MockFleet>,
    pub sink: Arc<RecordingSink>,
    pub locks: Arc<MemoryLock>,
    pub ctx: Collaborators,
    pub tick: ControllerTick,
}

impl TestControl {
    /// Creates a worker whose store holds one normal cluster and environment.
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let fleet = Arc::new(MockFleet::new());
        let sink = Arc::new(RecordingSink::new());
        let locks = Arc::new(MemoryLock::new());

        let ctx = Collaborators::new(
            store.clone(),
            locks.clone(),
            fleet.clone(),
            Notifier::new(sink.clone()),
        );
        let tick = ControllerTick::new(locks.clone(), Arc::new(WorkItemSelector::seeded(7)));

        store.insert_cluster(cluster(CLUSTER)).unwrap();
        store
            .insert_environment(environment(ENV, "web", "prod"))
            .unwrap();

        Self {
            store,
            fleet,
            sink,
            locks,
            ctx,
            tick,
        }
    }

    pub fn replacement(&self) -> ClusterReplacementController {
        self.replacement_with(ReplacementConfig::default())
    }

    pub fn replacement_with(&self, config: ReplacementConfig) -> ClusterReplacementController {
        ReplacementFsm::new(self.ctx.clone(), config).into_controller()
    }

    pub fn health_checks(&self) -> HealthCheckController {
        self.health_checks_with(HealthCheckConfig::default())
    }

    pub fn health_checks_with(&self, config: HealthCheckConfig) -> HealthCheckController {
        HealthCheckFsm::new(self.ctx.clone(), config).into_controller()
    }

    pub fn promotion(&self) -> PromotionController {
        PromotionController::new(self.ctx.clone(), PromotionConfig::default())
    }

    pub fn termination(&self) -> TerminationController {
        TerminationController::new(self.ctx.clone())
    }

    pub fn tag_sync(&self) -> TagSyncController {
        TagSyncController::new(self.ctx.clone(), TagSyncConfig::default())
    }

    /// Adds a running host known to both the store and the fleet, with one
    /// agent built by `agent`.
    pub async fn add_host(&self, host: HostBuilder, agent: Option<AgentBuilder>) -> HostId {
        let host = host.build();
        self.fleet.add_host(&host.cluster, &host.id);
        self.store.insert_host(&host).await.unwrap();
        if let Some(agent) = agent {
            self.store.upsert_agent(agent.build()).unwrap();
        }
        host.id
    }

    pub async fn insert_event(&self, event: &ClusterUpgradeEvent) -> ItemId {
        self.store.insert(event).await.unwrap();
        event.header.id.clone()
    }

    pub async fn event(&self, id: &ItemId) -> ClusterUpgradeEvent {
        WorkItemStore::<ClusterUpgradeEvent>::get(self.store.as_ref(), id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn insert_check(&self, check: &HealthCheck) -> ItemId {
        self.store.insert(check).await.unwrap();
        check.header.id.clone()
    }

    pub async fn check(&self, id: &ItemId) -> HealthCheck {
        WorkItemStore::<HealthCheck>::get(self.store.as_ref(), id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Notifications delivered so far, waiting briefly for `count`.
    pub async fn notifications(&self, count: usize) -> Vec<Notification> {
        self.sink.wait_for(count, Duration::from_secs(2)).await
    }
}

impl Default for TestControl {
    fn default() -> Self {
        Self::new()
    }
}
