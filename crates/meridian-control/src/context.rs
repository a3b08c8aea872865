//! Collaborators shared by every controller.

use std::sync::Arc;

use meridian_state::LockBackend;

use crate::agents::AgentRegistry;
use crate::fleet::CloudFleetApi;
use crate::item::{ClusterUpgradeEvent, HealthCheck};
use crate::notify::Notifier;
use crate::store::{ControlStore, DeployStore, FleetStore, TagStore, WorkItemStore};

/// Handles to the outside world, cheap to clone into each controller.
#[derive(Clone)]
pub struct Collaborators {
    pub inventory: Arc<dyn FleetStore>,
    pub agents: Arc<dyn AgentRegistry>,
    pub deploys: Arc<dyn DeployStore>,
    pub tags: Arc<dyn TagStore>,
    pub upgrades: Arc<dyn WorkItemStore<ClusterUpgradeEvent>>,
    pub health_checks: Arc<dyn WorkItemStore<HealthCheck>>,
    pub locks: Arc<dyn LockBackend>,
    pub fleet: Arc<dyn CloudFleetApi>,
    pub notifier: Notifier,
}

impl Collaborators {
    /// Wire every store role to `store`.
    pub fn new<S: ControlStore + 'static>(
        store: Arc<S>,
        locks: Arc<dyn LockBackend>,
        fleet: Arc<dyn CloudFleetApi>,
        notifier: Notifier,
    ) -> Self {
        Self {
            inventory: store.clone(),
            agents: store.clone(),
            deploys: store.clone(),
            tags: store.clone(),
            upgrades: store.clone(),
            health_checks: store,
            locks,
            fleet,
            notifier,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
