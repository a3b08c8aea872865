//! Persistent store contracts and backends.
//!
//! The store is split by concern so each controller depends only on what it
//! reads and writes. Both backends implement every trait; [`ControlStore`]
//! bundles them for wiring.
//!
//! Every call is atomic on its own. Callers coordinate multi-call
//! read-modify-write sequences through advisory locks, not transactions.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::agents::AgentRegistry;
use crate::error::ControlResult;
use crate::item::{ClusterUpgradeEvent, HealthCheck, WorkItem};
use crate::types::{
    Build, Cluster, ClusterState, Deploy, DeployConstraint, EnvId, Environment, Host, HostId,
    HostState, HostTag, Image, ItemId, PromoteConfig, PromoteKind, TagSyncState,
};

/// Storage for one kind of work item.
#[async_trait]
pub trait WorkItemStore<T: WorkItem>: Send + Sync {
    /// Insert a new item. Fails if the ID is taken.
    async fn insert(&self, item: &T) -> ControlResult<()>;

    async fn get(&self, id: &ItemId) -> ControlResult<Option<T>>;

    /// IDs of items currently in any of `states`.
    async fn list_ids_in_states(&self, states: &[T::State]) -> ControlResult<Vec<ItemId>>;

    /// Replace the stored item with `item` in full.
    async fn update(&self, item: &T) -> ControlResult<()>;

    /// Most recently created items owned by `owner`, newest first.
    async fn recent_for_owner(&self, owner: &str, limit: usize) -> ControlResult<Vec<T>>;
}

/// Clusters, environments, hosts and images.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn get_cluster(&self, name: &str) -> ControlResult<Option<Cluster>>;

    async fn set_cluster_state(&self, name: &str, state: ClusterState) -> ControlResult<()>;

    async fn set_cluster_image(&self, name: &str, image_id: &str) -> ControlResult<()>;

    async fn get_environment(&self, id: &EnvId) -> ControlResult<Option<Environment>>;

    /// Environment of service `name` at `stage`.
    async fn environment_by_stage(
        &self,
        name: &str,
        stage: &str,
    ) -> ControlResult<Option<Environment>>;

    async fn get_image(&self, id: &str) -> ControlResult<Option<Image>>;

    async fn get_host(&self, id: &HostId) -> ControlResult<Option<Host>>;

    async fn insert_host(&self, host: &Host) -> ControlResult<()>;

    async fn set_host_state(&self, ids: &[HostId], state: HostState) -> ControlResult<()>;

    /// Forget a decommissioned host together with its agents.
    async fn delete_host(&self, id: &HostId) -> ControlResult<()>;

    async fn hosts_in_states(&self, states: &[HostState]) -> ControlResult<Vec<Host>>;

    /// Hosts running an agent for `env_id`.
    async fn env_host_ids(&self, env_id: &EnvId) -> ControlResult<BTreeSet<HostId>>;

    /// Retirable hosts of `cluster` not already leaving.
    async fn retirable_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>>;

    /// Subset of [`Self::retirable_host_ids`] with a failed agent.
    async fn retirable_failed_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>>;

    /// Hosts of `cluster` not already leaving that have a failed agent.
    async fn failed_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>>;

    /// Stop `env_id` agents on `ids` and mark the hosts PENDING_TERMINATE.
    async fn drain_hosts(&self, env_id: &EnvId, ids: &[HostId]) -> ControlResult<()>;
}

/// A deploy to record when promoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeploy {
    pub env_id: EnvId,
    pub build_id: String,
    pub from_deploy: Option<String>,
}

/// Deploys, builds and promotion settings.
#[async_trait]
pub trait DeployStore: Send + Sync {
    async fn get_deploy(&self, id: &str) -> ControlResult<Option<Deploy>>;

    async fn get_build(&self, id: &str) -> ControlResult<Option<Build>>;

    async fn promote_config(&self, env_id: &EnvId) -> ControlResult<Option<PromoteConfig>>;

    async fn auto_promote_env_ids(&self) -> ControlResult<Vec<EnvId>>;

    async fn set_promote_kind(&self, env_id: &EnvId, kind: PromoteKind) -> ControlResult<()>;

    /// Builds named `name` published in `(after, before]`, newest first.
    async fn builds_published_between(
        &self,
        name: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> ControlResult<Vec<Build>>;

    /// Deploys of `env_id` started in `(after, before]`, newest first.
    async fn deploys_started_between(
        &self,
        env_id: &EnvId,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> ControlResult<Vec<Deploy>>;

    /// Record a running deploy and make it the environment's current one.
    async fn create_deploy(&self, deploy: &NewDeploy) -> ControlResult<Deploy>;
}

/// Deploy constraints and mirrored host tags.
#[async_trait]
pub trait TagStore: Send + Sync {
    async fn get_constraint(&self, id: &str) -> ControlResult<Option<DeployConstraint>>;

    async fn constraint_ids_in_states(&self, states: &[TagSyncState]) -> ControlResult<Vec<String>>;

    async fn set_constraint_state(&self, id: &str, state: TagSyncState) -> ControlResult<()>;

    async fn tagged_host_ids(&self, env_id: &EnvId, tag_name: &str)
        -> ControlResult<BTreeSet<HostId>>;

    async fn delete_host_tags(
        &self,
        env_id: &EnvId,
        tag_name: &str,
        ids: &[HostId],
    ) -> ControlResult<()>;

    /// Insert all `tags` in one transaction.
    async fn insert_host_tags(&self, tags: &[HostTag]) -> ControlResult<()>;
}

/// Everything a control worker needs from its store.
pub trait ControlStore:
    FleetStore
    + AgentRegistry
    + DeployStore
    + TagStore
    + WorkItemStore<ClusterUpgradeEvent>
    + WorkItemStore<HealthCheck>
{
}

impl<S> ControlStore for S where
    S: FleetStore
        + AgentRegistry
        + DeployStore
        + TagStore
        + WorkItemStore<ClusterUpgradeEvent>
        + WorkItemStore<HealthCheck>
{
}
