//! In-memory store for tests and single-process deployments.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::agents::AgentRegistry;
use crate::error::{ControlError, ControlResult};
use crate::item::{ClusterUpgradeEvent, HealthCheck, WorkItem};
use crate::types::{
    AcceptanceStatus, Agent, AgentState, Build, Cluster, ClusterState, Deploy, DeployConstraint,
    DeployState, EnvId, Environment, Host, HostId, HostState, HostTag, Image, ItemId,
    PromoteConfig, PromoteKind, TagSyncState,
};

use super::{DeployStore, FleetStore, NewDeploy, TagStore, WorkItemStore};

#[derive(Debug, Default)]
pub struct Tables {
    events: HashMap<ItemId, ClusterUpgradeEvent>,
    health_checks: HashMap<ItemId, HealthCheck>,
    clusters: HashMap<String, Cluster>,
    environments: HashMap<EnvId, Environment>,
    images: HashMap<String, Image>,
    hosts: HashMap<HostId, Host>,
    agents: HashMap<(HostId, EnvId), Agent>,
    deploys: HashMap<String, Deploy>,
    builds: HashMap<String, Build>,
    promote_configs: HashMap<EnvId, PromoteConfig>,
    constraints: HashMap<String, DeployConstraint>,
    host_tags: Vec<HostTag>,
}

impl Tables {
    fn host_has_failed_agent(&self, id: &HostId) -> bool {
        self.agents
            .values()
            .any(|agent| &agent.host_id == id && agent.is_failed())
    }

    fn cluster_hosts<'a>(&'a self, cluster: &'a str) -> impl Iterator<Item = &'a Host> + 'a {
        self.hosts
            .values()
            .filter(move |host| host.cluster == cluster && !host.state.is_leaving())
    }
}

/// Work item kinds with a table in [`MemoryStore`].
pub trait MemoryTable: WorkItem {
    fn table(tables: &Tables) -> &HashMap<ItemId, Self>;

    fn table_mut(tables: &mut Tables) -> &mut HashMap<ItemId, Self>;
}

impl MemoryTable for ClusterUpgradeEvent {
    fn table(tables: &Tables) -> &HashMap<ItemId, Self> {
        &tables.events
    }

    fn table_mut(tables: &mut Tables) -> &mut HashMap<ItemId, Self> {
        &mut tables.events
    }
}

impl MemoryTable for HealthCheck {
    fn table(tables: &Tables) -> &HashMap<ItemId, Self> {
        &tables.health_checks
    }

    fn table_mut(tables: &mut Tables) -> &mut HashMap<ItemId, Self> {
        &mut tables.health_checks
    }
}

/// In-memory store.
///
/// Data is lost when the process exits. The seeding methods stand in for the
/// request layer and agent heartbeat ingestion that populate a real store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ControlResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    pub fn insert_cluster(&self, cluster: Cluster) -> ControlResult<()> {
        self.write()?.clusters.insert(cluster.name.clone(), cluster);
        Ok(())
    }

    pub fn insert_environment(&self, env: Environment) -> ControlResult<()> {
        self.write()?.environments.insert(env.id.clone(), env);
        Ok(())
    }

    pub fn insert_image(&self, image: Image) -> ControlResult<()> {
        self.write()?.images.insert(image.id.clone(), image);
        Ok(())
    }

    /// Record an agent heartbeat, replacing the previous report.
    pub fn upsert_agent(&self, agent: Agent) -> ControlResult<()> {
        self.write()?
            .agents
            .insert((agent.host_id.clone(), agent.env_id.clone()), agent);
        Ok(())
    }

    pub fn insert_deploy(&self, deploy: Deploy) -> ControlResult<()> {
        self.write()?.deploys.insert(deploy.id.clone(), deploy);
        Ok(())
    }

    pub fn insert_build(&self, build: Build) -> ControlResult<()> {
        self.write()?.builds.insert(build.id.clone(), build);
        Ok(())
    }

    pub fn insert_promote_config(&self, config: PromoteConfig) -> ControlResult<()> {
        self.write()?
            .promote_configs
            .insert(config.env_id.clone(), config);
        Ok(())
    }

    pub fn insert_constraint(&self, constraint: DeployConstraint) -> ControlResult<()> {
        self.write()?
            .constraints
            .insert(constraint.id.clone(), constraint);
        Ok(())
    }

    /// Snapshot of the agents on `host`.
    pub fn agents_on(&self, host: &HostId) -> ControlResult<Vec<Agent>> {
        let tables = self.read()?;
        Ok(tables
            .agents
            .values()
            .filter(|agent| &agent.host_id == host)
            .cloned()
            .collect())
    }

    /// Snapshot of every mirrored host tag.
    pub fn host_tags(&self) -> ControlResult<Vec<HostTag>> {
        Ok(self.read()?.host_tags.clone())
    }
}

#[async_trait]
impl<T: MemoryTable> WorkItemStore<T> for MemoryStore {
    async fn insert(&self, item: &T) -> ControlResult<()> {
        let mut tables = self.write()?;
        let table = T::table_mut(&mut tables);
        if table.contains_key(item.id()) {
            return Err(ControlError::internal(format!(
                "{} {} already exists",
                T::KIND,
                item.id()
            )));
        }
        table.insert(item.id().clone(), item.clone());
        Ok(())
    }

    async fn get(&self, id: &ItemId) -> ControlResult<Option<T>> {
        let tables = self.read()?;
        Ok(T::table(&tables).get(id).cloned())
    }

    async fn list_ids_in_states(&self, states: &[T::State]) -> ControlResult<Vec<ItemId>> {
        let tables = self.read()?;
        let mut ids: Vec<ItemId> = T::table(&tables)
            .values()
            .filter(|item| states.contains(&item.state()))
            .map(|item| item.id().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn update(&self, item: &T) -> ControlResult<()> {
        let mut tables = self.write()?;
        match T::table_mut(&mut tables).get_mut(item.id()) {
            Some(stored) => {
                *stored = item.clone();
                Ok(())
            }
            None => Err(ControlError::not_found(T::KIND, item.id())),
        }
    }

    async fn recent_for_owner(&self, owner: &str, limit: usize) -> ControlResult<Vec<T>> {
        let tables = self.read()?;
        let mut items: Vec<T> = T::table(&tables)
            .values()
            .filter(|item| item.owner() == owner)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.header().created_at.cmp(&a.header().created_at));
        items.truncate(limit);
        Ok(items)
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn get_cluster(&self, name: &str) -> ControlResult<Option<Cluster>> {
        Ok(self.read()?.clusters.get(name).cloned())
    }

    async fn set_cluster_state(&self, name: &str, state: ClusterState) -> ControlResult<()> {
        let mut tables = self.write()?;
        let cluster = tables
            .clusters
            .get_mut(name)
            .ok_or_else(|| ControlError::not_found("cluster", name))?;
        cluster.state = state;
        cluster.last_update = Utc::now();
        Ok(())
    }

    async fn set_cluster_image(&self, name: &str, image_id: &str) -> ControlResult<()> {
        let mut tables = self.write()?;
        let cluster = tables
            .clusters
            .get_mut(name)
            .ok_or_else(|| ControlError::not_found("cluster", name))?;
        cluster.image_id = Some(image_id.to_owned());
        cluster.last_update = Utc::now();
        Ok(())
    }

    async fn get_environment(&self, id: &EnvId) -> ControlResult<Option<Environment>> {
        Ok(self.read()?.environments.get(id).cloned())
    }

    async fn environment_by_stage(
        &self,
        name: &str,
        stage: &str,
    ) -> ControlResult<Option<Environment>> {
        Ok(self
            .read()?
            .environments
            .values()
            .find(|env| env.name == name && env.stage == stage)
            .cloned())
    }

    async fn get_image(&self, id: &str) -> ControlResult<Option<Image>> {
        Ok(self.read()?.images.get(id).cloned())
    }

    async fn get_host(&self, id: &HostId) -> ControlResult<Option<Host>> {
        Ok(self.read()?.hosts.get(id).cloned())
    }

    async fn insert_host(&self, host: &Host) -> ControlResult<()> {
        self.write()?.hosts.insert(host.id.clone(), host.clone());
        Ok(())
    }

    async fn set_host_state(&self, ids: &[HostId], state: HostState) -> ControlResult<()> {
        let mut tables = self.write()?;
        let now = Utc::now();
        for id in ids {
            if let Some(host) = tables.hosts.get_mut(id) {
                host.state = state;
                host.last_update = now;
            }
        }
        Ok(())
    }

    async fn delete_host(&self, id: &HostId) -> ControlResult<()> {
        let mut tables = self.write()?;
        tables.hosts.remove(id);
        tables.agents.retain(|(host_id, _), _| host_id != id);
        Ok(())
    }

    async fn hosts_in_states(&self, states: &[HostState]) -> ControlResult<Vec<Host>> {
        let tables = self.read()?;
        let mut hosts: Vec<Host> = tables
            .hosts
            .values()
            .filter(|host| states.contains(&host.state))
            .cloned()
            .collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hosts)
    }

    async fn env_host_ids(&self, env_id: &EnvId) -> ControlResult<BTreeSet<HostId>> {
        let tables = self.read()?;
        Ok(tables
            .agents
            .keys()
            .filter(|(_, env)| env == env_id)
            .map(|(host, _)| host.clone())
            .collect())
    }

    async fn retirable_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>> {
        let tables = self.read()?;
        let ids: BTreeSet<HostId> = tables
            .cluster_hosts(cluster)
            .filter(|host| host.retirable)
            .map(|host| host.id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn retirable_failed_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>> {
        let tables = self.read()?;
        let ids: BTreeSet<HostId> = tables
            .cluster_hosts(cluster)
            .filter(|host| host.retirable && tables.host_has_failed_agent(&host.id))
            .map(|host| host.id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn failed_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>> {
        let tables = self.read()?;
        let ids: BTreeSet<HostId> = tables
            .cluster_hosts(cluster)
            .filter(|host| tables.host_has_failed_agent(&host.id))
            .map(|host| host.id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn drain_hosts(&self, env_id: &EnvId, ids: &[HostId]) -> ControlResult<()> {
        let mut tables = self.write()?;
        let now = Utc::now();
        for id in ids {
            if let Some(agent) = tables.agents.get_mut(&(id.clone(), env_id.clone())) {
                agent.state = AgentState::Stop;
            }
            if let Some(host) = tables.hosts.get_mut(id) {
                host.state = HostState::PendingTerminate;
                host.last_update = now;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRegistry for MemoryStore {
    async fn agents_by_host(&self, host: &HostId) -> ControlResult<Vec<Agent>> {
        self.agents_on(host)
    }

    async fn count_serving(&self, env_id: &EnvId) -> ControlResult<u64> {
        let tables = self.read()?;
        let serving = tables
            .agents
            .values()
            .filter(|agent| &agent.env_id == env_id && agent.is_serving())
            .count();
        Ok(u64::try_from(serving).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl DeployStore for MemoryStore {
    async fn get_deploy(&self, id: &str) -> ControlResult<Option<Deploy>> {
        Ok(self.read()?.deploys.get(id).cloned())
    }

    async fn get_build(&self, id: &str) -> ControlResult<Option<Build>> {
        Ok(self.read()?.builds.get(id).cloned())
    }

    async fn promote_config(&self, env_id: &EnvId) -> ControlResult<Option<PromoteConfig>> {
        Ok(self.read()?.promote_configs.get(env_id).cloned())
    }

    async fn auto_promote_env_ids(&self) -> ControlResult<Vec<EnvId>> {
        let tables = self.read()?;
        let mut ids: Vec<EnvId> = tables
            .promote_configs
            .values()
            .filter(|config| config.kind == PromoteKind::Auto)
            .map(|config| config.env_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn set_promote_kind(&self, env_id: &EnvId, kind: PromoteKind) -> ControlResult<()> {
        let mut tables = self.write()?;
        let config = tables
            .promote_configs
            .get_mut(env_id)
            .ok_or_else(|| ControlError::not_found("promote config", env_id))?;
        config.kind = kind;
        Ok(())
    }

    async fn builds_published_between(
        &self,
        name: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> ControlResult<Vec<Build>> {
        let tables = self.read()?;
        let mut builds: Vec<Build> = tables
            .builds
            .values()
            .filter(|b| b.name == name && b.publish_date > after && b.publish_date <= before)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.publish_date.cmp(&a.publish_date));
        builds.truncate(limit);
        Ok(builds)
    }

    async fn deploys_started_between(
        &self,
        env_id: &EnvId,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> ControlResult<Vec<Deploy>> {
        let tables = self.read()?;
        let mut deploys: Vec<Deploy> = tables
            .deploys
            .values()
            .filter(|d| &d.env_id == env_id && d.start_date > after && d.start_date <= before)
            .cloned()
            .collect();
        deploys.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        deploys.truncate(limit);
        Ok(deploys)
    }

    async fn create_deploy(&self, deploy: &NewDeploy) -> ControlResult<Deploy> {
        let mut tables = self.write()?;
        let env = tables
            .environments
            .get_mut(&deploy.env_id)
            .ok_or_else(|| ControlError::not_found("environment", &deploy.env_id))?;

        let record = Deploy {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            env_id: deploy.env_id.clone(),
            build_id: deploy.build_id.clone(),
            state: DeployState::Running,
            acceptance: AcceptanceStatus::PendingDeploy,
            start_date: Utc::now(),
            from_deploy: deploy.from_deploy.clone(),
        };
        env.deploy_id = Some(record.id.clone());
        tables.deploys.insert(record.id.clone(), record.clone());
        Ok(record)
    }
}

#[async_trait]
impl TagStore for MemoryStore {
    async fn get_constraint(&self, id: &str) -> ControlResult<Option<DeployConstraint>> {
        Ok(self.read()?.constraints.get(id).cloned())
    }

    async fn constraint_ids_in_states(&self, states: &[TagSyncState]) -> ControlResult<Vec<String>> {
        let tables = self.read()?;
        let mut ids: Vec<String> = tables
            .constraints
            .values()
            .filter(|c| states.contains(&c.state))
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn set_constraint_state(&self, id: &str, state: TagSyncState) -> ControlResult<()> {
        let mut tables = self.write()?;
        let constraint = tables
            .constraints
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("deploy constraint", id))?;
        constraint.state = state;
        constraint.last_update = Utc::now();
        Ok(())
    }

    async fn tagged_host_ids(
        &self,
        env_id: &EnvId,
        tag_name: &str,
    ) -> ControlResult<BTreeSet<HostId>> {
        let tables = self.read()?;
        Ok(tables
            .host_tags
            .iter()
            .filter(|t| &t.env_id == env_id && t.tag_name == tag_name)
            .map(|t| t.host_id.clone())
            .collect())
    }

    async fn delete_host_tags(
        &self,
        env_id: &EnvId,
        tag_name: &str,
        ids: &[HostId],
    ) -> ControlResult<()> {
        self.write()?.host_tags.retain(|t| {
            !(&t.env_id == env_id && t.tag_name == tag_name && ids.contains(&t.host_id))
        });
        Ok(())
    }

    async fn insert_host_tags(&self, tags: &[HostTag]) -> ControlResult<()> {
        let mut tables = self.write()?;
        for tag in tags {
            tables.host_tags.retain(|t| {
                !(t.host_id == tag.host_id && t.env_id == tag.env_id && t.tag_name == tag.tag_name)
            });
            tables.host_tags.push(tag.clone());
        }
        Ok(())
    }
}
