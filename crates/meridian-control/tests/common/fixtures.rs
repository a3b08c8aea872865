//! Test fixtures for control integration tests.

use chrono::{DateTime, Duration, Utc};
use meridian_control::item::{ClusterUpgradeEvent, HealthCheck, HealthCheckKind, ItemStatus, UpgradeState};
use meridian_control::types::{
    Agent, AgentState, AgentStatus, Cluster, ClusterState, DeployStage, EnvId, EnvState,
    Environment, Host, HostId, HostState, Recipients,
};

pub const CLUSTER: &str = "web-prod";
pub const ENV: &str = "env-web-prod";

pub fn env_id() -> EnvId {
    EnvId::new(ENV)
}

pub fn recipients() -> Recipients {
    Recipients {
        email: vec!["team@example.com".to_owned()],
        pager: vec!["oncall@example.com".to_owned()],
        chatroom: Some("#web-deploys".to_owned()),
    }
}

pub fn cluster(name: &str) -> Cluster {
    Cluster {
        name: name.to_owned(),
        env_id: env_id(),
        state: ClusterState::Normal,
        image_id: None,
        launch_grace_secs: 600,
        recipients: recipients(),
        last_update: Utc::now(),
    }
}

pub fn environment(id: &str, name: &str, stage: &str) -> Environment {
    Environment {
        id: EnvId::new(id),
        name: name.to_owned(),
        stage: stage.to_owned(),
        state: EnvState::Normal,
        deploy_id: None,
        build_name: name.to_owned(),
        max_parallel_replacement: 3,
        recipients: recipients(),
    }
}

/// Builder for test hosts.
pub struct HostBuilder {
    id: HostId,
    cluster: String,
    state: HostState,
    retirable: bool,
    created_at: DateTime<Utc>,
}

impl HostBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: HostId::new(id),
            cluster: CLUSTER.to_owned(),
            state: HostState::Running,
            retirable: false,
            created_at: Utc::now(),
        }
    }

    pub fn in_cluster(mut self, cluster: &str) -> Self {
        self.cluster = cluster.to_owned();
        self
    }

    pub fn with_state(mut self, state: HostState) -> Self {
        self.state = state;
        self
    }

    pub fn retirable(mut self) -> Self {
        self.retirable = true;
        self
    }

    pub fn build(self) -> Host {
        Host {
            id: self.id,
            cluster: self.cluster,
            state: self.state,
            retirable: self.retirable,
            last_update: self.created_at,
            created_at: self.created_at,
        }
    }
}

/// Builder for test agents. Defaults to a serving agent.
pub struct AgentBuilder {
    host_id: HostId,
    env_id: EnvId,
    deploy_stage: DeployStage,
    status: AgentStatus,
    state: AgentState,
    deploy_start: Option<DateTime<Utc>>,
    first_deploy_time: Option<DateTime<Utc>>,
}

impl AgentBuilder {
    pub fn new(host: &str) -> Self {
        Self {
            host_id: HostId::new(host),
            env_id: env_id(),
            deploy_stage: DeployStage::ServingBuild,
            status: AgentStatus::Succeeded,
            state: AgentState::Normal,
            deploy_start: None,
            first_deploy_time: None,
        }
    }

    pub fn for_host(host: &HostId) -> Self {
        Self::new(host.as_str())
    }

    pub fn in_env(mut self, env: &str) -> Self {
        self.env_id = EnvId::new(env);
        self
    }

    /// Still deploying.
    pub fn deploying(mut self) -> Self {
        self.deploy_stage = DeployStage::Downloading;
        self.status = AgentStatus::Unknown;
        self
    }

    /// Stuck in a status the agent will not recover from.
    pub fn failed(mut self) -> Self {
        self.deploy_stage = DeployStage::PostRestart;
        self.status = AgentStatus::TooManyRetry;
        self
    }

    pub fn stopped(mut self) -> Self {
        self.deploy_stage = DeployStage::Stopped;
        self.state = AgentState::Stop;
        self
    }

    pub fn deployed_between(mut self, start: DateTime<Utc>, complete: DateTime<Utc>) -> Self {
        self.deploy_start = Some(start);
        self.first_deploy_time = Some(complete);
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            host_id: self.host_id,
            env_id: self.env_id,
            deploy_stage: self.deploy_stage,
            status: self.status,
            state: self.state,
            deploy_start: self.deploy_start,
            first_deploy_time: self.first_deploy_time,
            last_update: Utc::now(),
        }
    }
}

/// Builder for cluster upgrade events.
pub struct EventBuilder {
    event: ClusterUpgradeEvent,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self {
            event: ClusterUpgradeEvent::new(CLUSTER, env_id(), Utc::now()),
        }
    }

    pub fn in_state(mut self, state: UpgradeState) -> Self {
        self.event.state = state;
        self.event.header.status = Some(ItemStatus::Succeeded);
        self
    }

    pub fn tracking(mut self, hosts: &[&HostId]) -> Self {
        self.event.host_ids = hosts.iter().map(|id| (*id).clone()).collect();
        self
    }

    /// Last progress `ago` in the past.
    pub fn idle_for(mut self, ago: Duration) -> Self {
        let at = Utc::now() - ago;
        self.event.header.last_worked_on = at;
        self.event.header.state_start_time = at;
        self
    }

    pub fn build(self) -> ClusterUpgradeEvent {
        self.event
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A health check of `image` created `ago` in the past.
pub fn health_check(image: &str, kind: HealthCheckKind, ago: Duration) -> HealthCheck {
    HealthCheck::new(CLUSTER, env_id(), kind, image, Utc::now() - ago)
}
