//! Read access to deploy agent reports.

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{Agent, EnvId, HostId};

/// Latest agent heartbeats, as recorded by whatever ingests them.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Agents on `host`, one per environment deployed there.
    async fn agents_by_host(&self, host: &HostId) -> ControlResult<Vec<Agent>>;

    /// Agents of `env_id` currently serving the deployed build.
    async fn count_serving(&self, env_id: &EnvId) -> ControlResult<u64>;
}
