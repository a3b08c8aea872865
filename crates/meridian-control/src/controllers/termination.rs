//! Decommissioning of drained hosts.

use async_trait::async_trait;

use crate::context::Collaborators;
use crate::engine::Controller;
use crate::error::ControlResult;
use crate::types::{Agent, Host, HostId, HostState};

/// Lock prefix of host termination.
pub const LOCK_PREFIX: &str = "HOSTTERMINATOR";

/// Terminates PENDING_TERMINATE hosts once their agents stop, and forgets
/// hosts the provider reports gone.
pub struct TerminationController {
    ctx: Collaborators,
}

impl TerminationController {
    #[must_use]
    pub fn new(ctx: Collaborators) -> Self {
        Self { ctx }
    }

    /// Forget `host` if the provider has terminated it.
    async fn remove_if_terminated(&self, host: &Host) -> ControlResult<bool> {
        let terminated = self
            .ctx
            .fleet
            .list_terminated(std::slice::from_ref(&host.id))
            .await?;
        if !terminated.contains(&host.id) {
            return Ok(false);
        }

        self.ctx.inventory.delete_host(&host.id).await?;
        tracing::info!(host_id = %host.id, cluster = %host.cluster, "deleted records of terminated host");
        Ok(true)
    }

    async fn terminate_if_stopped(&self, host: &Host) -> ControlResult<()> {
        let agents = self.ctx.agents.agents_by_host(&host.id).await?;
        if !agents.iter().all(Agent::is_stopped) {
            tracing::debug!(host_id = %host.id, "waiting for agents to stop");
            return Ok(());
        }

        let ids = [host.id.clone()];
        self.ctx.fleet.terminate_hosts(&host.cluster, &ids, true).await?;
        self.ctx
            .inventory
            .set_host_state(&ids, HostState::Terminating)
            .await?;
        tracing::info!(host_id = %host.id, cluster = %host.cluster, "host stopped, terminating");
        Ok(())
    }
}

#[async_trait]
impl Controller for TerminationController {
    type Id = HostId;

    fn name(&self) -> &'static str {
        "termination"
    }

    fn lock_prefix(&self) -> Option<&'static str> {
        Some(LOCK_PREFIX)
    }

    async fn candidates(&self) -> ControlResult<Vec<HostId>> {
        let hosts = self
            .ctx
            .inventory
            .hosts_in_states(&[HostState::PendingTerminate, HostState::Terminating])
            .await?;
        Ok(hosts.into_iter().map(|host| host.id).collect())
    }

    async fn process(&self, id: &HostId) -> ControlResult<()> {
        // Re-read under the lock; another worker may have finished the host.
        let Some(host) = self.ctx.inventory.get_host(id).await? else {
            return Ok(());
        };
        if !host.state.is_leaving() {
            tracing::debug!(host_id = %id, state = %host.state, "host no longer leaving");
            return Ok(());
        }

        if self.remove_if_terminated(&host).await? {
            return Ok(());
        }
        if host.state == HostState::PendingTerminate {
            self.terminate_if_stopped(&host).await?;
        }
        Ok(())
    }
}
