//! Rolling replacement of every host in a cluster.
//!
//! ```text
//!   INIT ──launched all──▶ LAUNCHING ──all serving──▶ REPLACING ──nothing retirable──▶ COMPLETING ──▶ COMPLETED
//!    ▲                        │                          │ ▲
//!    └──── failed temp host ──┘                          └─┘ drain within budget
//! ```
//!
//! INIT launches temporary hosts outside the pool so serving capacity stays
//! above the pool size while REPLACING drains retirable pool hosts. The pool
//! refills them with hosts on the new image. COMPLETING reconciles the
//! temporary hosts: failed ones are terminated, healthy ones stand in for
//! pool hosts whose deploy failed, and the rest are terminated.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::ReplacementConfig;
use crate::context::Collaborators;
use crate::engine::{FiniteStateController, FsmDescriptor, Step};
use crate::error::{ControlError, ControlResult};
use crate::item::{ClusterUpgradeEvent, ItemStatus, UpgradeState};
use crate::notify::Notification;
use crate::types::{Agent, HostId, HostState};

use super::{cluster_paused, load_environment, restore_cluster};

/// Lock prefix of cluster upgrade events.
pub const LOCK_PREFIX: &str = "CLUSTERREPLACER";

pub type ClusterReplacementController = FiniteStateController<ReplacementFsm>;

/// Lifecycle of a [`ClusterUpgradeEvent`].
pub struct ReplacementFsm {
    ctx: Collaborators,
    config: ReplacementConfig,
}

impl ReplacementFsm {
    #[must_use]
    pub fn new(ctx: Collaborators, config: ReplacementConfig) -> Self {
        Self { ctx, config }
    }

    #[must_use]
    pub fn into_controller(self) -> ClusterReplacementController {
        let items = self.ctx.upgrades.clone();
        FiniteStateController::new(self, items)
    }

    async fn init(&self, event: &mut ClusterUpgradeEvent) -> ControlResult<Step<UpgradeState>> {
        let env = load_environment(self.ctx.inventory.as_ref(), &event.env_id).await?;
        let target = env.max_parallel_replacement.max(1);
        let mut needed = target.saturating_sub(event.host_ids.len());
        let mut launched_any = false;

        while needed > 0 {
            let batch = needed.min(self.config.launch_batch.max(1));
            let launched = self
                .ctx
                .fleet
                .launch_hosts(&event.cluster, batch, None)
                .await?;

            if launched.is_empty() {
                tracing::error!(
                    item_id = %event.header.id,
                    cluster = %event.cluster,
                    requested = batch,
                    "failed to launch replacement hosts"
                );
                self.ctx.notifier.notify(
                    Notification::new(
                        format!("Cluster Upgrade Event Alert - Launch failure for cluster {}", event.cluster),
                        format!(
                            "Failed to launch {batch} hosts for cluster {} in state INIT; retrying",
                            event.cluster
                        ),
                    )
                    .to(&env.recipients.email)
                    .in_room(env.recipients.chatroom.as_deref()),
                );
                if launched_any {
                    return Ok(Step::Stay);
                }
                return Err(ControlError::fleet(format!(
                    "launched none of {batch} hosts for cluster {}",
                    event.cluster
                )));
            }

            needed = needed.saturating_sub(launched.len());
            tracing::info!(
                item_id = %event.header.id,
                cluster = %event.cluster,
                launched = ?launched,
                remaining = needed,
                "launched replacement hosts"
            );
            event.host_ids.extend(launched);
            launched_any = true;
            self.ctx.upgrades.update(event).await?;
        }

        Ok(Step::to(UpgradeState::Launching, ItemStatus::Succeeded))
    }

    async fn launching(&self, event: &mut ClusterUpgradeEvent) -> ControlResult<Step<UpgradeState>> {
        if event.host_ids.is_empty() {
            return Ok(Step::to(UpgradeState::Init, ItemStatus::Succeeded));
        }

        let tracked: Vec<HostId> = event.host_ids.iter().cloned().collect();
        let mut failed: BTreeSet<HostId> = self
            .ctx
            .fleet
            .list_terminated(&tracked)
            .await?
            .into_iter()
            .collect();
        let running = self.ctx.fleet.list_running(&tracked).await?;

        let mut ready = running.len() == tracked.len();
        for host in &running {
            let agents = self.ctx.agents.agents_by_host(host).await?;
            if agents.is_empty() {
                tracing::debug!(host_id = %host, "host has not reported yet");
                ready = false;
                continue;
            }
            if !agents.iter().all(Agent::is_serving) {
                ready = false;
            }
            if agents.iter().any(Agent::is_failed) {
                tracing::info!(host_id = %host, cluster = %event.cluster, "deploy failed on host");
                failed.insert(host.clone());
            }
        }

        if !failed.is_empty() {
            let ids: Vec<HostId> = failed.into_iter().collect();
            self.ctx
                .fleet
                .terminate_hosts(&event.cluster, &ids, true)
                .await?;
            self.ctx
                .inventory
                .set_host_state(&ids, HostState::Terminating)
                .await?;
            for id in &ids {
                event.host_ids.remove(id);
            }
            tracing::warn!(
                item_id = %event.header.id,
                cluster = %event.cluster,
                failed = ?ids,
                "terminated failed replacement hosts, relaunching"
            );
            return Ok(Step::to(UpgradeState::Init, ItemStatus::Succeeded));
        }

        if ready {
            Ok(Step::to(UpgradeState::Replacing, ItemStatus::Succeeded))
        } else {
            Ok(Step::Stay)
        }
    }

    async fn replacing(&self, event: &ClusterUpgradeEvent) -> ControlResult<Step<UpgradeState>> {
        let inventory = self.ctx.inventory.as_ref();
        let retirable = inventory.retirable_host_ids(&event.cluster).await?;
        if retirable.is_empty() {
            return Ok(Step::to(UpgradeState::Completing, ItemStatus::Succeeded));
        }

        let pool_size = self.ctx.fleet.current_pool_size(&event.cluster).await?;
        let serving = self.ctx.agents.count_serving(&event.env_id).await?;
        if serving <= pool_size {
            tracing::debug!(
                cluster = %event.cluster,
                serving,
                pool_size,
                "waiting for serving capacity above pool size"
            );
            return Ok(Step::Stay);
        }

        let mut budget = usize::try_from(serving - pool_size).unwrap_or(usize::MAX);
        let failed = inventory.retirable_failed_host_ids(&event.cluster).await?;

        let first: Vec<HostId> = failed.iter().take(budget).cloned().collect();
        budget -= first.len();
        self.drain(event, &first).await?;

        if budget > 0 {
            let rest: Vec<HostId> = retirable
                .into_iter()
                .filter(|id| !failed.contains(id))
                .take(budget)
                .collect();
            self.drain(event, &rest).await?;
        }

        Ok(Step::Stay)
    }

    async fn drain(&self, event: &ClusterUpgradeEvent, ids: &[HostId]) -> ControlResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.ctx.inventory.drain_hosts(&event.env_id, ids).await?;
        tracing::info!(
            item_id = %event.header.id,
            cluster = %event.cluster,
            hosts = ?ids,
            "drained retirable hosts"
        );
        Ok(())
    }

    async fn completing(&self, event: &mut ClusterUpgradeEvent) -> ControlResult<Step<UpgradeState>> {
        let cluster = event.cluster.clone();
        let serving = self.ctx.agents.count_serving(&event.env_id).await?;
        let pool_size = self.ctx.fleet.current_pool_size(&cluster).await?;

        if event.host_ids.is_empty() || serving <= pool_size {
            restore_cluster(self.ctx.inventory.as_ref(), &cluster).await?;
            return Ok(Step::keep_status(UpgradeState::Completed));
        }

        let tracked: BTreeSet<HostId> = event.host_ids.clone();
        let tracked_ids: Vec<HostId> = tracked.iter().cloned().collect();
        let active = self.ctx.fleet.list_running(&tracked_ids).await?;
        if active.len() != tracked.len() {
            event.host_ids = active.iter().cloned().collect();
            self.ctx.upgrades.update(event).await?;
        }

        let failed = self.ctx.inventory.failed_host_ids(&cluster).await?;
        let failed_temps: Vec<HostId> = failed
            .iter()
            .filter(|id| active.contains(id))
            .cloned()
            .collect();
        let failed_pool: Vec<HostId> = failed
            .into_iter()
            .filter(|id| !tracked.contains(id))
            .collect();
        let mut healthy: Vec<HostId> = active
            .into_iter()
            .filter(|id| !failed_temps.contains(id))
            .collect();

        if !failed_temps.is_empty() {
            self.terminate(&cluster, &failed_temps, true).await?;
            for id in &failed_temps {
                event.host_ids.remove(id);
            }
            self.ctx.upgrades.update(event).await?;
            tracing::info!(cluster = %cluster, hosts = ?failed_temps, "terminated failed temporary hosts");
        }

        let swaps = failed_pool.len().min(healthy.len());
        if swaps > 0 {
            let attach: Vec<HostId> = healthy.drain(..swaps).collect();
            self.ctx.fleet.attach_to_pool(&attach, &cluster).await?;
            for id in &attach {
                event.host_ids.remove(id);
            }
            self.ctx.upgrades.update(event).await?;
            tracing::info!(cluster = %cluster, hosts = ?attach, "attached temporary hosts to pool");

            let replaced = &failed_pool[..swaps];
            self.terminate(&cluster, replaced, false).await?;
            tracing::info!(cluster = %cluster, hosts = ?replaced, "terminated failed pool hosts");
        }

        if !healthy.is_empty() {
            self.terminate(&cluster, &healthy, true).await?;
            tracing::info!(cluster = %cluster, hosts = ?healthy, "terminated remaining temporary hosts");
        }

        event.host_ids.clear();
        restore_cluster(self.ctx.inventory.as_ref(), &cluster).await?;
        Ok(Step::keep_status(UpgradeState::Completed))
    }

    async fn terminate(&self, cluster: &str, ids: &[HostId], drain: bool) -> ControlResult<()> {
        self.ctx.fleet.terminate_hosts(cluster, ids, drain).await?;
        self.ctx
            .inventory
            .set_host_state(ids, HostState::Terminating)
            .await
    }
}

#[async_trait]
impl FsmDescriptor for ReplacementFsm {
    type Item = ClusterUpgradeEvent;

    const NAME: &'static str = "cluster_replacement";
    const LOCK_PREFIX: &'static str = LOCK_PREFIX;

    fn active_states(&self) -> &'static [UpgradeState] {
        &[
            UpgradeState::Init,
            UpgradeState::Launching,
            UpgradeState::Replacing,
            UpgradeState::Completing,
        ]
    }

    fn timeout(&self) -> Duration {
        Duration::seconds(i64::try_from(self.config.timeout_secs).unwrap_or(i64::MAX))
    }

    fn timeout_target(&self, from: UpgradeState) -> UpgradeState {
        timeout_target(from)
    }

    fn timeout_message(&self, event: &ClusterUpgradeEvent) -> String {
        format!("Cluster upgrade event timeout at state {}", event.state)
    }

    async fn is_paused(&self, event: &ClusterUpgradeEvent) -> ControlResult<bool> {
        cluster_paused(self.ctx.inventory.as_ref(), &event.cluster).await
    }

    async fn on_timeout(&self, event: &ClusterUpgradeEvent, from: UpgradeState) -> ControlResult<()> {
        restore_cluster(self.ctx.inventory.as_ref(), &event.cluster).await?;

        let env = load_environment(self.ctx.inventory.as_ref(), &event.env_id).await?;
        self.ctx.notifier.notify(
            Notification::new(
                format!("Cluster Upgrade Event Alert - Timeout for cluster {}", event.cluster),
                format!(
                    "Cluster upgrade event timeout at state {from} for cluster {}",
                    event.cluster
                ),
            )
            .to(&env.recipients.email)
            .in_room(env.recipients.chatroom.as_deref()),
        );
        Ok(())
    }

    async fn step(
        &self,
        event: &mut ClusterUpgradeEvent,
        _now: DateTime<Utc>,
    ) -> ControlResult<Step<UpgradeState>> {
        tracing::debug!(
            item_id = %event.header.id,
            cluster = %event.cluster,
            state = %event.state,
            "processing cluster upgrade event"
        );
        match event.state {
            UpgradeState::Init => self.init(event).await,
            UpgradeState::Launching => self.launching(event).await,
            UpgradeState::Replacing => self.replacing(event).await,
            UpgradeState::Completing => self.completing(event).await,
            UpgradeState::Completed => Err(ControlError::invariant(format!(
                "event {} stepped while COMPLETED",
                event.header.id
            ))),
        }
    }
}

/// COMPLETING times out straight to COMPLETED; every other state cleans up
/// through COMPLETING.
fn timeout_target(from: UpgradeState) -> UpgradeState {
    match from {
        UpgradeState::Completing | UpgradeState::Completed => UpgradeState::Completed,
        UpgradeState::Init | UpgradeState::Launching | UpgradeState::Replacing => {
            UpgradeState::Completing
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(UpgradeState::Init, UpgradeState::Completing)]
    #[case(UpgradeState::Launching, UpgradeState::Completing)]
    #[case(UpgradeState::Replacing, UpgradeState::Completing)]
    #[case(UpgradeState::Completing, UpgradeState::Completed)]
    fn timeouts_head_for_cleanup(#[case] from: UpgradeState, #[case] to: UpgradeState) {
        assert_eq!(timeout_target(from), to);
    }
}
