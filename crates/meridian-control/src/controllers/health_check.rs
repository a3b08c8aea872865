//! Image verification on a single probe host.
//!
//! A check launches one host from its image, waits for it to check in, waits
//! for every agent on it to serve, then promotes the image to the cluster if
//! it qualified. Failures alert the cluster's email recipients, or page
//! on-call once enough checks in a row have failed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::HealthCheckConfig;
use crate::context::Collaborators;
use crate::engine::{lock_name, with_lock, FiniteStateController, FsmDescriptor, Step};
use crate::error::{ControlError, ControlResult};
use crate::item::{HealthCheck, HealthCheckKind, HealthCheckState, ItemState, ItemStatus, WorkItem};
use crate::notify::Notification;
use crate::types::{Agent, Host, HostId, HostState};

use super::{cluster_paused, load_cluster};

/// Lock prefix of health checks.
pub const LOCK_PREFIX: &str = "HEALTHCHECK";

/// Lock prefix serialising image updates of one cluster.
pub const UPDATE_IMAGE_LOCK_PREFIX: &str = "UPDATEIMAGE";

pub type HealthCheckController = FiniteStateController<HealthCheckFsm>;

/// Lifecycle of a [`HealthCheck`].
pub struct HealthCheckFsm {
    ctx: Collaborators,
    config: HealthCheckConfig,
}

impl HealthCheckFsm {
    #[must_use]
    pub fn new(ctx: Collaborators, config: HealthCheckConfig) -> Self {
        Self { ctx, config }
    }

    #[must_use]
    pub fn into_controller(self) -> HealthCheckController {
        let items = self.ctx.health_checks.clone();
        FiniteStateController::new(self, items)
    }

    /// Whether the last `failures_before_page - 1` finished checks of the
    /// cluster, excluding `check`, all failed.
    async fn should_page(&self, check: &HealthCheck) -> ControlResult<bool> {
        let previous = self.config.failures_before_page.saturating_sub(1);
        let recent: Vec<HealthCheck> = self
            .ctx
            .health_checks
            .recent_for_owner(&check.cluster, previous * 2 + 1)
            .await?;

        let finished: Vec<&HealthCheck> = recent
            .iter()
            .filter(|other| other.header.id != check.header.id && other.state.is_terminal())
            .take(previous)
            .collect();

        Ok(finished.len() == previous
            && finished
                .iter()
                .all(|other| other.header.status != Some(ItemStatus::Qualified)))
    }

    /// Tell whoever should hear about a failed check.
    async fn alert(&self, check: &HealthCheck, subject: &str, message: &str) -> ControlResult<()> {
        let cluster = load_cluster(self.ctx.inventory.as_ref(), &check.cluster).await?;
        let page = self.should_page(check).await?;

        let (recipients, message) = if page {
            (
                &cluster.recipients.pager,
                format!(
                    "Health check is failing for {} times. {message}",
                    self.config.failures_before_page
                ),
            )
        } else {
            (&cluster.recipients.email, message.to_owned())
        };

        tracing::warn!(
            item_id = %check.header.id,
            cluster = %check.cluster,
            page,
            "{message}"
        );
        self.ctx.notifier.notify(
            Notification::new(subject, message)
                .to(recipients)
                .in_room(cluster.recipients.chatroom.as_deref()),
        );
        Ok(())
    }

    /// Fail the check. Nothing was launched yet in INIT, so there is nothing
    /// for COMPLETING to clean up.
    async fn fail(
        &self,
        check: &HealthCheck,
        subject: &str,
        message: String,
    ) -> ControlResult<Step<HealthCheckState>> {
        self.alert(check, subject, &message).await?;
        let to = if check.state == HealthCheckState::Init {
            HealthCheckState::Completed
        } else {
            HealthCheckState::Completing
        };
        Ok(Step::fail(to, message))
    }

    fn probe_host(check: &HealthCheck) -> ControlResult<HostId> {
        check.host_id.clone().ok_or_else(|| {
            ControlError::invariant(format!(
                "health check {} in {} without a probe host",
                check.header.id, check.state
            ))
        })
    }

    async fn init(&self, check: &mut HealthCheck, now: DateTime<Utc>) -> ControlResult<Step<HealthCheckState>> {
        let launched = self
            .ctx
            .fleet
            .launch_hosts(&check.cluster, 1, Some(&check.image_id))
            .await?;

        let Some(host_id) = launched.into_iter().next() else {
            return self
                .fail(
                    check,
                    &format!("Health Check Warning - Launch Host Failed in cluster {}", check.cluster),
                    format!(
                        "Failed to launch a host with image {} in cluster {}",
                        check.image_id, check.cluster
                    ),
                )
                .await;
        };

        self.ctx
            .inventory
            .insert_host(&Host {
                id: host_id.clone(),
                cluster: check.cluster.clone(),
                state: HostState::Provisioned,
                retirable: false,
                last_update: now,
                created_at: now,
            })
            .await?;

        tracing::info!(item_id = %check.header.id, host_id = %host_id, "launched probe host");
        check.host_id = Some(host_id);
        check.host_launch_time = Some(now);
        check.host_terminated = false;
        Ok(Step::to(HealthCheckState::Launching, ItemStatus::Succeeded))
    }

    async fn launching(&self, check: &mut HealthCheck, now: DateTime<Utc>) -> ControlResult<Step<HealthCheckState>> {
        let host_id = Self::probe_host(check)?;

        let terminated = self.ctx.fleet.list_terminated(&[host_id.clone()]).await?;
        if terminated.contains(&host_id) {
            return self
                .fail(
                    check,
                    &format!("Health Check Alert - Host Terminated in cluster {}", check.cluster),
                    format!(
                        "Probe host {host_id} (image {}) was terminated in cluster {}",
                        check.image_id, check.cluster
                    ),
                )
                .await;
        }

        let host = self.ctx.inventory.get_host(&host_id).await?;
        match host.map(|host| host.state) {
            Some(HostState::Running) => {
                Ok(Step::to(HealthCheckState::PendingVerify, ItemStatus::Succeeded))
            }
            Some(HostState::PendingTerminate | HostState::Terminating) => {
                self.fail(
                    check,
                    &format!("Health Check Alert - Host Terminated in cluster {}", check.cluster),
                    format!("Probe host {host_id} is being terminated in cluster {}", check.cluster),
                )
                .await
            }
            Some(HostState::Provisioned) | None => {
                let cluster = load_cluster(self.ctx.inventory.as_ref(), &check.cluster).await?;
                let grace = Duration::seconds(i64::try_from(cluster.launch_grace_secs).unwrap_or(i64::MAX));
                let launched_at = check.host_launch_time.unwrap_or(check.header.state_start_time);
                if now - launched_at >= grace {
                    return self
                        .fail(
                            check,
                            &format!("Health Check Alert - Host Unresponsive in cluster {}", check.cluster),
                            format!(
                                "Probe host {host_id} has not checked in for {} seconds (image {}) in cluster {}",
                                cluster.launch_grace_secs, check.image_id, check.cluster
                            ),
                        )
                        .await;
                }
                Ok(Step::Stay)
            }
        }
    }

    async fn pending_verify(&self, check: &mut HealthCheck) -> ControlResult<Step<HealthCheckState>> {
        let host_id = Self::probe_host(check)?;
        let agents = self.ctx.agents.agents_by_host(&host_id).await?;
        if agents.is_empty() {
            tracing::debug!(host_id = %host_id, "probe host has no agents yet");
            return Ok(Step::Stay);
        }

        for agent in agents.iter().filter(|agent| agent.env_id == check.env_id) {
            check.deploy_start_time = agent.deploy_start;
            if agent.first_deploy_time.is_some() {
                check.deploy_complete_time = agent.first_deploy_time;
            }
        }

        if let Some(failed) = agents.iter().find(|agent| agent.is_failed()) {
            return self
                .fail(
                    check,
                    &format!("Health Check Alert - Deploy/Health Check Script Failed in cluster {}", check.cluster),
                    format!(
                        "Deploy/health check script failed for environment {} with status {} (image {}) in cluster {}",
                        failed.env_id, failed.status, check.image_id, check.cluster
                    ),
                )
                .await;
        }

        if agents.iter().all(Agent::is_serving) {
            Ok(Step::to(HealthCheckState::Completing, ItemStatus::Qualified))
        } else {
            Ok(Step::Stay)
        }
    }

    /// Point the cluster at the check's image if it is newer than the
    /// current one. Returns false when another worker holds the image lock.
    async fn promote_image(&self, check: &HealthCheck) -> ControlResult<bool> {
        let name = lock_name(UPDATE_IMAGE_LOCK_PREFIX, &check.cluster);
        let inventory = self.ctx.inventory.as_ref();

        let outcome = with_lock(self.ctx.locks.as_ref(), &name, || async move {
            let cluster = load_cluster(inventory, &check.cluster).await?;
            let candidate = inventory
                .get_image(&check.image_id)
                .await?
                .ok_or_else(|| ControlError::not_found("image", &check.image_id))?;

            let current = match &cluster.image_id {
                Some(id) => inventory.get_image(id).await?,
                None => None,
            };
            if current.is_some_and(|current| current.publish_date >= candidate.publish_date) {
                tracing::debug!(cluster = %check.cluster, image_id = %check.image_id, "cluster already on a newer image");
                return Ok(());
            }

            inventory.set_cluster_image(&check.cluster, &check.image_id).await?;
            tracing::info!(cluster = %check.cluster, image_id = %check.image_id, "promoted image to cluster");
            Ok(())
        })
        .await?;

        Ok(outcome.is_some())
    }

    async fn completing(&self, check: &mut HealthCheck) -> ControlResult<Step<HealthCheckState>> {
        if check.header.status == Some(ItemStatus::Qualified)
            && check.kind != HealthCheckKind::TimeTriggered
            && !self.promote_image(check).await?
        {
            tracing::debug!(cluster = %check.cluster, "image lock busy, retrying");
            return Ok(Step::Stay);
        }

        self.terminate_probe(check).await?;
        Ok(Step::keep_status(HealthCheckState::Completed))
    }

    /// Terminate the probe host unless that already happened. Returns whether
    /// `check` changed.
    async fn terminate_probe(&self, check: &mut HealthCheck) -> ControlResult<bool> {
        let Some(host_id) = check.host_id.clone() else {
            return Ok(false);
        };
        if check.host_terminated {
            return Ok(false);
        }

        let ids = [host_id];
        self.ctx.fleet.terminate_hosts(&check.cluster, &ids, false).await?;
        self.ctx
            .inventory
            .set_host_state(&ids, HostState::Terminating)
            .await?;
        check.host_terminated = true;
        tracing::info!(item_id = %check.header.id, host_id = %ids[0], "terminated probe host");
        Ok(true)
    }
}

#[async_trait]
impl FsmDescriptor for HealthCheckFsm {
    type Item = HealthCheck;

    const NAME: &'static str = "health_check";
    const LOCK_PREFIX: &'static str = LOCK_PREFIX;

    fn active_states(&self) -> &'static [HealthCheckState] {
        &[
            HealthCheckState::Init,
            HealthCheckState::Launching,
            HealthCheckState::PendingVerify,
            HealthCheckState::Completing,
        ]
    }

    fn timeout(&self) -> Duration {
        Duration::seconds(i64::try_from(self.config.timeout_secs).unwrap_or(i64::MAX))
    }

    fn timeout_basis(&self, check: &HealthCheck) -> DateTime<Utc> {
        check.header.state_start_time
    }

    fn timeout_target(&self, from: HealthCheckState) -> HealthCheckState {
        timeout_target(from)
    }

    fn timeout_message(&self, check: &HealthCheck) -> String {
        format!("Health check timeout at state {}", check.state)
    }

    async fn is_paused(&self, check: &HealthCheck) -> ControlResult<bool> {
        cluster_paused(self.ctx.inventory.as_ref(), &check.cluster).await
    }

    async fn on_timeout(&self, check: &HealthCheck, _from: HealthCheckState) -> ControlResult<()> {
        // COMPLETED is never stepped again, so the probe host goes now.
        let released = if check.state == HealthCheckState::Completed {
            let mut check = check.clone();
            match self.terminate_probe(&mut check).await {
                Ok(true) => self.ctx.health_checks.update(&check).await,
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        let message = check
            .header
            .error_message
            .clone()
            .unwrap_or_else(|| self.timeout_message(check));
        self.alert(
            check,
            &format!("Health Check Alert - Health Check Timeout in cluster {}", check.cluster),
            &message,
        )
        .await?;
        released
    }

    async fn step(&self, check: &mut HealthCheck, now: DateTime<Utc>) -> ControlResult<Step<HealthCheckState>> {
        tracing::debug!(
            item_id = %check.id(),
            cluster = %check.cluster,
            state = %check.state,
            "processing health check"
        );
        match check.state {
            HealthCheckState::Init => self.init(check, now).await,
            HealthCheckState::Launching => self.launching(check, now).await,
            HealthCheckState::PendingVerify => self.pending_verify(check).await,
            HealthCheckState::Completing => self.completing(check).await,
            HealthCheckState::Completed => Err(ControlError::invariant(format!(
                "health check {} stepped while COMPLETED",
                check.header.id
            ))),
        }
    }
}

/// Nothing was launched in INIT, so INIT times out straight to COMPLETED.
fn timeout_target(from: HealthCheckState) -> HealthCheckState {
    match from {
        HealthCheckState::Init | HealthCheckState::Completing | HealthCheckState::Completed => {
            HealthCheckState::Completed
        }
        HealthCheckState::Launching | HealthCheckState::PendingVerify => {
            HealthCheckState::Completing
        }
    }
}
