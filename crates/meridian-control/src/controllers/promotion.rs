//! Automatic promotion of builds and deploys between environments.
//!
//! Promotion is a single step per environment rather than a multi-tick work
//! item. The candidate is computed without a lock; the promote itself runs
//! under `PROMOTE-<env>` and only if the environment's deploy is still the
//! one the candidate was computed against.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::PromotionConfig;
use crate::context::Collaborators;
use crate::engine::{lock_name, with_lock, Controller};
use crate::error::ControlResult;
use crate::notify::Notification;
use crate::store::NewDeploy;
use crate::types::{
    Deploy, DeployState, EnvId, EnvState, Environment, PromoteConfig, PromoteFailPolicy,
    PromoteKind, BUILD_STAGE,
};

use super::load_environment;

/// Lock prefix of environment promotions.
pub const LOCK_PREFIX: &str = "PROMOTE";

/// What one promotion attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Disabled, manual, or without a predecessor stage.
    Ineligible,
    /// The current deploy is still in progress.
    NotRetirable,
    /// The current deploy failed and auto-promotion was switched off.
    Disabled,
    /// The current deploy failed and was rolled back to `deploy_id`.
    RolledBack { deploy_id: String },
    /// Fewer candidates than the configured queue size.
    NoCandidate,
    Promoted { deploy_id: String },
    /// The environment's deploy changed while the candidate was computed.
    Abandoned,
    /// Another worker is promoting the environment.
    Contended,
}

/// Promotes AUTO environments from their predecessor stage.
pub struct PromotionController {
    ctx: Collaborators,
    config: PromotionConfig,
}

impl PromotionController {
    #[must_use]
    pub fn new(ctx: Collaborators, config: PromotionConfig) -> Self {
        Self { ctx, config }
    }

    /// Try to promote into `env_id` as of `now`.
    pub async fn promote(&self, env_id: &EnvId, now: DateTime<Utc>) -> ControlResult<PromoteOutcome> {
        let Some(env) = self.ctx.inventory.get_environment(env_id).await? else {
            tracing::info!(env_id = %env_id, "environment deleted, skipping");
            return Ok(PromoteOutcome::Ineligible);
        };
        if env.state != EnvState::Normal {
            tracing::info!(env_id = %env_id, "environment disabled, skipping");
            return Ok(PromoteOutcome::Ineligible);
        }

        let config = match self.ctx.deploys.promote_config(env_id).await? {
            Some(config) if config.kind == PromoteKind::Auto => config,
            _ => {
                tracing::info!(env_id = %env_id, "auto promotion switched off, skipping");
                return Ok(PromoteOutcome::Ineligible);
            }
        };
        let Some(pred_stage) = config.pred_stage.clone().filter(|stage| !stage.is_empty()) else {
            tracing::info!(env_id = %env_id, "no predecessor stage, skipping");
            return Ok(PromoteOutcome::Ineligible);
        };

        let current = match &env.deploy_id {
            Some(id) => self.ctx.deploys.get_deploy(id).await?,
            None => None,
        };
        if !is_retirable(current.as_ref()) {
            tracing::debug!(env_id = %env_id, "current deploy not ready to retire");
            return Ok(PromoteOutcome::NotRetirable);
        }

        if let Some(failed) = current.as_ref().filter(|deploy| deploy.is_failed()) {
            match config.fail_policy {
                PromoteFailPolicy::Continue => {
                    tracing::info!(env_id = %env_id, deploy_id = %failed.id, "current deploy failed, promoting anyway");
                }
                PromoteFailPolicy::Disable => return self.disable(&env, &failed.id).await,
                PromoteFailPolicy::Rollback => return self.rollback(&env, failed).await,
            }
        }

        let end = now - Duration::minutes(i64::from(config.delay_minutes));
        let candidate = if pred_stage == BUILD_STAGE {
            self.build_candidate(&env, current.as_ref(), &config, end).await?
        } else {
            self.deploy_candidate(&env, current.as_ref(), &config, &pred_stage, end)
                .await?
        };

        match candidate {
            Some(candidate) => {
                self.safe_promote(&env, env.deploy_id.clone(), candidate, None)
                    .await
            }
            None => {
                tracing::debug!(env_id = %env_id, pred_stage = %pred_stage, "no promotion candidate");
                Ok(PromoteOutcome::NoCandidate)
            }
        }
    }

    /// Builds published after the current build, excluding bad ones.
    async fn build_candidate(
        &self,
        env: &Environment,
        current: Option<&Deploy>,
        config: &PromoteConfig,
        end: DateTime<Utc>,
    ) -> ControlResult<Option<NewDeploy>> {
        let start = match current {
            Some(deploy) => match self.ctx.deploys.get_build(&deploy.build_id).await? {
                Some(build) => build.publish_date,
                None => DateTime::UNIX_EPOCH,
            },
            None => DateTime::UNIX_EPOCH,
        };
        if end < start {
            return Ok(None);
        }

        let builds = self
            .ctx
            .deploys
            .builds_published_between(&env.build_name, start, end, self.config.candidate_limit)
            .await?;

        Ok(builds
            .into_iter()
            .filter(|build| {
                if build.bad {
                    tracing::info!(env_id = %env.id, build_id = %build.id, "build tagged bad, ignoring");
                }
                !build.bad
            })
            .nth(queue_index(config))
            .map(|build| NewDeploy {
                env_id: env.id.clone(),
                build_id: build.id,
                from_deploy: None,
            }))
    }

    /// Good deploys of the predecessor environment newer than the one the
    /// current deploy was promoted from.
    async fn deploy_candidate(
        &self,
        env: &Environment,
        current: Option<&Deploy>,
        config: &PromoteConfig,
        pred_stage: &str,
        end: DateTime<Utc>,
    ) -> ControlResult<Option<NewDeploy>> {
        let Some(pred) = self
            .ctx
            .inventory
            .environment_by_stage(&env.name, pred_stage)
            .await?
        else {
            tracing::warn!(env = %env.name, pred_stage, "predecessor environment does not exist");
            return Ok(None);
        };
        if pred.deploy_id.is_none() {
            tracing::debug!(env = %env.name, pred_stage, "predecessor has no deploy yet");
            return Ok(None);
        }

        let start = match current {
            Some(deploy) => self.promoted_from_date(deploy, &pred).await?,
            None => DateTime::UNIX_EPOCH,
        };
        if end < start {
            return Ok(None);
        }

        let deploys = self
            .ctx
            .deploys
            .deploys_started_between(&pred.id, start, end, self.config.candidate_limit)
            .await?;

        let mut good = Vec::with_capacity(deploys.len());
        for deploy in deploys {
            if !is_good(&deploy) {
                continue;
            }
            let bad_build = self
                .ctx
                .deploys
                .get_build(&deploy.build_id)
                .await?
                .is_some_and(|build| build.bad);
            if !bad_build {
                good.push(deploy);
            }
        }

        Ok(good.into_iter().nth(queue_index(config)).map(|deploy| NewDeploy {
            env_id: env.id.clone(),
            build_id: deploy.build_id,
            from_deploy: Some(deploy.id),
        }))
    }

    /// Start of the predecessor deploy `current` was promoted from, or of
    /// `current` itself if it came from elsewhere.
    async fn promoted_from_date(&self, current: &Deploy, pred: &Environment) -> ControlResult<DateTime<Utc>> {
        let Some(from_id) = &current.from_deploy else {
            return Ok(current.start_date);
        };
        match self.ctx.deploys.get_deploy(from_id).await? {
            Some(from) if from.env_id == pred.id => Ok(from.start_date),
            _ => Ok(current.start_date),
        }
    }

    /// Record `candidate` if the environment still runs `observed`, then
    /// switch to manual promotion when `then_disable` names a failed deploy.
    async fn safe_promote(
        &self,
        env: &Environment,
        observed: Option<String>,
        candidate: NewDeploy,
        then_disable: Option<&str>,
    ) -> ControlResult<PromoteOutcome> {
        let name = lock_name(LOCK_PREFIX, &env.id);
        let inventory = self.ctx.inventory.as_ref();
        let deploys = self.ctx.deploys.as_ref();

        let outcome = with_lock(self.ctx.locks.as_ref(), &name, || async move {
            let fresh = load_environment(inventory, &env.id).await?;
            if fresh.deploy_id != observed {
                tracing::info!(
                    env_id = %env.id,
                    observed = ?observed,
                    current = ?fresh.deploy_id,
                    "environment has a new deploy already, abandoning promotion"
                );
                return Ok(PromoteOutcome::Abandoned);
            }

            let deploy = deploys.create_deploy(&candidate).await?;
            tracing::info!(
                env_id = %env.id,
                deploy_id = %deploy.id,
                build_id = %deploy.build_id,
                from_deploy = ?deploy.from_deploy,
                "promoted"
            );
            if let Some(failed_deploy) = then_disable {
                self.switch_to_manual(env, failed_deploy).await?;
            }
            Ok(PromoteOutcome::Promoted { deploy_id: deploy.id })
        })
        .await?;

        Ok(outcome.unwrap_or(PromoteOutcome::Contended))
    }

    /// Redeploy the last good deploy before `failed`, then switch to manual.
    async fn rollback(&self, env: &Environment, failed: &Deploy) -> ControlResult<PromoteOutcome> {
        let history = self
            .ctx
            .deploys
            .deploys_started_between(&env.id, DateTime::UNIX_EPOCH, failed.start_date, self.config.candidate_limit)
            .await?;

        let Some(target) = history
            .into_iter()
            .find(|deploy| deploy.id != failed.id && is_good(deploy))
        else {
            tracing::warn!(env_id = %env.id, deploy_id = %failed.id, "no good deploy to roll back to");
            return self.disable(env, &failed.id).await;
        };

        let candidate = NewDeploy {
            env_id: env.id.clone(),
            build_id: target.build_id,
            from_deploy: None,
        };
        match self
            .safe_promote(env, Some(failed.id.clone()), candidate, Some(&failed.id))
            .await?
        {
            PromoteOutcome::Promoted { deploy_id } => {
                tracing::info!(env_id = %env.id, failed = %failed.id, deploy_id = %deploy_id, "rolled back failed deploy");
                Ok(PromoteOutcome::RolledBack { deploy_id })
            }
            other => Ok(other),
        }
    }

    /// Switch `env` to manual promotion under its promotion lock.
    async fn disable(&self, env: &Environment, failed_deploy: &str) -> ControlResult<PromoteOutcome> {
        let name = lock_name(LOCK_PREFIX, &env.id);
        let outcome = with_lock(self.ctx.locks.as_ref(), &name, || async move {
            if self.switch_to_manual(env, failed_deploy).await? {
                Ok(PromoteOutcome::Disabled)
            } else {
                Ok(PromoteOutcome::Ineligible)
            }
        })
        .await?;

        Ok(outcome.unwrap_or(PromoteOutcome::Contended))
    }

    /// Must run under the promotion lock of `env`. Returns false when another
    /// worker already switched the environment off auto promotion.
    async fn switch_to_manual(&self, env: &Environment, failed_deploy: &str) -> ControlResult<bool> {
        let still_auto = self
            .ctx
            .deploys
            .promote_config(&env.id)
            .await?
            .is_some_and(|config| config.kind == PromoteKind::Auto);
        if !still_auto {
            tracing::info!(env_id = %env.id, deploy_id = %failed_deploy, "auto promotion already switched off");
            return Ok(false);
        }

        self.ctx
            .deploys
            .set_promote_kind(&env.id, PromoteKind::Manual)
            .await?;
        tracing::info!(env_id = %env.id, deploy_id = %failed_deploy, "auto promotion disabled after failed deploy");

        self.ctx.notifier.notify(
            Notification::new(
                format!("Auto promotion disabled for {}/{}", env.name, env.stage),
                format!(
                    "Deploy {failed_deploy} failed in {}/{}; auto promotion is now manual.",
                    env.name, env.stage
                ),
            )
            .to(&env.recipients.email)
            .in_room(env.recipients.chatroom.as_deref()),
        );
        Ok(true)
    }
}

#[async_trait]
impl Controller for PromotionController {
    type Id = EnvId;

    fn name(&self) -> &'static str {
        "promotion"
    }

    fn lock_prefix(&self) -> Option<&'static str> {
        None
    }

    async fn candidates(&self) -> ControlResult<Vec<EnvId>> {
        self.ctx.deploys.auto_promote_env_ids().await
    }

    async fn process(&self, id: &EnvId) -> ControlResult<()> {
        let outcome = self.promote(id, Utc::now()).await?;
        tracing::debug!(env_id = %id, outcome = ?outcome, "promotion attempted");
        Ok(())
    }
}

/// Whether a new deploy may replace `current`.
fn is_retirable(current: Option<&Deploy>) -> bool {
    let Some(deploy) = current else {
        return true;
    };
    if deploy.state.is_final() {
        // Another worker already moved it on.
        return false;
    }
    deploy.acceptance.is_final() || deploy.state == DeployState::Failing
}

fn is_good(deploy: &Deploy) -> bool {
    matches!(deploy.state, DeployState::Succeeding | DeployState::Succeeded) && !deploy.is_failed()
}

/// Zero-based index of the candidate to promote.
fn queue_index(config: &PromoteConfig) -> usize {
    config.queue_size.max(1) - 1
}
