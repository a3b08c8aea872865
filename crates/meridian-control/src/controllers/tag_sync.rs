//! Mirroring provider host tags for deploy constraints.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::config::TagSyncConfig;
use crate::context::Collaborators;
use crate::engine::Controller;
use crate::error::ControlResult;
use crate::types::{DeployConstraint, HostId, HostTag, TagSyncState};

/// Lock prefix of tag sync.
pub const LOCK_PREFIX: &str = "DEPLOYTAG";

/// Keeps the host tag records of each constraint equal to the hosts of its
/// environment.
pub struct TagSyncController {
    ctx: Collaborators,
    config: TagSyncConfig,
}

impl TagSyncController {
    #[must_use]
    pub fn new(ctx: Collaborators, config: TagSyncConfig) -> Self {
        Self { ctx, config }
    }

    async fn sync(&self, constraint: &DeployConstraint) -> ControlResult<()> {
        let env_id = &constraint.env_id;
        let tag = &constraint.tag_name;
        if self.ctx.inventory.get_environment(env_id).await?.is_none() {
            tracing::warn!(constraint = %constraint.id, env_id = %env_id, "environment not found for constraint");
            return Ok(());
        }

        let desired = self.ctx.inventory.env_host_ids(env_id).await?;
        let observed = self.ctx.tags.tagged_host_ids(env_id, tag).await?;

        let missing: Vec<HostId> = desired.difference(&observed).cloned().collect();
        let extra: Vec<HostId> = observed.difference(&desired).cloned().collect();

        if missing.is_empty() && extra.is_empty() {
            if constraint.state != TagSyncState::Finished {
                self.ctx
                    .tags
                    .set_constraint_state(&constraint.id, TagSyncState::Finished)
                    .await?;
                tracing::info!(constraint = %constraint.id, env_id = %env_id, "host tags in sync");
            }
            return Ok(());
        }

        tracing::info!(
            constraint = %constraint.id,
            env_id = %env_id,
            missing = missing.len(),
            extra = extra.len(),
            "host tags out of sync"
        );
        self.ctx
            .tags
            .set_constraint_state(&constraint.id, TagSyncState::Processing)
            .await?;

        if !extra.is_empty() {
            self.ctx.tags.delete_host_tags(env_id, tag, &extra).await?;
            tracing::info!(env_id = %env_id, removed = extra.len(), "removed stale host tags");
        }

        if !missing.is_empty() {
            let tags = self.fetch_tags(constraint, &missing).await?;
            self.ctx.tags.insert_host_tags(&tags).await?;
            tracing::info!(env_id = %env_id, inserted = tags.len(), "mirrored host tags");
        }
        Ok(())
    }

    /// Ask the provider for `tag` on `ids`, in batches.
    async fn fetch_tags(&self, constraint: &DeployConstraint, ids: &[HostId]) -> ControlResult<Vec<HostTag>> {
        let mut tags = Vec::with_capacity(ids.len());
        let mut seen = BTreeSet::new();

        for batch in ids.chunks(self.config.batch_size.max(1)) {
            let values = self
                .ctx
                .fleet
                .host_tags(batch, &constraint.tag_name)
                .await?;
            for id in batch {
                let Some(value) = values.get(id) else {
                    continue;
                };
                if seen.insert(id.clone()) {
                    tags.push(HostTag {
                        host_id: id.clone(),
                        env_id: constraint.env_id.clone(),
                        tag_name: constraint.tag_name.clone(),
                        tag_value: Some(value.clone()),
                    });
                }
            }
        }
        Ok(tags)
    }
}

#[async_trait]
impl Controller for TagSyncController {
    type Id = String;

    fn name(&self) -> &'static str {
        "tag_sync"
    }

    fn lock_prefix(&self) -> Option<&'static str> {
        Some(LOCK_PREFIX)
    }

    async fn candidates(&self) -> ControlResult<Vec<String>> {
        self.ctx
            .tags
            .constraint_ids_in_states(&[TagSyncState::Init, TagSyncState::Processing])
            .await
    }

    async fn process(&self, id: &String) -> ControlResult<()> {
        let Some(constraint) = self.ctx.tags.get_constraint(id).await? else {
            return Ok(());
        };

        match self.sync(&constraint).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                tracing::error!(constraint = %id, error = %e, "tag sync failed, marking constraint ERROR");
                self.ctx
                    .tags
                    .set_constraint_state(id, TagSyncState::Error)
                    .await?;
                Err(e)
            }
        }
    }
}
