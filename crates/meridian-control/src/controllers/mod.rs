//! Concrete reconcilers.
//!
//! | Controller | Lock prefix | Work item |
//! |---|---|---|
//! | [`ClusterReplacementController`] | `CLUSTERREPLACER` | [`ClusterUpgradeEvent`](crate::item::ClusterUpgradeEvent) |
//! | [`HealthCheckController`] | `HEALTHCHECK` | [`HealthCheck`](crate::item::HealthCheck) |
//! | [`PromotionController`] | `PROMOTE` | environment |
//! | [`TerminationController`] | `HOSTTERMINATOR` | host |
//! | [`TagSyncController`] | `DEPLOYTAG` | deploy constraint |

mod health_check;
mod promotion;
mod replacement;
mod tag_sync;
mod termination;

pub use health_check::{HealthCheckController, HealthCheckFsm, UPDATE_IMAGE_LOCK_PREFIX};
pub use promotion::{PromoteOutcome, PromotionController};
pub use replacement::{ClusterReplacementController, ReplacementFsm};
pub use tag_sync::TagSyncController;
pub use termination::TerminationController;

use crate::error::{ControlError, ControlResult};
use crate::store::FleetStore;
use crate::types::{Cluster, ClusterState, EnvId, Environment};

async fn load_cluster(inventory: &dyn FleetStore, name: &str) -> ControlResult<Cluster> {
    inventory
        .get_cluster(name)
        .await?
        .ok_or_else(|| ControlError::not_found("cluster", name))
}

async fn load_environment(inventory: &dyn FleetStore, id: &EnvId) -> ControlResult<Environment> {
    inventory
        .get_environment(id)
        .await?
        .ok_or_else(|| ControlError::not_found("environment", id))
}

async fn cluster_paused(inventory: &dyn FleetStore, name: &str) -> ControlResult<bool> {
    Ok(load_cluster(inventory, name).await?.state == ClusterState::Pause)
}

/// Hand the cluster back to normal operation.
async fn restore_cluster(inventory: &dyn FleetStore, name: &str) -> ControlResult<()> {
    inventory.set_cluster_state(name, ClusterState::Normal).await?;
    tracing::info!(cluster = %name, "cluster restored to NORMAL");
    Ok(())
}
