//! Work items: long-running operations advanced one step per controller tick.
//!
//! Every work item carries an [`ItemHeader`] with the bookkeeping the generic
//! engine needs (status of the last transition, when the current state was
//! entered, the progress heartbeat) and a type-specific state enum. Items are
//! persisted as whole records; a controller holding the item's lock reads
//! one, changes it in memory and writes it back in full.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{persisted_enum, EnvId, HostId, ItemId};

persisted_enum!(
    /// Outcome of the last transition, orthogonal to the state.
    ItemStatus {
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        Timeout => "TIMEOUT",
        /// Health check verified the image.
        Qualified => "QUALIFIED",
    }
);

/// State enum of one kind of work item.
pub trait ItemState:
    Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The state no transition ever leaves.
    const TERMINAL: Self;

    /// Get the stored string representation.
    fn as_str(&self) -> &'static str;

    fn is_terminal(&self) -> bool {
        *self == Self::TERMINAL
    }
}

/// Bookkeeping shared by every work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHeader {
    pub id: ItemId,
    pub status: Option<ItemStatus>,
    pub state_start_time: DateTime<Utc>,
    /// Progress heartbeat, refreshed by every successful tick.
    pub last_worked_on: DateTime<Utc>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ItemHeader {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: ItemId::generate(),
            status: None,
            state_start_time: now,
            last_worked_on: now,
            error_message: None,
            created_at: now,
        }
    }
}

/// A persisted unit of work driven by a finite-state controller.
pub trait WorkItem: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    type State: ItemState;

    /// Record kind used by stores and in log fields.
    const KIND: &'static str;

    fn header(&self) -> &ItemHeader;

    fn header_mut(&mut self) -> &mut ItemHeader;

    fn state(&self) -> Self::State;

    fn set_state(&mut self, state: Self::State);

    /// Name of the cluster the item acts on.
    fn owner(&self) -> &str;

    fn id(&self) -> &ItemId {
        &self.header().id
    }
}

persisted_enum!(
    /// States of a rolling cluster replacement.
    UpgradeState {
        Init => "INIT",
        Launching => "LAUNCHING",
        Replacing => "REPLACING",
        Completing => "COMPLETING",
        Completed => "COMPLETED",
    }
);

impl ItemState for UpgradeState {
    const TERMINAL: Self = Self::Completed;

    fn as_str(&self) -> &'static str {
        UpgradeState::as_str(self)
    }
}

/// Rolling replacement of every host in a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterUpgradeEvent {
    #[serde(flatten)]
    pub header: ItemHeader,
    pub cluster: String,
    pub env_id: EnvId,
    pub state: UpgradeState,
    /// Temporary hosts launched outside the pool and not yet reconciled.
    #[serde(default)]
    pub host_ids: BTreeSet<HostId>,
}

impl ClusterUpgradeEvent {
    #[must_use]
    pub fn new(cluster: impl Into<String>, env_id: EnvId, now: DateTime<Utc>) -> Self {
        Self {
            header: ItemHeader::new(now),
            cluster: cluster.into(),
            env_id,
            state: UpgradeState::Init,
            host_ids: BTreeSet::new(),
        }
    }
}

impl WorkItem for ClusterUpgradeEvent {
    type State = UpgradeState;

    const KIND: &'static str = "cluster_upgrade_event";

    fn header(&self) -> &ItemHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ItemHeader {
        &mut self.header
    }

    fn state(&self) -> UpgradeState {
        self.state
    }

    fn set_state(&mut self, state: UpgradeState) {
        self.state = state;
    }

    fn owner(&self) -> &str {
        &self.cluster
    }
}

persisted_enum!(
    /// States of a health check.
    HealthCheckState {
        Init => "INIT",
        Launching => "LAUNCHING",
        PendingVerify => "PENDING_VERIFY",
        Completing => "COMPLETING",
        Completed => "COMPLETED",
    }
);

impl ItemState for HealthCheckState {
    const TERMINAL: Self = Self::Completed;

    fn as_str(&self) -> &'static str {
        HealthCheckState::as_str(self)
    }
}

persisted_enum!(
    /// What started a health check.
    HealthCheckKind {
        /// A new image was published for the cluster.
        AmiTriggered => "AMI_TRIGGERED",
        /// Periodic verification of the current image.
        TimeTriggered => "TIME_TRIGGERED",
        ManuallyTriggered => "MANUALLY_TRIGGERED",
    }
);

/// Verification of an image by deploying the environment onto one probe host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(flatten)]
    pub header: ItemHeader,
    pub cluster: String,
    pub env_id: EnvId,
    pub state: HealthCheckState,
    pub kind: HealthCheckKind,
    pub image_id: String,
    pub host_id: Option<HostId>,
    pub host_launch_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub host_terminated: bool,
    pub deploy_start_time: Option<DateTime<Utc>>,
    pub deploy_complete_time: Option<DateTime<Utc>>,
}

impl HealthCheck {
    #[must_use]
    pub fn new(
        cluster: impl Into<String>,
        env_id: EnvId,
        kind: HealthCheckKind,
        image_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            header: ItemHeader::new(now),
            cluster: cluster.into(),
            env_id,
            state: HealthCheckState::Init,
            kind,
            image_id: image_id.into(),
            host_id: None,
            host_launch_time: None,
            host_terminated: false,
            deploy_start_time: None,
            deploy_complete_time: None,
        }
    }
}

impl WorkItem for HealthCheck {
    type State = HealthCheckState;

    const KIND: &'static str = "health_check";

    fn header(&self) -> &ItemHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ItemHeader {
        &mut self.header
    }

    fn state(&self) -> HealthCheckState {
        self.state
    }

    fn set_state(&mut self, state: HealthCheckState) {
        self.state = state;
    }

    fn owner(&self) -> &str {
        &self.cluster
    }
}
