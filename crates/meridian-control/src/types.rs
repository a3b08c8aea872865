//! Core types for meridian-control: identifiers and the fleet model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }
    };
}

/// Persisted enums are stored by their upper-case names.
macro_rules! persisted_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Get the stored string representation.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("unknown {}: {s}", stringify!($name))),
                }
            }
        }
    };
}

pub(crate) use persisted_enum;

string_id!(
    /// Unique identifier for a work item.
    ItemId
);

impl ItemId {
    /// Generate a new unique item ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

string_id!(
    /// Cloud provider identifier of a compute host.
    HostId
);

string_id!(
    /// Identifier of an environment (one stage of a deployable service).
    EnvId
);

persisted_enum!(
    /// Operator-controlled lifecycle flag on a cluster.
    ClusterState {
        /// Controllers may act on the cluster.
        Normal => "NORMAL",
        /// Every controller touching the cluster holds still.
        Pause => "PAUSE",
    }
);

persisted_enum!(
    /// Whether an environment accepts automated changes.
    EnvState {
        Normal => "NORMAL",
        Disabled => "DISABLED",
    }
);

persisted_enum!(
    /// Lifecycle of a compute host as recorded by the control plane.
    HostState {
        /// Launched; the agent has not checked in yet.
        Provisioned => "PROVISIONED",
        /// The agent is reporting.
        Running => "RUNNING",
        /// Drained; waiting for agents to stop before termination.
        PendingTerminate => "PENDING_TERMINATE",
        /// Termination requested from the provider.
        Terminating => "TERMINATING",
    }
);

impl HostState {
    /// Whether the host is on its way out of the fleet.
    #[must_use]
    pub const fn is_leaving(&self) -> bool {
        matches!(self, Self::PendingTerminate | Self::Terminating)
    }
}

persisted_enum!(
    /// Progress of one agent through a deploy.
    DeployStage {
        Unknown => "UNKNOWN",
        PreDownload => "PRE_DOWNLOAD",
        Downloading => "DOWNLOADING",
        PostDownload => "POST_DOWNLOAD",
        Staging => "STAGING",
        PreRestart => "PRE_RESTART",
        Restarting => "RESTARTING",
        PostRestart => "POST_RESTART",
        ServingBuild => "SERVING_BUILD",
        Stopping => "STOPPING",
        Stopped => "STOPPED",
    }
);

persisted_enum!(
    /// Outcome of the agent's last deploy step.
    AgentStatus {
        Succeeded => "SUCCEEDED",
        Unknown => "UNKNOWN",
        AgentFailed => "AGENT_FAILED",
        RetryFailed => "RETRY_FAILED",
        ScriptFailed => "SCRIPT_FAILED",
        Aborted => "ABORTED",
        ScriptTimeout => "SCRIPT_TIMEOUT",
        TooManyRetry => "TOO_MANY_RETRY",
        RuntimeMismatch => "RUNTIME_MISMATCH",
    }
);

impl AgentStatus {
    /// Statuses an agent passes through on a healthy deploy. A failed script
    /// is retried by the agent itself, so it counts as transient too.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Unknown | Self::ScriptFailed)
    }
}

persisted_enum!(
    /// Operator or system override on an agent.
    AgentState {
        Normal => "NORMAL",
        PausedBySystem => "PAUSED_BY_SYSTEM",
        Stop => "STOP",
    }
);

/// Who hears about a cluster or environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    #[serde(default)]
    pub email: Vec<String>,
    #[serde(default)]
    pub pager: Vec<String>,
    #[serde(default)]
    pub chatroom: Option<String>,
}

/// A named pool of hosts serving one workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub env_id: EnvId,
    pub state: ClusterState,
    /// Image new hosts launch from.
    pub image_id: Option<String>,
    /// How long a launched host may stay PROVISIONED before it counts as failed.
    pub launch_grace_secs: u64,
    pub recipients: Recipients,
    pub last_update: DateTime<Utc>,
}

/// One stage of a deployable service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvId,
    pub name: String,
    pub stage: String,
    pub state: EnvState,
    /// Current deploy, if any.
    pub deploy_id: Option<String>,
    /// Build name auto-promotion draws candidates from.
    pub build_name: String,
    /// How many replacement hosts a cluster upgrade runs in parallel.
    pub max_parallel_replacement: usize,
    pub recipients: Recipients,
}

/// A compute host known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub cluster: String,
    pub state: HostState,
    /// Safe to retire without dropping below serving capacity.
    pub retirable: bool,
    pub last_update: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Per-host, per-environment deploy agent as last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub host_id: HostId,
    pub env_id: EnvId,
    pub deploy_stage: DeployStage,
    pub status: AgentStatus,
    pub state: AgentState,
    pub deploy_start: Option<DateTime<Utc>>,
    pub first_deploy_time: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

impl Agent {
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.deploy_stage == DeployStage::ServingBuild
    }

    /// Not serving and stuck in a status the agent will not recover from.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        !self.is_serving() && !self.status.is_transient()
    }

    /// Whether the agent has let go of its workload.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.deploy_stage == DeployStage::Stopped || self.state == AgentState::PausedBySystem
    }
}

/// A machine image hosts can launch from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub publish_date: DateTime<Utc>,
}

persisted_enum!(
    /// Lifecycle of a deploy within an environment.
    DeployState {
        Running => "RUNNING",
        Failing => "FAILING",
        Succeeding => "SUCCEEDING",
        Succeeded => "SUCCEEDED",
        Aborted => "ABORTED",
    }
);

impl DeployState {
    /// Deploys in these states have been superseded and are history.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Aborted)
    }
}

persisted_enum!(
    /// Verdict of post-deploy acceptance testing.
    AcceptanceStatus {
        PendingDeploy => "PENDING_DEPLOY",
        Outstanding => "OUTSTANDING",
        PendingAccept => "PENDING_ACCEPT",
        Accepted => "ACCEPTED",
        Rejected => "REJECTED",
        Terminated => "TERMINATED",
    }
);

impl AcceptanceStatus {
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Terminated)
    }
}

/// A build rolled out to one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    pub id: String,
    pub env_id: EnvId,
    pub build_id: String,
    pub state: DeployState,
    pub acceptance: AcceptanceStatus,
    pub start_date: DateTime<Utc>,
    /// Deploy in the predecessor environment this one was promoted from.
    pub from_deploy: Option<String>,
}

impl Deploy {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == DeployState::Failing || self.acceptance == AcceptanceStatus::Rejected
    }
}

/// A published build artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub name: String,
    pub publish_date: DateTime<Utc>,
    /// Tagged bad by an operator; never promoted.
    pub bad: bool,
}

persisted_enum!(
    /// Whether an environment promotes on its own.
    PromoteKind {
        Manual => "MANUAL",
        Auto => "AUTO",
    }
);

persisted_enum!(
    /// What auto-promotion does when the current deploy failed.
    PromoteFailPolicy {
        /// Keep promoting newer candidates.
        Continue => "CONTINUE",
        /// Switch the environment to manual promotion.
        Disable => "DISABLE",
        /// Roll back to the last good deploy and switch to manual.
        Rollback => "ROLLBACK",
    }
);

/// Predecessor stage value meaning "promote fresh builds".
pub const BUILD_STAGE: &str = "BUILD";

/// Auto-promotion settings of one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteConfig {
    pub env_id: EnvId,
    pub kind: PromoteKind,
    /// Stage to promote from, or [`BUILD_STAGE`].
    pub pred_stage: Option<String>,
    /// Promote the `queue_size`-th newest candidate.
    pub queue_size: usize,
    /// Candidates younger than this are not promoted yet.
    pub delay_minutes: u32,
    pub fail_policy: PromoteFailPolicy,
}

persisted_enum!(
    /// Progress of mirroring one host tag into the control plane.
    TagSyncState {
        Init => "INIT",
        Processing => "PROCESSING",
        Finished => "FINISHED",
        Error => "ERROR",
    }
);

/// Binds an environment to a provider host tag that must be mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConstraint {
    pub id: String,
    pub env_id: EnvId,
    pub tag_name: String,
    pub state: TagSyncState,
    pub last_update: DateTime<Utc>,
}

/// Mirrored value of a provider tag on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTag {
    pub host_id: HostId,
    pub env_id: EnvId,
    pub tag_name: String,
    pub tag_value: Option<String>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(AgentStatus::Succeeded, true)]
    #[case(AgentStatus::Unknown, true)]
    #[case(AgentStatus::ScriptFailed, true)]
    #[case(AgentStatus::AgentFailed, false)]
    #[case(AgentStatus::TooManyRetry, false)]
    #[case(AgentStatus::ScriptTimeout, false)]
    fn transient_agent_statuses(#[case] status: AgentStatus, #[case] transient: bool) {
        assert_eq!(status.is_transient(), transient);
    }

    #[test]
    fn serving_agent_is_never_failed() {
        let agent = Agent {
            host_id: HostId::new("i-1"),
            env_id: EnvId::new("env"),
            deploy_stage: DeployStage::ServingBuild,
            status: AgentStatus::TooManyRetry,
            state: AgentState::Normal,
            deploy_start: None,
            first_deploy_time: None,
            last_update: Utc::now(),
        };
        assert!(agent.is_serving());
        assert!(!agent.is_failed());
    }

    #[test]
    fn persisted_enums_round_trip_through_strings() {
        assert_eq!(HostState::PendingTerminate.as_str(), "PENDING_TERMINATE");
        assert_eq!(
            "PENDING_TERMINATE".parse::<HostState>(),
            Ok(HostState::PendingTerminate)
        );
        assert!("pending".parse::<HostState>().is_err());
        assert_eq!(
            serde_json::to_string(&DeployStage::ServingBuild).ok(),
            Some("\"SERVING_BUILD\"".to_owned())
        );
    }

    #[test]
    fn generated_item_ids_are_unique_and_lowercase() {
        let a = ItemId::generate();
        let b = ItemId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), a.as_str().to_lowercase());
    }
}
