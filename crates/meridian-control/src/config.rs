//! Configuration for meridian-control.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use meridian_state::LockConfig;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Advisory lock backend.
    #[serde(default)]
    pub lock: LockConfig,

    /// Persistent store backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Cloud fleet client configuration.
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Operator notification delivery.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Candidate ordering.
    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub replacement: ReplacementConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub promotion: PromotionConfig,

    #[serde(default)]
    pub termination: TerminationConfig,

    #[serde(default)]
    pub tag_sync: TagSyncConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `control.toml` in the current directory (if present)
    /// 3. Environment variables with `MERIDIAN_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file("control.toml"))
            .merge(Env::prefixed("MERIDIAN_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MERIDIAN_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/meridian".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Where work items and fleet records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process tables, lost on restart.
    #[default]
    Memory,

    /// PostgreSQL at `database.url`.
    Postgres,
}

/// Persistent store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

/// Type of fleet client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetBackend {
    /// Provisioning service over HTTP.
    Http,

    /// In-memory fleet for testing.
    #[default]
    Mock,
}

/// Cloud fleet client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub backend: FleetBackend,

    /// Base URL of the provisioning service.
    #[serde(default = "default_fleet_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_fleet_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fleet_url() -> String {
    "http://localhost:8090".to_owned()
}

const fn default_fleet_timeout_secs() -> u64 {
    30
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            backend: FleetBackend::default(),
            url: default_fleet_url(),
            timeout_secs: default_fleet_timeout_secs(),
        }
    }
}

/// Type of notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationBackend {
    #[default]
    Log,
    Webhook,
}

/// Notification delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub backend: NotificationBackend,

    /// Endpoint for the webhook backend.
    pub webhook_url: Option<String>,

    /// Delivery timeout in seconds.
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_notification_timeout_secs() -> u64 {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            backend: NotificationBackend::default(),
            webhook_url: None,
            timeout_secs: default_notification_timeout_secs(),
        }
    }
}

/// Candidate ordering configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectorConfig {
    /// Fixed shuffle seed. Unset means seeded from the OS.
    pub seed: Option<u64>,
}

const fn default_enabled() -> bool {
    true
}

const fn default_interval_secs() -> u64 {
    30
}

const fn default_item_timeout_secs() -> u64 {
    1800 // 30 minutes
}

/// Cluster replacement controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplacementConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Seconds an event may go without progress before it is timed out.
    #[serde(default = "default_item_timeout_secs")]
    pub timeout_secs: u64,

    /// Most hosts requested from the provider in one launch call.
    #[serde(default = "default_launch_batch")]
    pub launch_batch: usize,
}

const fn default_launch_batch() -> usize {
    50
}

impl Default for ReplacementConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_item_timeout_secs(),
            launch_batch: default_launch_batch(),
        }
    }
}

/// Health check controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Seconds a check may stay in one state.
    #[serde(default = "default_item_timeout_secs")]
    pub timeout_secs: u64,

    /// Consecutive failed checks of a cluster before on-call is paged.
    #[serde(default = "default_failures_before_page")]
    pub failures_before_page: usize,
}

const fn default_failures_before_page() -> usize {
    3
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_item_timeout_secs(),
            failures_before_page: default_failures_before_page(),
        }
    }
}

/// Promotion controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PromotionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_promotion_interval_secs")]
    pub interval_secs: u64,

    /// Most candidate builds or deploys considered per environment.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
}

const fn default_promotion_interval_secs() -> u64 {
    60
}

const fn default_candidate_limit() -> usize {
    100
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_promotion_interval_secs(),
            candidate_limit: default_candidate_limit(),
        }
    }
}

/// Host termination controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Host tag sync controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TagSyncConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Hosts per provider tag lookup.
    #[serde(default = "default_tag_batch")]
    pub batch_size: usize,
}

const fn default_tag_batch() -> usize {
    200
}

impl Default for TagSyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            batch_size: default_tag_batch(),
        }
    }
}

/// Tick interval of `secs`, never zero.
#[must_use]
pub fn interval(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}
