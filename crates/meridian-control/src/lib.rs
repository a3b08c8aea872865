//! Meridian control plane
//!
//! This crate drives long-running deployment operations across a fleet of
//! hosts: rolling cluster replacement, image health checks, automatic
//! promotion between environments, host termination and host tag mirroring.
//!
//! # Architecture
//!
//! Every controller runs the same loop on every worker process:
//!
//! 1. list candidate item IDs (without locks, possibly stale)
//! 2. shuffle them with the [`WorkItemSelector`](engine::WorkItemSelector)
//! 3. for each ID, take a named advisory lock without waiting; skip on
//!    contention
//! 4. re-read the item and advance it at most one step
//! 5. release the lock on every exit path
//!
//! Workers never talk to each other. The advisory locks of
//! [`meridian_state`] are the only coordination, so any number of workers
//! can run side by side.
//!
//! Multi-step operations are work items driven by a generic
//! [`FiniteStateController`](engine::FiniteStateController). A controller
//! supplies an [`FsmDescriptor`](engine::FsmDescriptor) with its active
//! states, step function and timeout policy; the engine handles pause,
//! timeout, heartbeats and persistence.
//!
//! ```text
//! INIT ──▶ LAUNCHING ──▶ REPLACING ──▶ COMPLETING ──▶ COMPLETED
//!  ▲            │
//!  └────────────┘  (a launched host died)
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod agents;
pub mod config;
pub mod context;
pub mod controllers;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod item;
pub mod notify;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use context::Collaborators;
pub use controllers::{
    ClusterReplacementController, HealthCheckController, PromoteOutcome, PromotionController,
    TagSyncController, TerminationController,
};
pub use engine::{Controller, ControllerTick, FiniteStateController, TickReport, WorkItemSelector};
pub use error::{ControlError, ControlResult};
pub use fleet::{CloudFleetApi, HttpFleet, MockFleet};
pub use item::{ClusterUpgradeEvent, HealthCheck, ItemStatus, WorkItem};
pub use notify::{Notification, NotificationSink, Notifier};
pub use service::ControlService;
pub use store::{MemoryStore, PostgresStore};
