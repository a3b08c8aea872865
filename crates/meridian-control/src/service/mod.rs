//! Service lifecycle management.
//!
//! Wires the collaborators named by the configuration, then runs every
//! enabled controller on its own interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meridian_state::{lock_backend_from_config, LockBackend};
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{interval, ControlConfig, StoreBackend};
use crate::context::Collaborators;
use crate::controllers::{HealthCheckFsm, PromotionController, ReplacementFsm, TagSyncController, TerminationController};
use crate::engine::{Controller, ControllerTick, TickReport, WorkItemSelector};
use crate::error::{ControlError, ControlResult};
use crate::fleet::create_fleet;
use crate::notify::{create_sink, Notifier};
use crate::store::{MemoryStore, PostgresStore};

/// A controller the service can tick without knowing its item type.
#[async_trait]
trait Tickable: Send + Sync {
    async fn tick(&self, runner: &ControllerTick) -> TickReport;
}

#[async_trait]
impl<C: Controller> Tickable for C {
    async fn tick(&self, runner: &ControllerTick) -> TickReport {
        runner.run(self).await
    }
}

/// A controller and how often it runs.
#[derive(Clone)]
struct Scheduled {
    name: &'static str,
    every: Duration,
    controller: Arc<dyn Tickable>,
}

/// The enabled controllers, ready to tick.
pub struct Workers {
    runner: ControllerTick,
    scheduled: Vec<Scheduled>,
}

impl Workers {
    /// Build the enabled controllers of `config` on top of `ctx`.
    #[must_use]
    pub fn new(config: &ControlConfig, ctx: &Collaborators) -> Self {
        let selector = Arc::new(WorkItemSelector::from_seed(config.selector.seed));
        let runner = ControllerTick::new(ctx.locks.clone(), selector);
        let mut scheduled = Vec::new();

        if config.replacement.enabled {
            scheduled.push(Scheduled {
                name: "replacement",
                every: interval(config.replacement.interval_secs),
                controller: Arc::new(
                    ReplacementFsm::new(ctx.clone(), config.replacement.clone()).into_controller(),
                ),
            });
        }
        if config.health_check.enabled {
            scheduled.push(Scheduled {
                name: "health_check",
                every: interval(config.health_check.interval_secs),
                controller: Arc::new(
                    HealthCheckFsm::new(ctx.clone(), config.health_check.clone()).into_controller(),
                ),
            });
        }
        if config.promotion.enabled {
            scheduled.push(Scheduled {
                name: "promotion",
                every: interval(config.promotion.interval_secs),
                controller: Arc::new(PromotionController::new(ctx.clone(), config.promotion.clone())),
            });
        }
        if config.termination.enabled {
            scheduled.push(Scheduled {
                name: "termination",
                every: interval(config.termination.interval_secs),
                controller: Arc::new(TerminationController::new(ctx.clone())),
            });
        }
        if config.tag_sync.enabled {
            scheduled.push(Scheduled {
                name: "tag_sync",
                every: interval(config.tag_sync.interval_secs),
                controller: Arc::new(TagSyncController::new(ctx.clone(), config.tag_sync.clone())),
            });
        }

        Self { runner, scheduled }
    }

    /// Names of the enabled controllers.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.scheduled.iter().map(|s| s.name).collect()
    }

    /// Tick every enabled controller once, in order.
    pub async fn run_once(&self) -> Vec<(&'static str, TickReport)> {
        let mut reports = Vec::with_capacity(self.scheduled.len());
        for scheduled in &self.scheduled {
            let report = scheduled.controller.tick(&self.runner).await;
            reports.push((scheduled.name, report));
        }
        reports
    }

    /// Run every controller on its interval until `cancel` fires. A tick in
    /// progress finishes before its loop stops.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut loops = JoinSet::new();
        for scheduled in self.scheduled.clone() {
            loops.spawn(run_loop(self.runner.clone(), scheduled, cancel.clone()));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "controller loop aborted");
            }
        }
    }
}

async fn run_loop(runner: ControllerTick, scheduled: Scheduled, cancel: CancellationToken) {
    info!(controller = scheduled.name, every = ?scheduled.every, "controller loop started");

    let mut ticker = tokio::time::interval(scheduled.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                info!(controller = scheduled.name, "controller loop shutting down");
                break;
            }

            _ = ticker.tick() => {
                let report = scheduled.controller.tick(&runner).await;
                if report.failed > 0 {
                    tracing::warn!(
                        controller = scheduled.name,
                        failed = report.failed,
                        processed = report.processed,
                        "tick finished with failures"
                    );
                }
            }
        }
    }
}

/// The control service.
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the enabled controllers until SIGINT, SIGTERM or [`Self::shutdown`].
    pub async fn run(&self) -> ControlResult<()> {
        let ctx = self.collaborators().await?;
        let workers = Workers::new(&self.config, &ctx);
        info!(controllers = ?workers.names(), "control service started");

        let loops = workers.run(self.cancel.clone());
        tokio::pin!(loops);

        tokio::select! {
            () = &mut loops => {}
            () = shutdown_signal(self.cancel.clone()) => {
                self.cancel.cancel();
                loops.await;
            }
        }

        info!("control service shutdown complete");
        Ok(())
    }

    /// Tick every enabled controller once and return what each did.
    pub async fn run_once(&self) -> ControlResult<Vec<(&'static str, TickReport)>> {
        let ctx = self.collaborators().await?;
        Ok(Workers::new(&self.config, &ctx).run_once().await)
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn collaborators(&self) -> ControlResult<Collaborators> {
        let locks = self.create_locks().await?;
        let fleet = create_fleet(&self.config.fleet)?;
        info!(backend = ?self.config.fleet.backend, "fleet client configured");
        let notifier = Notifier::new(create_sink(&self.config.notifications)?);

        match self.config.store.backend {
            StoreBackend::Memory => {
                info!("using in-memory store");
                Ok(Collaborators::new(Arc::new(MemoryStore::new()), locks, fleet, notifier))
            }
            StoreBackend::Postgres => {
                let store = PostgresStore::new(&self.config.database).await?;
                info!(url = %self.config.database.url, "connected to PostgreSQL");
                Ok(Collaborators::new(Arc::new(store), locks, fleet, notifier))
            }
        }
    }

    async fn create_locks(&self) -> ControlResult<Arc<dyn LockBackend>> {
        let locks = lock_backend_from_config(&self.config.lock)
            .await
            .map_err(|e| ControlError::Config(format!("lock backend: {e}")))?;
        info!(backend = ?self.config.lock, "advisory lock backend configured");
        Ok(locks)
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
