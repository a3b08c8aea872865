//! Generic driver for work items that move through a finite state machine.
//!
//! A concrete controller supplies an [`FsmDescriptor`]: which states are
//! active, how long an item may go without progress, whether its cluster is
//! paused, and what one step in each state does. [`FiniteStateController`]
//! wraps every step in the same bookkeeping:
//!
//! 1. re-read the item; terminal items are left alone
//! 2. paused: refresh the heartbeat and stop
//! 3. timed out: force the descriptor's timeout transition, notify, stop
//! 4. otherwise run the step and persist the result

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{ControlError, ControlResult};
use crate::item::{ItemState, ItemStatus, WorkItem};
use crate::store::WorkItemStore;
use crate::types::ItemId;

use super::Controller;

/// Outcome of one step of a state's logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<S> {
    /// Move to `to`. A `None` status keeps the previous one.
    Transition {
        to: S,
        status: Option<ItemStatus>,
        error: Option<String>,
    },
    /// Remain in the current state; the heartbeat is still refreshed.
    Stay,
}

impl<S> Step<S> {
    #[must_use]
    pub fn to(to: S, status: ItemStatus) -> Self {
        Self::Transition {
            to,
            status: Some(status),
            error: None,
        }
    }

    /// Move to `to` without touching the status.
    #[must_use]
    pub fn keep_status(to: S) -> Self {
        Self::Transition {
            to,
            status: None,
            error: None,
        }
    }

    #[must_use]
    pub fn fail(to: S, error: impl Into<String>) -> Self {
        Self::Transition {
            to,
            status: Some(ItemStatus::Failed),
            error: Some(error.into()),
        }
    }
}

/// What [`FiniteStateController::advance`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance<S> {
    /// Already terminal.
    Skipped,
    Paused,
    TimedOut { from: S, to: S },
    Transitioned { from: S, to: S },
    Stayed,
}

/// Per-controller definition of a work item lifecycle.
#[async_trait]
pub trait FsmDescriptor: Send + Sync + 'static {
    type Item: WorkItem;

    const NAME: &'static str;
    const LOCK_PREFIX: &'static str;

    /// States whose items are picked up each tick.
    fn active_states(&self) -> &'static [<Self::Item as WorkItem>::State];

    /// Longest tolerated gap since [`Self::timeout_basis`].
    fn timeout(&self) -> Duration;

    fn timeout_basis(&self, item: &Self::Item) -> DateTime<Utc> {
        item.header().last_worked_on
    }

    /// Where a timed-out item in `from` is sent.
    fn timeout_target(
        &self,
        from: <Self::Item as WorkItem>::State,
    ) -> <Self::Item as WorkItem>::State;

    fn timeout_message(&self, item: &Self::Item) -> String;

    /// Whether the item's owner has asked controllers to hold still.
    async fn is_paused(&self, item: &Self::Item) -> ControlResult<bool>;

    /// Side effects of a forced timeout, run after the item is persisted.
    async fn on_timeout(
        &self,
        item: &Self::Item,
        from: <Self::Item as WorkItem>::State,
    ) -> ControlResult<()>;

    /// Run the logic of the item's current state.
    ///
    /// The step may change the item and checkpoint it through the store
    /// before returning; the engine persists it again afterwards.
    async fn step(
        &self,
        item: &mut Self::Item,
        now: DateTime<Utc>,
    ) -> ControlResult<Step<<Self::Item as WorkItem>::State>>;
}

/// Drives items of one kind through the FSM described by `D`.
pub struct FiniteStateController<D: FsmDescriptor> {
    descriptor: D,
    items: Arc<dyn WorkItemStore<D::Item>>,
}

type StateOf<D> = <<D as FsmDescriptor>::Item as WorkItem>::State;

impl<D: FsmDescriptor> FiniteStateController<D> {
    pub fn new(descriptor: D, items: Arc<dyn WorkItemStore<D::Item>>) -> Self {
        Self { descriptor, items }
    }

    pub fn descriptor(&self) -> &D {
        &self.descriptor
    }

    /// Advance item `id` by at most one step.
    ///
    /// Must be called with the item's lock held.
    pub async fn advance(&self, id: &ItemId, now: DateTime<Utc>) -> ControlResult<Advance<StateOf<D>>> {
        let Some(mut item) = self.items.get(id).await? else {
            return Err(ControlError::not_found(<D::Item as WorkItem>::KIND, id));
        };

        let from = item.state();
        if from.is_terminal() {
            tracing::debug!(item_id = %id, state = %from, "item already terminal");
            return Ok(Advance::Skipped);
        }

        if self.descriptor.is_paused(&item).await? {
            item.header_mut().last_worked_on = now;
            self.items.update(&item).await?;
            tracing::info!(
                controller = D::NAME,
                item_id = %id,
                cluster = %item.owner(),
                state = %from,
                "cluster paused, holding"
            );
            return Ok(Advance::Paused);
        }

        if now - self.descriptor.timeout_basis(&item) > self.descriptor.timeout() {
            return self.time_out(item, from, now).await;
        }

        let step = self.descriptor.step(&mut item, now).await?;
        item.header_mut().last_worked_on = now;

        match step {
            Step::Stay => {
                self.items.update(&item).await?;
                tracing::debug!(controller = D::NAME, item_id = %id, state = %from, "no transition");
                Ok(Advance::Stayed)
            }
            Step::Transition { to, status, error } => {
                item.set_state(to);
                let header = item.header_mut();
                header.state_start_time = now;
                if status.is_some() {
                    header.status = status;
                }
                if error.is_some() {
                    header.error_message = error;
                }
                self.items.update(&item).await?;
                tracing::info!(
                    controller = D::NAME,
                    item_id = %id,
                    cluster = %item.owner(),
                    from = %from,
                    to = %to,
                    status = ?item.header().status,
                    "transitioned"
                );
                Ok(Advance::Transitioned { from, to })
            }
        }
    }

    async fn time_out(
        &self,
        mut item: D::Item,
        from: StateOf<D>,
        now: DateTime<Utc>,
    ) -> ControlResult<Advance<StateOf<D>>> {
        let to = self.descriptor.timeout_target(from);
        let message = self.descriptor.timeout_message(&item);

        item.set_state(to);
        let header = item.header_mut();
        header.status = Some(ItemStatus::Timeout);
        header.error_message = Some(message);
        header.state_start_time = now;
        header.last_worked_on = now;
        self.items.update(&item).await?;

        tracing::warn!(
            controller = D::NAME,
            item_id = %item.id(),
            cluster = %item.owner(),
            from = %from,
            to = %to,
            "timed out"
        );

        if let Err(e) = self.descriptor.on_timeout(&item, from).await {
            tracing::warn!(
                controller = D::NAME,
                item_id = %item.id(),
                error = %e,
                "timeout follow-up failed"
            );
        }
        Ok(Advance::TimedOut { from, to })
    }
}

#[async_trait]
impl<D: FsmDescriptor> Controller for FiniteStateController<D> {
    type Id = ItemId;

    fn name(&self) -> &'static str {
        D::NAME
    }

    fn lock_prefix(&self) -> Option<&'static str> {
        Some(D::LOCK_PREFIX)
    }

    async fn candidates(&self) -> ControlResult<Vec<ItemId>> {
        self.items
            .list_ids_in_states(self.descriptor.active_states())
            .await
    }

    async fn process(&self, id: &ItemId) -> ControlResult<()> {
        self.advance(id, Utc::now()).await.map(|_| ())
    }
}
