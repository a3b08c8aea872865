//! Controller engine shared by every reconciler.
//!
//! [`ControllerTick`] is the outer loop: list candidates, shuffle them with
//! the [`WorkItemSelector`], and process each under its advisory lock.
//! [`FiniteStateController`] adapts an [`FsmDescriptor`] into a
//! [`Controller`] with the pause, timeout and heartbeat rules applied
//! uniformly.

mod fsm;
mod selector;
mod tick;

pub use fsm::{Advance, FiniteStateController, FsmDescriptor, Step};
pub use selector::WorkItemSelector;
pub use tick::{lock_name, with_lock, Controller, ControllerTick, TickReport};
