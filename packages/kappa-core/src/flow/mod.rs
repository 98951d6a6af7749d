//! Flow: binds one source to one view and drives pull -> transform -> map ->
//! commit until the source has no more work.

mod actor;
mod handle;
mod state;

pub use handle::{FlowHandle, FlowOptions};
pub use state::{FlowState, FlowStatus};

pub(crate) use handle::FlowSettings;

use crate::error::KappaError;

/// Notification published by a flow.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    StateUpdate(FlowState),
    Error(KappaError),
    /// The flow caught up and has no pending cycle
    Idle,
}
