//! Background sync machinery: the coordinator that drains the queue, the
//! debounce scheduler, the trigger loop, and event fan-out.

mod broadcast;
mod coordinator;
mod run;
mod scheduler;

pub use broadcast::{
    BroadcastError, BroadcasterLimits, DropReason, EventBatch, EventBroadcaster,
    EventSubscription,
};
pub use coordinator::{DrainReport, SyncCoordinator, SyncPolicy};
pub use run::{spawn_sync_loop, SyncHandle, Trigger};
pub use scheduler::DrainScheduler;
