//! Domain types shared across the engine.

mod event;
mod metadata;
mod mutation;
mod part;
mod time;

pub use event::{LedgerEvent, PartHistory, SyncStatus, TxStatus, VerifyOutcome};
pub use metadata::Metadata;
pub use mutation::{
    KindError, Mutation, MutationId, MutationKind, MutationState, TransactionRecord,
};
pub use part::{PartHash, PartHashError};
pub use time::{now_ms, now_sec};
