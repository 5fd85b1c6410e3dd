#![forbid(unsafe_code)]

//! Offline mutation queue and ledger-reconciliation engine for part
//! lifecycle tracking.
//!
//! Field agents record lifecycle events (register, receive, install,
//! inspect, retire) for physical parts while connectivity comes and
//! goes. Mutations land in a durable local queue, a background
//! coordinator replays them against the ledger through a relayer with
//! retry and backoff, and the read path reconstructs a part's full
//! on-chain history, backfilling transaction ids from a local index.
//!
//! [`Engine`] is the entry point; everything else is reachable through
//! it or usable standalone.

pub mod config;
pub mod core;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod poller;
pub mod relayer;
pub mod store;
pub mod telemetry;

pub use engine::Engine;
pub use error::{Error, Result, Transience};

// Re-export core types at crate root for convenience
pub use crate::core::{
    LedgerEvent, Metadata, Mutation, MutationId, MutationKind, MutationState, PartHash,
    PartHistory, SyncStatus, TransactionRecord, TxStatus, VerifyOutcome,
};
