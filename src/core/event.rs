//! Read-time projections of the on-chain ledger.

use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use super::mutation::MutationKind;
use super::part::PartHash;

/// Canonical on-chain record, immutable once read.
///
/// `transaction_id` and `block_number` are not part of the chain's public
/// history view; they stay empty until backfilled from the local
/// transaction index and the receipt API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: MutationKind,
    pub part_hash: PartHash,
    pub timestamp_sec: u64,
    pub metadata: Metadata,
    pub transaction_id: Option<String>,
    pub block_number: Option<u64>,
}

/// Full history for one part, ascending by timestamp.
///
/// Derived on every read from canonical events plus local transaction
/// records; never persisted as its own entity.
pub type PartHistory = Vec<LedgerEvent>;

/// Resolution of a transaction identifier against the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TxStatus {
    /// Not yet mined.
    Pending,
    Confirmed { block_number: u64, confirmations: u64 },
    Failed,
}

/// Outcome of a part authenticity check against the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// History exists and contains a Register event.
    Verified { last_event: LedgerEvent },
    /// History exists but no Register event has landed yet.
    PendingRegistration { last_event: LedgerEvent },
    /// The ledger has no record of this part.
    Unknown,
}

/// Aggregate queue health exposed to collaborators.
///
/// `pending_count` covers entries that will still be retried;
/// `failed_count` covers terminal failures that represent unrecorded field
/// work and need operator attention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending_count: u64,
    pub failed_count: u64,
    pub last_sync_at_ms: Option<u64>,
}
