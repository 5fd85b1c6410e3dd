//! Queued lifecycle mutations and their state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metadata::Metadata;
use super::part::PartHash;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KindError {
    #[error("unknown mutation kind {got:?}")]
    Unknown { got: String },
    #[error("unknown ledger status code {got}")]
    UnknownStatus { got: u8 },
}

/// The five lifecycle event kinds a part moves through.
///
/// Kinds are not commutative (Install before Register is meaningless), so a
/// single part's mutations must reach the ledger in enqueue order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Register,
    Receive,
    Install,
    Inspect,
    Retire,
}

impl MutationKind {
    pub const ALL: [MutationKind; 5] = [
        MutationKind::Register,
        MutationKind::Receive,
        MutationKind::Install,
        MutationKind::Inspect,
        MutationKind::Retire,
    ];

    /// Relayer method name for this kind.
    pub fn method_name(self) -> &'static str {
        match self {
            MutationKind::Register => "registerPart",
            MutationKind::Receive => "receivePart",
            MutationKind::Install => "installPart",
            MutationKind::Inspect => "inspectPart",
            MutationKind::Retire => "retirePart",
        }
    }

    /// Status code used by the ledger's canonical history view.
    pub fn status_code(self) -> u8 {
        match self {
            MutationKind::Register => 0,
            MutationKind::Receive => 1,
            MutationKind::Install => 2,
            MutationKind::Inspect => 3,
            MutationKind::Retire => 4,
        }
    }

    pub fn from_status_code(code: u8) -> Result<Self, KindError> {
        match code {
            0 => Ok(MutationKind::Register),
            1 => Ok(MutationKind::Receive),
            2 => Ok(MutationKind::Install),
            3 => Ok(MutationKind::Inspect),
            4 => Ok(MutationKind::Retire),
            got => Err(KindError::UnknownStatus { got }),
        }
    }

    /// Solidity event signature, used to derive the log topic.
    pub fn event_signature(self) -> &'static str {
        match self {
            MutationKind::Register => "Registered(bytes32,string,uint256)",
            MutationKind::Receive => "Received(bytes32,string,uint256)",
            MutationKind::Install => "Installed(bytes32,string,uint256)",
            MutationKind::Inspect => "Inspected(bytes32,string,uint256)",
            MutationKind::Retire => "Retired(bytes32,string,uint256)",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Register => "register",
            MutationKind::Receive => "receive",
            MutationKind::Install => "install",
            MutationKind::Inspect => "inspect",
            MutationKind::Retire => "retire",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, KindError> {
        match raw {
            "register" => Ok(MutationKind::Register),
            "receive" => Ok(MutationKind::Receive),
            "install" => Ok(MutationKind::Install),
            "inspect" => Ok(MutationKind::Inspect),
            "retire" => Ok(MutationKind::Retire),
            got => Err(KindError::Unknown {
                got: got.to_string(),
            }),
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a queued mutation.
///
/// Pending -> InFlight -> {Synced | Pending(retry) | Failed}. Synced and
/// Failed are terminal; Failed entries are kept for audit, never retried
/// automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    InFlight,
    Synced,
    Failed,
}

impl MutationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationState::Pending => "pending",
            MutationState::InFlight => "in_flight",
            MutationState::Synced => "synced",
            MutationState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(MutationState::Pending),
            "in_flight" => Some(MutationState::InFlight),
            "synced" => Some(MutationState::Synced),
            "failed" => Some(MutationState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MutationState::Synced | MutationState::Failed)
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locally unique, monotonic mutation id. Insertion order defines FIFO
/// priority within the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub i64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pending write intent, owned by the durable store and mutated only by
/// the sync coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: MutationId,
    pub kind: MutationKind,
    pub part_hash: PartHash,
    pub payload: Metadata,
    pub state: MutationState,
    pub attempts: u32,
    pub enqueued_at_ms: u64,
    pub last_attempt_ms: Option<u64>,
    pub last_error: Option<String>,
    pub transaction_id: Option<String>,
}

/// Local index entry correlating a synced mutation to its transaction id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub part_hash: PartHash,
    pub kind: MutationKind,
    pub transaction_id: String,
    pub timestamp_sec: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for kind in MutationKind::ALL {
            assert_eq!(
                MutationKind::from_status_code(kind.status_code()).unwrap(),
                kind
            );
        }
        assert!(MutationKind::from_status_code(5).is_err());
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in MutationKind::ALL {
            assert_eq!(MutationKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!MutationState::Pending.is_terminal());
        assert!(!MutationState::InFlight.is_terminal());
        assert!(MutationState::Synced.is_terminal());
        assert!(MutationState::Failed.is_terminal());
    }
}
