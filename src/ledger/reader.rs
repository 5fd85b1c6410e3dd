//! History reconstruction and windowed log scanning.
//!
//! The chain's public history view returns `(status, timestamp, metadata)`
//! tuples with no transaction hashes, so the reader backfills identifiers
//! from the local transaction index and, when raw logs are needed, scans
//! the log index backward from the head in bounded windows.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::{
    LedgerEvent, Metadata, MutationKind, PartHash, PartHistory, VerifyOutcome,
};
use crate::ledger::rpc::{LedgerError, LedgerRpc, LogEntry};
use crate::ledger::abi;
use crate::store::SqliteStore;

/// Cost bound for a backward log scan.
///
/// The scan stops once every requested kind count is satisfied or the
/// window budget runs out; it does not promise exhaustiveness. Callers
/// that need deeper history pass a larger budget explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanBudget {
    /// Blocks per window.
    pub window_size: u64,
    /// Maximum windows scanned before giving up.
    pub max_windows: u32,
}

impl ScanBudget {
    /// Default bound, sized for providers that cap per-query block ranges.
    pub const DEFAULT: ScanBudget = ScanBudget {
        window_size: 1_000,
        max_windows: 6,
    };

    /// Wider bound for audit-style reads that tolerate slower queries.
    pub const DEEP: ScanBudget = ScanBudget {
        window_size: 2_000,
        max_windows: 40,
    };
}

impl Default for ScanBudget {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Read path for part histories.
pub struct LedgerReader {
    rpc: Arc<dyn LedgerRpc>,
    store: SqliteStore,
}

impl LedgerReader {
    pub fn new(rpc: Arc<dyn LedgerRpc>, store: SqliteStore) -> Self {
        Self { rpc, store }
    }

    /// Full history for one part, ascending by timestamp, with transaction
    /// ids backfilled from the local index.
    ///
    /// An RPC failure fails the whole call; partial histories are never
    /// returned, so callers cannot mistake an incomplete read for a
    /// complete one. Receipt lookups for block numbers are the one
    /// exception: the block number is an optional enrichment and a missing
    /// receipt leaves it unset.
    pub fn get_history(&self, part_hash: &PartHash) -> Result<PartHistory, LedgerError> {
        let raw = self.rpc.part_history(part_hash)?;

        // One FIFO queue per kind, ascending by submission time. Canonical
        // events arrive in insertion order, so popping the head pairs each
        // event with the earliest unclaimed record of its kind. Pairing is
        // a best-effort approximation that assumes at most one in-flight
        // mutation per (part, kind); deliberate re-inspections tie-break
        // earliest-first.
        let mut records: BTreeMap<MutationKind, VecDeque<String>> = BTreeMap::new();
        for record in self.store.lookup_transactions(part_hash)? {
            records
                .entry(record.kind)
                .or_default()
                .push_back(record.transaction_id);
        }

        let mut history = Vec::with_capacity(raw.len());
        for entry in raw {
            let kind = MutationKind::from_status_code(entry.status)
                .map_err(|err| LedgerError::Decode(err.to_string()))?;
            let transaction_id = records.get_mut(&kind).and_then(VecDeque::pop_front);
            history.push(LedgerEvent {
                kind,
                part_hash: *part_hash,
                timestamp_sec: entry.timestamp_sec,
                metadata: Metadata::from_json_lossy(&entry.metadata),
                transaction_id,
                block_number: None,
            });
        }
        history.sort_by_key(|event| event.timestamp_sec);

        for event in &mut history {
            if let Some(tx) = &event.transaction_id {
                if let Ok(Some(receipt)) = self.rpc.transaction_receipt(tx) {
                    event.block_number = Some(receipt.block_number);
                }
            }
        }

        if let Err(err) = self.store.cache_events(part_hash, &history) {
            tracing::warn!(part = %part_hash, error = %err, "failed to refresh event cache");
        }
        Ok(history)
    }

    /// Authenticity check: does the ledger know this part, and has its
    /// registration landed?
    pub fn verify_part(&self, part_hash: &PartHash) -> Result<VerifyOutcome, LedgerError> {
        let history = self.get_history(part_hash)?;
        let Some(last_event) = history.last().cloned() else {
            return Ok(VerifyOutcome::Unknown);
        };
        if history.iter().any(|e| e.kind == MutationKind::Register) {
            Ok(VerifyOutcome::Verified { last_event })
        } else {
            Ok(VerifyOutcome::PendingRegistration { last_event })
        }
    }

    /// Scan raw event logs backward from the chain head for this part.
    ///
    /// `expected` gives the number of logs wanted per kind; the scan exits
    /// early once every count is satisfied. Within one window the per-kind
    /// queries run concurrently; windows themselves proceed sequentially
    /// from the head backward, since whether window N+1 is needed depends
    /// on what window N returned. The early exit is a heuristic cost bound
    /// carried over from the read API's limits, not a completeness
    /// guarantee.
    pub fn scan_transactions(
        &self,
        part_hash: &PartHash,
        expected: &BTreeMap<MutationKind, usize>,
        budget: ScanBudget,
    ) -> Result<BTreeMap<MutationKind, Vec<LogEntry>>, LedgerError> {
        let mut found: BTreeMap<MutationKind, Vec<LogEntry>> = BTreeMap::new();
        if expected.values().all(|&count| count == 0) {
            return Ok(found);
        }

        let head = self.rpc.block_number()?;
        let mut to_block = head;

        for _ in 0..budget.max_windows {
            let from_block = to_block.saturating_sub(budget.window_size.saturating_sub(1));

            let pending: Vec<MutationKind> = expected
                .iter()
                .filter(|&(kind, &count)| found.get(kind).map_or(0, Vec::len) < count)
                .map(|(kind, _)| *kind)
                .collect();
            if pending.is_empty() {
                break;
            }

            let rpc = self.rpc.as_ref();
            let results = std::thread::scope(|scope| {
                let handles: Vec<_> = pending
                    .iter()
                    .map(|&kind| {
                        scope.spawn(move || {
                            rpc.logs(abi::event_topic(kind), part_hash, from_block, to_block)
                                .map(|logs| (kind, logs))
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| match handle.join() {
                        Ok(result) => result,
                        Err(_) => Err(LedgerError::Rpc("log query panicked".to_string())),
                    })
                    .collect::<Vec<_>>()
            });
            for result in results {
                let (kind, logs) = result?;
                found.entry(kind).or_default().extend(logs);
            }

            if from_block == 0 {
                break;
            }
            to_block = from_block - 1;
        }
        Ok(found)
    }
}
