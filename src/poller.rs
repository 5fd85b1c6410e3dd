//! Transaction status resolution.

use std::sync::Arc;

use crate::core::{MutationId, TxStatus};
use crate::ledger::{LedgerError, LedgerRpc};
use crate::store::SqliteStore;

/// Resolves submitted transaction ids to their on-chain fate. Pure reads,
/// no internal retries; the caller picks the re-poll cadence.
pub struct StatusPoller {
    rpc: Arc<dyn LedgerRpc>,
    store: SqliteStore,
}

impl StatusPoller {
    pub fn new(rpc: Arc<dyn LedgerRpc>, store: SqliteStore) -> Self {
        Self { rpc, store }
    }

    /// Current status of a transaction id.
    ///
    /// Confirmation depth is measured against the chain head at poll time,
    /// so it only ever grows between polls of a confirmed transaction.
    pub fn status(&self, transaction_id: &str) -> Result<TxStatus, LedgerError> {
        let Some(receipt) = self.rpc.transaction_receipt(transaction_id)? else {
            return Ok(TxStatus::Pending);
        };
        if !receipt.success {
            return Ok(TxStatus::Failed);
        }
        let head = self.rpc.block_number()?;
        Ok(TxStatus::Confirmed {
            block_number: receipt.block_number,
            confirmations: head.saturating_sub(receipt.block_number),
        })
    }

    /// Upgrade a synced mutation's bookkeeping from "submitted" to
    /// "confirmed" by recording its mined block. Returns the observed
    /// status, or None if the mutation has no synced transaction.
    pub fn confirm_mutation(&self, id: MutationId) -> Result<Option<TxStatus>, LedgerError> {
        let Some(transaction_id) = self.store.synced_transaction(id)? else {
            return Ok(None);
        };
        let status = self.status(&transaction_id)?;
        if let TxStatus::Confirmed { block_number, .. } = status {
            self.store.record_confirmation(id, block_number)?;
        }
        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Metadata, MutationKind, PartHash};
    use crate::ledger::{LogEntry, RawPartEvent, Receipt};
    use alloy_primitives::B256;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct StubRpc {
        head: u64,
        receipts: BTreeMap<String, Receipt>,
    }

    impl LedgerRpc for StubRpc {
        fn block_number(&self) -> Result<u64, LedgerError> {
            Ok(self.head)
        }

        fn part_history(&self, _part: &PartHash) -> Result<Vec<RawPartEvent>, LedgerError> {
            Ok(Vec::new())
        }

        fn logs(
            &self,
            _topic: B256,
            _part: &PartHash,
            _from: u64,
            _to: u64,
        ) -> Result<Vec<LogEntry>, LedgerError> {
            Ok(Vec::new())
        }

        fn transaction_receipt(&self, tx: &str) -> Result<Option<Receipt>, LedgerError> {
            Ok(self.receipts.get(tx).cloned())
        }
    }

    fn poller(dir: &TempDir, rpc: StubRpc) -> (StatusPoller, SqliteStore) {
        let store = SqliteStore::open(dir.path()).unwrap();
        (StatusPoller::new(Arc::new(rpc), store.clone()), store)
    }

    #[test]
    fn unmined_transaction_is_pending() {
        let dir = TempDir::new().unwrap();
        let (poller, _store) = poller(
            &dir,
            StubRpc {
                head: 100,
                receipts: BTreeMap::new(),
            },
        );
        assert_eq!(poller.status("0x01").unwrap(), TxStatus::Pending);
    }

    #[test]
    fn confirmations_measure_depth_from_head() {
        let dir = TempDir::new().unwrap();
        let receipts = BTreeMap::from([
            (
                "0x01".to_string(),
                Receipt {
                    success: true,
                    block_number: 90,
                },
            ),
            (
                "0x02".to_string(),
                Receipt {
                    success: false,
                    block_number: 95,
                },
            ),
        ]);
        let (poller, _store) = poller(&dir, StubRpc { head: 100, receipts });
        assert_eq!(
            poller.status("0x01").unwrap(),
            TxStatus::Confirmed {
                block_number: 90,
                confirmations: 10
            }
        );
        assert_eq!(poller.status("0x02").unwrap(), TxStatus::Failed);
    }

    #[test]
    fn confirm_mutation_records_block_number() {
        let dir = TempDir::new().unwrap();
        let receipts = BTreeMap::from([(
            "0xdead".to_string(),
            Receipt {
                success: true,
                block_number: 42,
            },
        )]);
        let (poller, store) = poller(&dir, StubRpc { head: 50, receipts });

        let part = PartHash::from_bytes([0x01; 32]);
        let id = store
            .enqueue(MutationKind::Register, &part, &Metadata::new(), 1_000)
            .unwrap();
        store.mark_in_flight(id, 1_100).unwrap();
        store.mark_synced(id, "0xdead", 1_200).unwrap();

        let status = poller.confirm_mutation(id).unwrap().unwrap();
        assert_eq!(
            status,
            TxStatus::Confirmed {
                block_number: 42,
                confirmations: 8
            }
        );

        // A mutation that never synced has nothing to confirm.
        let other = store
            .enqueue(MutationKind::Receive, &part, &Metadata::new(), 2_000)
            .unwrap();
        assert_eq!(poller.confirm_mutation(other).unwrap(), None);
    }
}
