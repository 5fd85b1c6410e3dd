//! Queue draining, retry bookkeeping, and backoff.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::TryLockError;
use std::time::Duration;

use crate::core::{now_ms, now_sec, LedgerEvent, SyncStatus};
use crate::daemon::broadcast::{EventBatch, EventBroadcaster};
use crate::relayer::RelayerClient;
use crate::store::{SqliteStore, StoreError};

/// Retry policy for relayer submissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Transient failures allowed before an entry goes terminal.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl SyncPolicy {
    /// Delay before the next attempt: exponential in the attempt count,
    /// capped. Zero for an entry that has never been attempted.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

/// Outcome of one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    pub failed: usize,
    pub retried: usize,
    pub skipped: usize,
}

impl DrainReport {
    pub fn is_noop(&self) -> bool {
        *self == DrainReport::default()
    }
}

/// Drives queued mutations through the relayer.
///
/// All mutation state lives in the store; the coordinator holds only the
/// connectivity flag and the single-flight lock. Cloning shares both.
pub struct SyncCoordinator {
    store: SqliteStore,
    relayer: Arc<dyn RelayerClient>,
    broadcaster: EventBroadcaster,
    policy: SyncPolicy,
    online: AtomicBool,
    drain_lock: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        store: SqliteStore,
        relayer: Arc<dyn RelayerClient>,
        broadcaster: EventBroadcaster,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            store,
            relayer,
            broadcaster,
            policy,
            online: AtomicBool::new(true),
            drain_lock: Mutex::new(()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn sync_status(&self) -> Result<SyncStatus, StoreError> {
        self.store.sync_status()
    }

    /// Drain the queue once, strictly in FIFO order.
    ///
    /// Single-flight: if a drain is already running, this call coalesces
    /// into a no-op; the running pass will see any newly enqueued entries
    /// on its own `list_pending` or the next trigger. Entries inside their
    /// backoff window are skipped, not waited on, and skipping an entry
    /// blocks every later entry for the same part so per-part order is
    /// never reordered by retry timing.
    pub fn drain(&self) -> Result<DrainReport, StoreError> {
        let _guard = match self.drain_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("drain already in progress, coalescing");
                return Ok(DrainReport::default());
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                // The lock guards no data; every entry's state lives in the
                // store, so a drain that panicked mid-pass leaves nothing
                // inconsistent behind.
                tracing::error!("previous drain panicked, recovering drain lock");
                poisoned.into_inner()
            }
        };
        if !self.is_online() {
            tracing::debug!("offline, skipping drain");
            return Ok(DrainReport::default());
        }

        let pending = self.store.list_pending()?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }
        tracing::debug!(pending = pending.len(), "draining queue");

        let mut report = DrainReport::default();
        let mut blocked_parts = HashSet::new();

        for mutation in pending {
            if blocked_parts.contains(&mutation.part_hash) {
                report.skipped += 1;
                continue;
            }

            let now = now_ms();
            let delay = self.policy.backoff_delay(mutation.attempts);
            let ready_at = mutation
                .last_attempt_ms
                .unwrap_or(0)
                .saturating_add(delay.as_millis() as u64);
            if now < ready_at {
                report.skipped += 1;
                blocked_parts.insert(mutation.part_hash);
                continue;
            }

            self.store.mark_in_flight(mutation.id, now)?;
            match self
                .relayer
                .submit(mutation.kind, &mutation.part_hash, &mutation.payload)
            {
                Ok(transaction_id) => {
                    let now = now_ms();
                    self.store.mark_synced(mutation.id, &transaction_id, now)?;
                    self.store.index_transaction(
                        &mutation.part_hash,
                        mutation.kind,
                        &transaction_id,
                        now_sec(),
                    )?;
                    tracing::info!(
                        id = %mutation.id,
                        kind = %mutation.kind,
                        part = %mutation.part_hash,
                        tx = %transaction_id,
                        "mutation synced"
                    );
                    self.announce_synced(&mutation.part_hash, &mutation, &transaction_id);
                    report.synced += 1;
                }
                Err(err) if err.is_permanent() => {
                    self.store
                        .mark_rejected(mutation.id, &err.to_string(), now_ms())?;
                    tracing::warn!(
                        id = %mutation.id,
                        kind = %mutation.kind,
                        error = %err,
                        "mutation rejected by relayer, not retrying"
                    );
                    report.failed += 1;
                    blocked_parts.insert(mutation.part_hash);
                }
                Err(err) => {
                    let state = self.store.mark_failed(
                        mutation.id,
                        &err.to_string(),
                        self.policy.max_attempts,
                        now_ms(),
                    )?;
                    if state.is_terminal() {
                        tracing::warn!(
                            id = %mutation.id,
                            attempts = mutation.attempts + 1,
                            error = %err,
                            "mutation failed, retry ceiling reached"
                        );
                        report.failed += 1;
                    } else {
                        tracing::debug!(
                            id = %mutation.id,
                            attempts = mutation.attempts + 1,
                            error = %err,
                            "mutation attempt failed, will retry"
                        );
                        report.retried += 1;
                    }
                    blocked_parts.insert(mutation.part_hash);
                }
            }
        }

        tracing::debug!(?report, "drain complete");
        Ok(report)
    }

    /// Provisional announcement at submission time; the canonical event
    /// lands with the reader's next history fetch.
    fn announce_synced(
        &self,
        part_hash: &crate::core::PartHash,
        mutation: &crate::core::Mutation,
        transaction_id: &str,
    ) {
        let batch = EventBatch {
            part_hash: *part_hash,
            events: vec![LedgerEvent {
                kind: mutation.kind,
                part_hash: *part_hash,
                timestamp_sec: now_sec(),
                metadata: mutation.payload.clone(),
                transaction_id: Some(transaction_id.to_string()),
                block_number: None,
            }],
        };
        if let Err(err) = self.broadcaster.publish(batch) {
            tracing::warn!(error = %err, "failed to broadcast synced mutation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Metadata, MutationKind, MutationState, PartHash};
    use crate::daemon::broadcast::BroadcasterLimits;
    use crate::relayer::RelayerError;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    enum Behavior {
        Succeed,
        Unavailable,
        Reject,
    }

    struct StubRelayer {
        behavior: Mutex<Behavior>,
        calls: AtomicU32,
    }

    impl StubRelayer {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior: Mutex::new(behavior),
                calls: AtomicU32::new(0),
            })
        }

        fn set(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RelayerClient for StubRelayer {
        fn submit(
            &self,
            _kind: MutationKind,
            _part: &PartHash,
            _metadata: &Metadata,
        ) -> Result<String, RelayerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match *self.behavior.lock().unwrap() {
                Behavior::Succeed => Ok(format!("0xtx{call:02}")),
                Behavior::Unavailable => {
                    Err(RelayerError::Unavailable("connection refused".to_string()))
                }
                Behavior::Reject => Err(RelayerError::Rejected {
                    status: 400,
                    message: "malformed payload".to_string(),
                }),
            }
        }
    }

    fn coordinator(
        dir: &TempDir,
        relayer: Arc<StubRelayer>,
        policy: SyncPolicy,
    ) -> (SyncCoordinator, SqliteStore, EventBroadcaster) {
        let store = SqliteStore::open(dir.path()).unwrap();
        let broadcaster = EventBroadcaster::new(BroadcasterLimits::default());
        let coordinator =
            SyncCoordinator::new(store.clone(), relayer, broadcaster.clone(), policy);
        (coordinator, store, broadcaster)
    }

    fn no_backoff() -> SyncPolicy {
        SyncPolicy {
            backoff_base: Duration::ZERO,
            ..SyncPolicy::default()
        }
    }

    #[test]
    fn full_drain_syncs_everything_with_transaction_ids() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Succeed);
        let (coordinator, store, _b) = coordinator(&dir, relayer.clone(), no_backoff());

        let parts: Vec<PartHash> = (1u8..=3).map(|b| PartHash::from_bytes([b; 32])).collect();
        let mut ids = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            ids.push(
                store
                    .enqueue(MutationKind::Register, part, &Metadata::new(), 1_000 + i as u64)
                    .unwrap(),
            );
        }

        let report = coordinator.drain().unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(report.failed + report.retried + report.skipped, 0);

        for id in ids {
            let m = store.mutation(id).unwrap().unwrap();
            assert_eq!(m.state, MutationState::Synced);
            assert!(m.transaction_id.as_deref().is_some_and(|tx| !tx.is_empty()));
        }
        assert_eq!(store.sync_status().unwrap().pending_count, 0);
    }

    #[test]
    fn idle_drain_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Succeed);
        let (coordinator, _store, _b) = coordinator(&dir, relayer.clone(), no_backoff());

        let report = coordinator.drain().unwrap();
        assert!(report.is_noop());
        assert_eq!(relayer.calls(), 0);
    }

    #[test]
    fn offline_drain_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Succeed);
        let (coordinator, store, _b) = coordinator(&dir, relayer.clone(), no_backoff());
        store
            .enqueue(
                MutationKind::Register,
                &PartHash::from_bytes([1; 32]),
                &Metadata::new(),
                1_000,
            )
            .unwrap();

        coordinator.set_online(false);
        assert!(coordinator.drain().unwrap().is_noop());
        assert_eq!(relayer.calls(), 0);
        assert_eq!(store.sync_status().unwrap().pending_count, 1);
    }

    #[test]
    fn retry_ceiling_reaches_failed_and_stays_there() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Unavailable);
        let (coordinator, store, _b) = coordinator(&dir, relayer.clone(), no_backoff());
        let id = store
            .enqueue(
                MutationKind::Inspect,
                &PartHash::from_bytes([2; 32]),
                &Metadata::new(),
                1_000,
            )
            .unwrap();

        for _ in 0..2 {
            let report = coordinator.drain().unwrap();
            assert_eq!(report.retried, 1);
        }
        let report = coordinator.drain().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(relayer.calls(), 3);

        let m = store.mutation(id).unwrap().unwrap();
        assert_eq!(m.state, MutationState::Failed);
        assert_eq!(m.attempts, 3);

        // Terminal entries are never retried, even by a healthy relayer.
        relayer.set(Behavior::Succeed);
        assert!(coordinator.drain().unwrap().is_noop());
        assert_eq!(relayer.calls(), 3);
    }

    #[test]
    fn rejection_short_circuits_on_first_attempt() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Reject);
        let (coordinator, store, _b) = coordinator(&dir, relayer.clone(), no_backoff());
        let id = store
            .enqueue(
                MutationKind::Install,
                &PartHash::from_bytes([3; 32]),
                &Metadata::new(),
                1_000,
            )
            .unwrap();

        let report = coordinator.drain().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(relayer.calls(), 1);
        let m = store.mutation(id).unwrap().unwrap();
        assert_eq!(m.state, MutationState::Failed);
        assert_eq!(m.attempts, 1);
    }

    #[test]
    fn backoff_window_skips_without_blocking() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Unavailable);
        let policy = SyncPolicy {
            backoff_base: Duration::from_secs(3_600),
            ..SyncPolicy::default()
        };
        let (coordinator, store, _b) = coordinator(&dir, relayer.clone(), policy);
        store
            .enqueue(
                MutationKind::Receive,
                &PartHash::from_bytes([4; 32]),
                &Metadata::new(),
                1_000,
            )
            .unwrap();

        assert_eq!(coordinator.drain().unwrap().retried, 1);
        // Inside the backoff window: skipped immediately, no relayer call.
        relayer.set(Behavior::Succeed);
        let report = coordinator.drain().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(relayer.calls(), 1);
    }

    #[test]
    fn skipped_entry_blocks_later_mutations_of_same_part() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Unavailable);
        let policy = SyncPolicy {
            backoff_base: Duration::from_secs(3_600),
            ..SyncPolicy::default()
        };
        let (coordinator, store, _b) = coordinator(&dir, relayer.clone(), policy);
        let stuck = PartHash::from_bytes([5; 32]);
        let other = PartHash::from_bytes([6; 32]);
        store
            .enqueue(MutationKind::Register, &stuck, &Metadata::new(), 1_000)
            .unwrap();
        store
            .enqueue(MutationKind::Receive, &stuck, &Metadata::new(), 1_001)
            .unwrap();
        store
            .enqueue(MutationKind::Register, &other, &Metadata::new(), 1_002)
            .unwrap();

        // First pass: Register(stuck) fails, which must also hold back
        // Receive(stuck) while Register(other) proceeds independently.
        relayer.set(Behavior::Unavailable);
        let calls_before = relayer.calls();
        let report = coordinator.drain().unwrap();
        assert_eq!(report.retried + report.failed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(relayer.calls() - calls_before, 2);

        // Second pass inside the window: every attempted entry is backing
        // off, and the stuck part's follow-up stays held behind it.
        relayer.set(Behavior::Succeed);
        let report = coordinator.drain().unwrap();
        assert_eq!(report.skipped, 3);
        assert_eq!(relayer.calls() - calls_before, 2);
    }

    #[test]
    fn corrupt_queue_row_surfaces_a_fatal_error() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Succeed);
        let (coordinator, store, _b) = coordinator(&dir, relayer.clone(), no_backoff());
        store
            .enqueue(
                MutationKind::Register,
                &PartHash::from_bytes([8; 32]),
                &Metadata::new(),
                1_000,
            )
            .unwrap();

        // Tamper behind the store's back: a kind no release ever wrote.
        let conn = rusqlite::Connection::open(dir.path().join("queue.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO queue (kind, part_hash, payload, state, enqueued_at_ms)
             VALUES ('bogus', ?1, '{}', 'pending', 1001)",
            [PartHash::from_bytes([9; 32]).to_hex()],
        )
        .unwrap();

        let err = coordinator.drain().unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
        assert!(err.is_fatal());
        assert_eq!(relayer.calls(), 0);
    }

    #[test]
    fn drain_recovers_a_poisoned_lock() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Succeed);
        let (coordinator, store, _b) = coordinator(&dir, relayer, no_backoff());
        store
            .enqueue(
                MutationKind::Register,
                &PartHash::from_bytes([10; 32]),
                &Metadata::new(),
                1_000,
            )
            .unwrap();

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = coordinator.drain_lock.lock().unwrap();
            panic!("drain died mid-pass");
        }));
        assert!(coordinator.drain_lock.is_poisoned());

        let report = coordinator.drain().unwrap();
        assert_eq!(report.synced, 1);
    }

    #[test]
    fn synced_mutation_is_broadcast_and_indexed() {
        let dir = TempDir::new().unwrap();
        let relayer = StubRelayer::new(Behavior::Succeed);
        let (coordinator, store, broadcaster) = coordinator(&dir, relayer, no_backoff());
        let part = PartHash::from_bytes([7; 32]);
        let sub = broadcaster.subscribe().unwrap();

        store
            .enqueue(
                MutationKind::Register,
                &part,
                &Metadata::new().with("vendorId", "V1"),
                1_000,
            )
            .unwrap();
        coordinator.drain().unwrap();

        let batch = sub.try_recv().unwrap();
        assert_eq!(batch.part_hash, part);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].kind, MutationKind::Register);
        assert!(batch.events[0].transaction_id.is_some());

        let records = store.lookup_transactions(&part).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, MutationKind::Register);
    }
}
