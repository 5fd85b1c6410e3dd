//! Process-level facade over the queue, sync loop, and read path.
//!
//! Collaborators (dashboards, CLI, forms) hold one `Engine` and use it
//! for everything: enqueueing mutations, reading histories, subscribing
//! to observations, and checking queue health.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::core::{
    Metadata, Mutation, MutationId, MutationKind, PartHash, PartHistory, SyncStatus, TxStatus,
    VerifyOutcome,
};
use crate::daemon::{
    spawn_sync_loop, BroadcasterLimits, DrainReport, EventBatch, EventBroadcaster,
    EventSubscription, SyncCoordinator, SyncHandle, SyncPolicy, Trigger,
};
use crate::error::Result;
use crate::ledger::{HttpRpc, LedgerReader, LedgerRpc, LogEntry, ScanBudget};
use crate::poller::StatusPoller;
use crate::relayer::{HttpRelayer, RelayerClient};
use crate::store::SqliteStore;
use crate::telemetry;

pub struct Engine {
    store: SqliteStore,
    coordinator: Arc<SyncCoordinator>,
    reader: LedgerReader,
    poller: StatusPoller,
    broadcaster: EventBroadcaster,
    sync: Option<SyncHandle>,
}

impl Engine {
    /// Open the engine with production HTTP clients, per the config.
    pub fn open(config: &Config) -> Result<Self> {
        telemetry::init(&config.logging);
        let relayer: Arc<dyn RelayerClient> = Arc::new(HttpRelayer::new(
            config.relayer.endpoint.clone(),
            Duration::from_millis(config.relayer.timeout_ms),
        ));
        let rpc: Arc<dyn LedgerRpc> = Arc::new(HttpRpc::new(
            config.ledger.rpc_endpoint.clone(),
            config.ledger.contract_address.clone(),
            Duration::from_millis(config.ledger.timeout_ms),
        ));
        Self::with_clients(
            &config.store.dir,
            relayer,
            rpc,
            config.sync.policy(),
            config.broadcast.limits(),
            config.sync.tick_interval(),
            config.sync.debounce(),
        )
    }

    /// Open with injected clients. This is the seam embedders and tests
    /// use to run against stub relayers and ledgers.
    pub fn with_clients(
        store_dir: &Path,
        relayer: Arc<dyn RelayerClient>,
        rpc: Arc<dyn LedgerRpc>,
        policy: SyncPolicy,
        limits: BroadcasterLimits,
        tick_interval: Duration,
        debounce: Duration,
    ) -> Result<Self> {
        let store = SqliteStore::open(store_dir)?;
        let broadcaster = EventBroadcaster::new(limits);
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            relayer,
            broadcaster.clone(),
            policy,
        ));
        let reader = LedgerReader::new(Arc::clone(&rpc), store.clone());
        let poller = StatusPoller::new(rpc, store.clone());
        let sync = spawn_sync_loop(Arc::clone(&coordinator), tick_interval, debounce);
        Ok(Self {
            store,
            coordinator,
            reader,
            poller,
            broadcaster,
            sync: Some(sync),
        })
    }

    /// Queue a lifecycle mutation. Durable before this returns; if the
    /// engine is online, a drain follows shortly.
    pub fn enqueue(
        &self,
        kind: MutationKind,
        part_hash: &PartHash,
        payload: &Metadata,
    ) -> Result<MutationId> {
        let id = self
            .store
            .enqueue(kind, part_hash, payload, crate::core::now_ms())?;
        tracing::debug!(id = %id, kind = %kind, part = %part_hash, "mutation enqueued");
        if self.coordinator.is_online() {
            if let Some(sync) = &self.sync {
                sync.trigger(Trigger::Enqueued);
            }
        }
        Ok(id)
    }

    /// Full reconciled history for a part. See [`LedgerReader::get_history`].
    ///
    /// Canonical events not seen by a previous read are also published to
    /// subscribers, so dashboards converge on the chain's view without
    /// their own polling.
    pub fn get_history(&self, part_hash: &PartHash) -> Result<PartHistory> {
        let known = self.store.cached_events(part_hash)?.len();
        let history = self.reader.get_history(part_hash)?;
        if history.len() > known {
            let batch = EventBatch {
                part_hash: *part_hash,
                events: history[known..].to_vec(),
            };
            if let Err(err) = self.broadcaster.publish(batch) {
                tracing::warn!(error = %err, "failed to broadcast observed events");
            }
        }
        Ok(history)
    }

    pub fn verify_part(&self, part_hash: &PartHash) -> Result<VerifyOutcome> {
        Ok(self.reader.verify_part(part_hash)?)
    }

    /// Raw log scan, for callers that need transaction ids beyond what
    /// the local index knows.
    pub fn scan_transactions(
        &self,
        part_hash: &PartHash,
        expected: &BTreeMap<MutationKind, usize>,
        budget: ScanBudget,
    ) -> Result<BTreeMap<MutationKind, Vec<LogEntry>>> {
        Ok(self.reader.scan_transactions(part_hash, expected, budget)?)
    }

    pub fn transaction_status(&self, transaction_id: &str) -> Result<TxStatus> {
        Ok(self.poller.status(transaction_id)?)
    }

    /// Record the mined block for a synced mutation; see
    /// [`StatusPoller::confirm_mutation`].
    pub fn confirm_mutation(&self, id: MutationId) -> Result<Option<TxStatus>> {
        Ok(self.poller.confirm_mutation(id)?)
    }

    pub fn subscribe(&self) -> Result<EventSubscription> {
        Ok(self.broadcaster.subscribe()?)
    }

    pub fn sync_status(&self) -> Result<SyncStatus> {
        Ok(self.store.sync_status()?)
    }

    pub fn list_pending(&self) -> Result<Vec<Mutation>> {
        Ok(self.store.list_pending()?)
    }

    pub fn list_failed(&self) -> Result<Vec<Mutation>> {
        Ok(self.store.list_failed()?)
    }

    pub fn mutation(&self, id: MutationId) -> Result<Option<Mutation>> {
        Ok(self.store.mutation(id)?)
    }

    /// Flip connectivity. Going online kicks an immediate drain.
    pub fn set_online(&self, online: bool) {
        if let Some(sync) = &self.sync {
            sync.trigger(Trigger::Connectivity(online));
        } else {
            self.coordinator.set_online(online);
        }
    }

    pub fn is_online(&self) -> bool {
        self.coordinator.is_online()
    }

    /// Ask the sync loop for an immediate drain pass.
    pub fn drain_now(&self) {
        if let Some(sync) = &self.sync {
            sync.trigger(Trigger::DrainNow);
        }
    }

    /// Run one drain pass on the calling thread and wait for it.
    ///
    /// The background loop keeps running; if it happens to be draining
    /// concurrently, this coalesces into a no-op like any other trigger.
    pub fn drain_blocking(&self) -> Result<DrainReport> {
        Ok(self.coordinator.drain()?)
    }

    /// Stop the background sync loop and wait for it to exit. Queued
    /// entries stay durable for the next open.
    pub fn shutdown(mut self) {
        if let Some(sync) = self.sync.take() {
            sync.shutdown();
        }
    }
}
