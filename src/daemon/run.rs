//! Background sync loop.
//!
//! One thread owns all drain triggers: enqueue notifications (debounced),
//! connectivity changes, explicit drain requests, and a fixed periodic
//! tick that sweeps entries whose backoff window has elapsed. Fatal store
//! errors halt the loop; everything else is logged and retried on the
//! next trigger.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use crate::daemon::coordinator::SyncCoordinator;
use crate::daemon::scheduler::DrainScheduler;

/// Reasons the sync loop wakes up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// A mutation was enqueued; drain soon (debounced).
    Enqueued,
    /// Connectivity changed; drain immediately when it comes back.
    Connectivity(bool),
    /// Drain immediately, skipping the debounce.
    DrainNow,
    Shutdown,
}

/// Handle to a running sync loop. Dropping it shuts the loop down.
pub struct SyncHandle {
    trigger_tx: Sender<Trigger>,
    join: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn trigger(&self, trigger: Trigger) {
        // The loop may already have halted on a fatal store error.
        let _ = self.trigger_tx.send(trigger);
    }

    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.trigger_tx.send(Trigger::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Spawn the sync loop thread.
///
/// `tick_interval` is the periodic sweep, independent of backoff;
/// `debounce` batches rapid enqueues into one drain.
pub fn spawn_sync_loop(
    coordinator: Arc<SyncCoordinator>,
    tick_interval: Duration,
    debounce: Duration,
) -> SyncHandle {
    let (trigger_tx, trigger_rx) = crossbeam::channel::unbounded();
    let join = std::thread::Builder::new()
        .name("parttrail-sync".to_string())
        .spawn(move || run_sync_loop(coordinator, trigger_rx, tick_interval, debounce))
        .unwrap_or_else(|err| {
            // Thread spawn only fails on resource exhaustion; nothing
            // sensible to do but crash loudly.
            panic!("failed to spawn sync thread: {err}")
        });
    SyncHandle {
        trigger_tx,
        join: Some(join),
    }
}

fn run_sync_loop(
    coordinator: Arc<SyncCoordinator>,
    trigger_rx: Receiver<Trigger>,
    tick_interval: Duration,
    debounce: Duration,
) {
    let (timer_tx, timer_rx) = crossbeam::channel::unbounded();
    let mut scheduler = DrainScheduler::new(timer_tx, debounce);
    let ticker = crossbeam::channel::tick(tick_interval);
    tracing::debug!(?tick_interval, ?debounce, "sync loop started");

    loop {
        crossbeam::select! {
            recv(trigger_rx) -> msg => {
                match msg {
                    Ok(Trigger::Enqueued) => scheduler.schedule(),
                    Ok(Trigger::Connectivity(online)) => {
                        tracing::info!(online, "connectivity changed");
                        coordinator.set_online(online);
                        if online {
                            scheduler.cancel();
                            if !drain_once(&coordinator) {
                                break;
                            }
                        }
                    }
                    Ok(Trigger::DrainNow) => {
                        scheduler.cancel();
                        if !drain_once(&coordinator) {
                            break;
                        }
                    }
                    Ok(Trigger::Shutdown) | Err(_) => break,
                }
            }
            recv(timer_rx) -> _ => {
                if scheduler.should_fire() && !drain_once(&coordinator) {
                    break;
                }
            }
            recv(ticker) -> _ => {
                if !drain_once(&coordinator) {
                    break;
                }
            }
        }
    }
    tracing::debug!("sync loop stopped");
}

/// Returns false when the loop must halt.
fn drain_once(coordinator: &SyncCoordinator) -> bool {
    match coordinator.drain() {
        Ok(report) => {
            if !report.is_noop() {
                tracing::debug!(?report, "drain pass finished");
            }
            true
        }
        Err(err) if err.is_fatal() => {
            tracing::error!(error = %err, "store integrity failure, halting sync");
            false
        }
        Err(err) => {
            tracing::warn!(error = %err, "drain pass failed");
            true
        }
    }
}
