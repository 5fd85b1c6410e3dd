//! Fan-out of newly observed ledger events to dashboards and watchers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;

use crate::core::{LedgerEvent, PartHash};

/// One observation delivered to every live subscriber.
///
/// Delivery is at-most-once per observation: a subscriber that joins after
/// a batch was published never sees it, and a lagging subscriber is
/// dropped rather than buffered without bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventBatch {
    pub part_hash: PartHash,
    pub events: Vec<LedgerEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcasterLimits {
    pub max_subscribers: usize,
    /// Per-subscriber queue capacity, in batches.
    pub subscriber_capacity: usize,
}

impl Default for BroadcasterLimits {
    fn default() -> Self {
        Self {
            max_subscribers: 32,
            subscriber_capacity: 64,
        }
    }
}

impl BroadcasterLimits {
    /// Both limits floored at one. A zero-capacity channel is a rendezvous
    /// channel, and `try_send` on one fails unless a receiver is parked in
    /// `recv`, so every publish would drop the subscriber as lagging.
    fn floored(self) -> Self {
        Self {
            max_subscribers: self.max_subscribers.max(1),
            subscriber_capacity: self.subscriber_capacity.max(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    SubscriberLagged,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("subscriber limit reached ({max_subscribers})")]
    SubscriberLimitReached { max_subscribers: usize },
    #[error("broadcaster lock poisoned")]
    LockPoisoned,
}

/// Receiving end of a subscription. Dropping it unsubscribes; the
/// broadcaster prunes the slot on its next publish.
pub struct EventSubscription {
    receiver: Receiver<EventBatch>,
    drop_reason: Arc<Mutex<Option<DropReason>>>,
}

impl EventSubscription {
    pub fn recv(&self) -> Result<EventBatch, crossbeam::channel::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<EventBatch, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Set once the broadcaster has given up on this subscriber.
    pub fn drop_reason(&self) -> Option<DropReason> {
        self.drop_reason.lock().ok().and_then(|guard| *guard)
    }
}

#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Mutex<BroadcasterState>>,
}

impl EventBroadcaster {
    pub fn new(limits: BroadcasterLimits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BroadcasterState {
                limits: limits.floored(),
                next_subscriber_id: 1,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> Result<EventSubscription, BroadcastError> {
        let mut state = self.lock_state()?;
        if state.subscribers.len() >= state.limits.max_subscribers {
            return Err(BroadcastError::SubscriberLimitReached {
                max_subscribers: state.limits.max_subscribers,
            });
        }

        let (sender, receiver) = crossbeam::channel::bounded(state.limits.subscriber_capacity);
        let drop_reason = Arc::new(Mutex::new(None));
        let id = state.next_subscriber_id;
        state.next_subscriber_id = state.next_subscriber_id.saturating_add(1);
        state.subscribers.insert(
            id,
            SubscriberState {
                sender,
                drop_reason: Arc::clone(&drop_reason),
            },
        );

        Ok(EventSubscription {
            receiver,
            drop_reason,
        })
    }

    /// Deliver a batch to every live subscriber. Full or disconnected
    /// subscribers are removed; publishing never blocks on a slow reader.
    pub fn publish(&self, batch: EventBatch) -> Result<(), BroadcastError> {
        let mut state = self.lock_state()?;

        let mut dropped = Vec::new();
        for (id, subscriber) in &state.subscribers {
            match subscriber.sender.try_send(batch.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    subscriber.set_drop_reason(DropReason::SubscriberLagged);
                    dropped.push(*id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            state.subscribers.remove(&id);
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> Result<usize, BroadcastError> {
        Ok(self.lock_state()?.subscribers.len())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, BroadcasterState>, BroadcastError> {
        self.inner.lock().map_err(|_| BroadcastError::LockPoisoned)
    }
}

struct BroadcasterState {
    limits: BroadcasterLimits,
    next_subscriber_id: u64,
    subscribers: BTreeMap<u64, SubscriberState>,
}

struct SubscriberState {
    sender: Sender<EventBatch>,
    drop_reason: Arc<Mutex<Option<DropReason>>>,
}

impl SubscriberState {
    fn set_drop_reason(&self, reason: DropReason) {
        if let Ok(mut guard) = self.drop_reason.lock() {
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Metadata, MutationKind};

    fn batch(seq: u8) -> EventBatch {
        let part_hash = PartHash::from_bytes([seq; 32]);
        EventBatch {
            part_hash,
            events: vec![LedgerEvent {
                kind: MutationKind::Register,
                part_hash,
                timestamp_sec: 1_000 + seq as u64,
                metadata: Metadata::new(),
                transaction_id: None,
                block_number: None,
            }],
        }
    }

    #[test]
    fn delivers_batches_in_order() {
        let broadcaster = EventBroadcaster::new(BroadcasterLimits::default());
        let sub = broadcaster.subscribe().unwrap();

        broadcaster.publish(batch(1)).unwrap();
        broadcaster.publish(batch(2)).unwrap();

        assert_eq!(sub.recv().unwrap(), batch(1));
        assert_eq!(sub.recv().unwrap(), batch(2));
    }

    #[test]
    fn lagging_subscriber_is_dropped_not_blocked_on() {
        let broadcaster = EventBroadcaster::new(BroadcasterLimits {
            max_subscribers: 4,
            subscriber_capacity: 1,
        });
        let sub = broadcaster.subscribe().unwrap();

        broadcaster.publish(batch(1)).unwrap();
        broadcaster.publish(batch(2)).unwrap();

        assert_eq!(sub.drop_reason(), Some(DropReason::SubscriberLagged));
        assert_eq!(broadcaster.subscriber_count().unwrap(), 0);
        // The batch that fit is still readable; the rest were never queued.
        assert_eq!(sub.recv().unwrap(), batch(1));
    }

    #[test]
    fn subscriber_limit_is_enforced() {
        let broadcaster = EventBroadcaster::new(BroadcasterLimits {
            max_subscribers: 1,
            subscriber_capacity: 4,
        });
        let _first = broadcaster.subscribe().unwrap();
        assert!(matches!(
            broadcaster.subscribe(),
            Err(BroadcastError::SubscriberLimitReached { .. })
        ));
    }

    #[test]
    fn unsubscribe_by_drop() {
        let broadcaster = EventBroadcaster::new(BroadcasterLimits::default());
        let sub = broadcaster.subscribe().unwrap();
        drop(sub);
        // Pruned on the next publish.
        broadcaster.publish(batch(1)).unwrap();
        assert_eq!(broadcaster.subscriber_count().unwrap(), 0);
    }

    #[test]
    fn zero_limits_are_floored() {
        let broadcaster = EventBroadcaster::new(BroadcasterLimits {
            max_subscribers: 0,
            subscriber_capacity: 0,
        });
        let sub = broadcaster.subscribe().unwrap();
        broadcaster.publish(batch(1)).unwrap();
        assert_eq!(sub.recv().unwrap(), batch(1));
        assert_eq!(sub.drop_reason(), None);
        assert_eq!(broadcaster.subscriber_count().unwrap(), 1);
    }

    #[test]
    fn late_subscriber_sees_no_replay() {
        let broadcaster = EventBroadcaster::new(BroadcasterLimits::default());
        broadcaster.publish(batch(1)).unwrap();
        let sub = broadcaster.subscribe().unwrap();
        assert!(matches!(sub.try_recv(), Err(TryRecvError::Empty)));
    }
}
