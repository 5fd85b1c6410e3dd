//! Drain scheduling with debounce.
//!
//! A burst of enqueues (a form filled out for several parts at once)
//! should produce one drain, not one per entry. Each enqueue schedules a
//! drain after a short delay; scheduling while one is already pending is
//! a no-op, so the burst coalesces into the earliest timer.

use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

pub struct DrainScheduler {
    pending: Option<Instant>,
    default_delay: Duration,
    timer_tx: Sender<()>,
}

impl DrainScheduler {
    pub fn new(timer_tx: Sender<()>, default_delay: Duration) -> Self {
        Self {
            pending: None,
            default_delay,
            timer_tx,
        }
    }

    /// Schedule a drain after the default delay.
    pub fn schedule(&mut self) {
        self.schedule_after(self.default_delay);
    }

    /// Schedule a drain after a specific delay.
    pub fn schedule_after(&mut self, delay: Duration) {
        let fire_at = Instant::now() + delay;
        if let Some(existing) = self.pending {
            if existing <= fire_at {
                return;
            }
        }
        self.pending = Some(fire_at);

        let tx = self.timer_tx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            // Receiver may have shut down.
            let _ = tx.send(());
        });
    }

    /// Whether a pending drain is ready. Consumes the pending entry when
    /// it fires.
    pub fn should_fire(&mut self) -> bool {
        if let Some(fire_at) = self.pending {
            if Instant::now() >= fire_at {
                self.pending = None;
                return true;
            }
        }
        false
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn burst_coalesces_into_one_pending_drain() {
        let (tx, rx) = unbounded();
        let mut scheduler = DrainScheduler::new(tx, Duration::from_millis(10));
        scheduler.schedule();
        scheduler.schedule();
        scheduler.schedule();
        assert!(scheduler.has_pending());

        // Only the first schedule spawned a timer.
        rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fires_once_then_clears() {
        let (tx, _rx) = unbounded();
        let mut scheduler = DrainScheduler::new(tx, Duration::ZERO);
        scheduler.schedule_after(Duration::ZERO);
        assert!(scheduler.should_fire());
        assert!(!scheduler.should_fire());
    }

    #[test]
    fn cancel_discards_pending() {
        let (tx, _rx) = unbounded();
        let mut scheduler = DrainScheduler::new(tx, Duration::ZERO);
        scheduler.schedule();
        scheduler.cancel();
        assert!(!scheduler.should_fire());
    }

    #[test]
    fn earlier_reschedule_wins() {
        let (tx, _rx) = unbounded();
        let mut scheduler = DrainScheduler::new(tx, Duration::from_secs(60));
        scheduler.schedule();
        scheduler.schedule_after(Duration::ZERO);
        assert!(scheduler.should_fire());
    }
}
