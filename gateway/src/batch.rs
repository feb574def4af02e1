//! Batch accumulation with dual flush triggers.
//!
//! A [`Batcher`] gathers items until either the size threshold is reached
//! (flush now) or no new item has arrived for `max_latency` (flush on
//! timer). Every push cancels the armed timer and re-arms it, so a steady
//! trickle below the size threshold keeps postponing the flush: this is a
//! debounce, not a fixed period.
//!
//! The batcher does not send anything itself. Timers are armed through a
//! caller-supplied `schedule` closure which posts the timer epoch back to
//! whoever owns the batcher; [`Batcher::expire`] then tells stale timers
//! from the current one.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Flush thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Flush as soon as this many items are gathered.
    pub max_batch_size: usize,
    /// Flush after this long without a new item.
    pub max_latency: Duration,
}

impl BatchPolicy {
    pub fn new(max_batch_size: usize, max_latency: Duration) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            max_latency,
        }
    }
}

/// An armed flush timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct FlushTimer {
    handle: JoinHandle<()>,
}

impl FlushTimer {
    /// Run `on_fire` after `after` on the current tokio runtime.
    pub fn spawn<F>(after: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire();
        });
        Self { handle }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Outcome of [`Batcher::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// Size threshold reached; the caller must flush now.
    FlushNow,
    /// A flush timer was (re)armed.
    Scheduled,
}

/// Accumulation buffer with at most one pending flush timer.
#[derive(Debug)]
pub struct Batcher<T> {
    policy: BatchPolicy,
    gathered: Vec<T>,
    pending_flush: Option<FlushTimer>,
    epoch: u64,
}

impl<T> Batcher<T> {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            gathered: Vec::new(),
            pending_flush: None,
            epoch: 0,
        }
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.gathered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gathered.is_empty()
    }

    /// Items gathered so far, in send order.
    pub fn gathered(&self) -> &[T] {
        &self.gathered
    }

    pub fn has_pending_flush(&self) -> bool {
        self.pending_flush.is_some()
    }

    /// Append an item.
    ///
    /// Cancels the pending timer, then either reports that the size
    /// threshold was reached or arms a new timer via
    /// `schedule(epoch, max_latency)`.
    pub fn push<F>(&mut self, item: T, schedule: F) -> Pushed
    where
        F: FnOnce(u64, Duration) -> FlushTimer,
    {
        self.pending_flush = None;
        self.gathered.push(item);

        if self.gathered.len() >= self.policy.max_batch_size {
            return Pushed::FlushNow;
        }

        self.epoch += 1;
        self.pending_flush = Some(schedule(self.epoch, self.policy.max_latency));
        Pushed::Scheduled
    }

    /// Acknowledge a fired timer. Returns true if `epoch` belongs to the
    /// timer currently armed; stale timers return false.
    pub fn expire(&mut self, epoch: u64) -> bool {
        if self.pending_flush.is_none() || epoch != self.epoch {
            return false;
        }
        self.pending_flush = None;
        true
    }

    /// Cancel the pending timer and take everything gathered.
    pub fn take(&mut self) -> Vec<T> {
        self.pending_flush = None;
        std::mem::take(&mut self.gathered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn scheduler(tx: &mpsc::UnboundedSender<u64>) -> impl FnOnce(u64, Duration) -> FlushTimer {
        let tx = tx.clone();
        move |epoch, after| {
            FlushTimer::spawn(after, move || {
                let _ = tx.send(epoch);
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_bypasses_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut batcher = Batcher::new(BatchPolicy::new(3, Duration::from_millis(100)));

        assert_eq!(batcher.push(1, scheduler(&tx)), Pushed::Scheduled);
        assert_eq!(batcher.push(2, scheduler(&tx)), Pushed::Scheduled);
        assert_eq!(batcher.push(3, scheduler(&tx)), Pushed::FlushNow);
        assert!(!batcher.has_pending_flush());
        assert_eq!(batcher.take(), vec![1, 2, 3]);
        assert!(batcher.is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_quiet_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut batcher = Batcher::new(BatchPolicy::new(10, Duration::from_millis(100)));

        batcher.push("a", scheduler(&tx));
        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let epoch = rx.recv().await.unwrap();
        assert!(batcher.expire(epoch));
        assert_eq!(batcher.take(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_resets_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut batcher = Batcher::new(BatchPolicy::new(100, Duration::from_millis(100)));

        for i in 0..10 {
            batcher.push(i, scheduler(&tx));
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(rx.try_recv().is_err(), "flushed early at item {}", i);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let epoch = rx.recv().await.unwrap();
        assert!(batcher.expire(epoch));
        assert_eq!(batcher.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut batcher = Batcher::new(BatchPolicy::new(100, Duration::from_millis(100)));

        batcher.push(1, scheduler(&tx));
        batcher.push(2, scheduler(&tx));
        assert!(!batcher.expire(1));
        assert!(batcher.has_pending_flush());
        assert!(batcher.expire(2));
        assert!(!batcher.expire(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_cancels_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut batcher = Batcher::new(BatchPolicy::new(100, Duration::from_millis(100)));

        batcher.push(1, scheduler(&tx));
        assert_eq!(batcher.take(), vec![1]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_policy_size_is_at_least_one() {
        assert_eq!(BatchPolicy::new(0, Duration::ZERO).max_batch_size, 1);
    }
}
