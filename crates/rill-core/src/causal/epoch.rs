//! Epoch tracking for checkpoint-bounded execution.
//!
//! An epoch is the span of execution between two consecutive checkpoint
//! barriers; its ID equals the checkpoint ID that opened it. The
//! [`EpochTracker`] segments the task's record stream into epochs and
//! assigns each processed record a monotonic index that restarts at 0 on
//! every epoch boundary. Determinants and in-flight buffers are scoped to
//! the epoch they were produced in, so the tracker is also the fan-out
//! point for epoch-start and checkpoint-complete notifications.
//!
//! ## Threading
//!
//! The tracker performs no internal locking. All methods must be called
//! with the task-level checkpoint lock held (in practice the tracker
//! lives inside that lock's mutex), and every subscriber callback runs
//! synchronously on the task thread, in subscription order.

use std::sync::Arc;

use tracing::debug;

use super::EpochId;

/// Subscriber notified synchronously when a new epoch starts.
pub trait EpochStartListener: Send + Sync {
    /// Called on the task thread, under the checkpoint lock.
    fn on_epoch_start(&self, epoch: EpochId);
}

/// Subscriber notified when a checkpoint has been acknowledged cluster-wide.
pub trait CheckpointListener: Send + Sync {
    /// Called on the task thread, under the checkpoint lock. Authorizes
    /// truncation of logs for all epochs up to and including
    /// `checkpoint_id`.
    fn on_checkpoint_complete(&self, checkpoint_id: EpochId);
}

/// Subscriber notified when a replay's armed record-count target is hit.
pub trait RecordCountTargetListener: Send + Sync {
    /// Called on the task thread immediately after the record whose index
    /// reached the target was processed.
    fn on_record_count_target_reached(&self, target: u32);
}

/// Segments execution into epochs and issues per-record indices.
pub struct EpochTracker {
    current_epoch: EpochId,
    record_count: u32,
    record_count_target: Option<u32>,
    epoch_start_listeners: Vec<Arc<dyn EpochStartListener>>,
    checkpoint_listeners: Vec<Arc<dyn CheckpointListener>>,
    recovery_manager: Option<Arc<dyn RecordCountTargetListener>>,
}

impl EpochTracker {
    /// Creates a tracker positioned at epoch 0, record 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_epoch: 0,
            record_count: 0,
            record_count_target: None,
            epoch_start_listeners: Vec::new(),
            checkpoint_listeners: Vec::new(),
            recovery_manager: None,
        }
    }

    /// The last started epoch.
    #[must_use]
    pub fn current_epoch(&self) -> EpochId {
        self.current_epoch
    }

    /// Index of the next record within the current epoch.
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Advances the record index. Called after each input record is
    /// processed, under the checkpoint lock.
    ///
    /// If a record-count target is armed and the new count reaches it,
    /// the recovery manager is notified synchronously and the target is
    /// disarmed.
    pub fn inc_record_count(&mut self) {
        self.record_count += 1;
        self.check_record_count_target();
    }

    /// Closes the previous epoch and opens `epoch`, resetting the record
    /// index to 0. Epoch-start subscribers are notified synchronously in
    /// subscription order.
    pub fn start_new_epoch(&mut self, epoch: EpochId) {
        debug!(
            previous = self.current_epoch,
            epoch, "starting new epoch"
        );
        self.current_epoch = epoch;
        self.record_count = 0;
        for listener in &self.epoch_start_listeners {
            listener.on_epoch_start(epoch);
        }
    }

    /// Arms a replay target: when `record_count` reaches `target`, the
    /// recovery manager is told the replay hit the epoch boundary it was
    /// driving towards. Fires immediately if the count is already there.
    pub fn set_record_count_target(&mut self, target: u32) {
        debug!(target, record_count = self.record_count, "arming record count target");
        self.record_count_target = Some(target);
        self.check_record_count_target();
    }

    /// Wires the recovery manager that record-count targets report to.
    pub fn set_recovery_manager(&mut self, manager: Arc<dyn RecordCountTargetListener>) {
        self.recovery_manager = Some(manager);
    }

    /// Subscribes to epoch-start events. Callbacks run in subscription
    /// order.
    pub fn subscribe_to_epoch_start_events(&mut self, listener: Arc<dyn EpochStartListener>) {
        self.epoch_start_listeners.push(listener);
    }

    /// Subscribes to checkpoint-complete events.
    pub fn subscribe_to_checkpoint_complete_events(&mut self, listener: Arc<dyn CheckpointListener>) {
        self.checkpoint_listeners.push(listener);
    }

    /// Forwards a completed checkpoint to all subscribers, authorizing
    /// truncation of logs for epochs `<= checkpoint_id`.
    pub fn notify_checkpoint_complete(&mut self, checkpoint_id: EpochId) {
        debug!(checkpoint_id, "checkpoint complete");
        for listener in &self.checkpoint_listeners {
            listener.on_checkpoint_complete(checkpoint_id);
        }
    }

    fn check_record_count_target(&mut self) {
        if self.record_count_target == Some(self.record_count) {
            let target = self.record_count_target.take().unwrap_or_default();
            if let Some(manager) = &self.recovery_manager {
                manager.on_record_count_target_reached(target);
            }
        }
    }
}

impl Default for EpochTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        epochs: Mutex<Vec<EpochId>>,
        checkpoints: Mutex<Vec<EpochId>>,
    }

    impl EpochStartListener for RecordingListener {
        fn on_epoch_start(&self, epoch: EpochId) {
            self.epochs.lock().unwrap().push(epoch);
        }
    }

    impl CheckpointListener for RecordingListener {
        fn on_checkpoint_complete(&self, checkpoint_id: EpochId) {
            self.checkpoints.lock().unwrap().push(checkpoint_id);
        }
    }

    #[derive(Default)]
    struct TargetProbe {
        hits: AtomicU32,
        last_target: AtomicU64,
    }

    impl RecordCountTargetListener for TargetProbe {
        fn on_record_count_target_reached(&self, target: u32) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.last_target.store(u64::from(target), Ordering::Relaxed);
        }
    }

    #[test]
    fn test_record_index_restarts_on_epoch_boundary() {
        let mut tracker = EpochTracker::new();
        assert_eq!(tracker.current_epoch(), 0);

        tracker.inc_record_count();
        tracker.inc_record_count();
        assert_eq!(tracker.record_count(), 2);

        tracker.start_new_epoch(1);
        assert_eq!(tracker.current_epoch(), 1);
        assert_eq!(tracker.record_count(), 0);
    }

    #[test]
    fn test_epoch_start_listeners_fire_in_subscription_order() {
        let mut tracker = EpochTracker::new();
        let first = Arc::new(RecordingListener::default());
        let second = Arc::new(RecordingListener::default());
        tracker.subscribe_to_epoch_start_events(first.clone());
        tracker.subscribe_to_epoch_start_events(second.clone());

        tracker.start_new_epoch(3);
        assert_eq!(*first.epochs.lock().unwrap(), vec![3]);
        assert_eq!(*second.epochs.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_checkpoint_complete_forwarded() {
        let mut tracker = EpochTracker::new();
        let listener = Arc::new(RecordingListener::default());
        tracker.subscribe_to_checkpoint_complete_events(listener.clone());

        tracker.notify_checkpoint_complete(7);
        assert_eq!(*listener.checkpoints.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_record_count_target_fires_once() {
        let mut tracker = EpochTracker::new();
        let probe = Arc::new(TargetProbe::default());
        tracker.set_recovery_manager(probe.clone());

        tracker.set_record_count_target(2);
        tracker.inc_record_count();
        assert_eq!(probe.hits.load(Ordering::Relaxed), 0);
        tracker.inc_record_count();
        assert_eq!(probe.hits.load(Ordering::Relaxed), 1);
        assert_eq!(probe.last_target.load(Ordering::Relaxed), 2);

        // Disarmed: further records do not re-fire.
        tracker.inc_record_count();
        assert_eq!(probe.hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_record_count_target_fires_immediately_when_already_reached() {
        let mut tracker = EpochTracker::new();
        let probe = Arc::new(TargetProbe::default());
        tracker.set_recovery_manager(probe.clone());

        tracker.set_record_count_target(0);
        assert_eq!(probe.hits.load(Ordering::Relaxed), 1);
    }
}
