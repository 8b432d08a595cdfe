//! Pipelined subpartition: the producer-side output queue state machine.
//!
//! A subpartition interleaves four modes, keyed by two orthogonal flags:
//!
//! | `downstream_failed` | replay active | behavior |
//! |---------------------|---------------|----------|
//! | false | no  | normal: poll builds from the head consumer, logs, returns |
//! | false | yes | replaying: poll serves the replay cursor, appends queue at the tail |
//! | true  | no  | drain: polls return `None`, finished head buffers drain into the log |
//! | true  | yes | disallowed; `request_replay` clears `downstream_failed` |
//!
//! While `recovering_in_flight_state` is set the subpartition is
//! rebuilding its own in-flight log after a restore: polls return
//! `None`, availability notifications are suppressed, and appends signal
//! the waiters driving the rebuild.
//!
//! ## Locking
//!
//! One mutex serializes the queue, the in-flight log, the flush flag and
//! the replay cursor. Availability notifications to the read view are
//! issued outside the lock to avoid inversion with the consumer's gate
//! lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::causal::epoch::{CheckpointListener, EpochStartListener};
use crate::causal::{EpochId, PartitionId};

use super::buffer::{Buffer, BufferAndBacklog, BufferConsumer};
use super::inflight::{InFlightIterator, InFlightLog};
use super::partition::PartitionError;

/// End-of-partition control event payload.
const END_OF_PARTITION_EVENT: &[u8] = &[0, 0, 0, 0];

/// Consumer-side hook notified when a finished buffer becomes available.
pub trait BufferAvailabilityListener: Send + Sync {
    /// Called outside the subpartition lock.
    fn notify_data_available(&self);
}

/// Upstream hook used to propagate a downstream failure signal past this
/// producer.
pub trait FailConsumerPropagator: Send + Sync {
    /// Asks the partition parent to signal the failed consumer to the
    /// peers upstream of it.
    fn propagate_fail_consumer(&self, subpartition_index: u32, reason: &str);
}

/// Recovery-manager surface the subpartition reports to.
pub trait SubpartitionRecoveryListener: Send + Sync {
    /// Whether the owning task is still recovering.
    fn is_recovering(&self) -> bool;
    /// A consumer attached a read view while the task was recovering.
    fn notify_new_output_channel(&self, partition_id: PartitionId, subpartition_index: u32);
    /// The subpartition finished rebuilding its in-flight state.
    fn notify_subpartition_in_flight_state_recovered(
        &self,
        partition_id: PartitionId,
        subpartition_index: u32,
    );
}

struct Inner {
    buffers: VecDeque<BufferConsumer>,
    in_flight_log: InFlightLog,
    flush_requested: bool,
    is_finished: bool,
    replay: Option<InFlightIterator>,
    listener: Option<Arc<dyn BufferAvailabilityListener>>,
    backlog: u32,
    total_buffers: u64,
    total_bytes: u64,
}

/// A pipelined, in-memory subpartition with an attached in-flight log.
pub struct PipelinedSubpartition {
    index: u32,
    partition_id: PartitionId,
    inner: Mutex<Inner>,
    buffers_cond: Condvar,
    downstream_failed: AtomicBool,
    recovering_in_flight_state: AtomicBool,
    is_released: AtomicBool,
    parent: Mutex<Weak<dyn FailConsumerPropagator>>,
    recovery_listener: Mutex<Weak<dyn SubpartitionRecoveryListener>>,
}

impl PipelinedSubpartition {
    /// Creates a subpartition whose in-flight log starts at
    /// `initial_epoch`.
    #[must_use]
    pub fn new(index: u32, partition_id: PartitionId, initial_epoch: EpochId) -> Arc<Self> {
        Arc::new(Self {
            index,
            partition_id,
            inner: Mutex::new(Inner {
                buffers: VecDeque::new(),
                in_flight_log: InFlightLog::new(initial_epoch),
                flush_requested: false,
                is_finished: false,
                replay: None,
                listener: None,
                backlog: 0,
                total_buffers: 0,
                total_bytes: 0,
            }),
            buffers_cond: Condvar::new(),
            downstream_failed: AtomicBool::new(false),
            recovering_in_flight_state: AtomicBool::new(false),
            is_released: AtomicBool::new(false),
            parent: Mutex::new(Weak::<NoParent>::new()),
            recovery_listener: Mutex::new(Weak::<NoRecovery>::new()),
        })
    }

    /// Subpartition index within its partition.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The owning partition's id.
    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Wires the partition parent used for fail-consumer propagation.
    pub fn set_parent(&self, parent: Weak<dyn FailConsumerPropagator>) {
        *self.parent.lock() = parent;
    }

    /// Wires the recovery manager of the owning task.
    pub fn set_recovery_listener(&self, listener: Weak<dyn SubpartitionRecoveryListener>) {
        *self.recovery_listener.lock() = listener;
    }

    /// Enqueues a consumer. Returns `false` (closing the consumer) if the
    /// subpartition is finished or released.
    ///
    /// `finish` marks the subpartition finished; no consumer is accepted
    /// afterwards.
    pub fn add(&self, consumer: BufferConsumer, finish: bool) -> bool {
        let recovering = self.recovering_in_flight_state.load(Ordering::Acquire);
        let notify_listener;
        {
            let mut inner = self.inner.lock();
            if inner.is_finished || self.is_released.load(Ordering::Acquire) {
                consumer.close();
                return false;
            }

            let is_buffer = consumer.is_buffer();
            inner.buffers.push_back(consumer);
            inner.total_buffers += 1;
            if is_buffer {
                inner.backlog += 1;
            }
            let notify = self.should_notify_data_available(&inner) || finish;
            inner.is_finished |= finish;

            if recovering {
                self.buffers_cond.notify_all();
            } else if self.downstream_failed.load(Ordering::Acquire) || inner.replay.is_some() {
                self.send_finished_buffers_to_in_flight_log(&mut inner);
            }

            notify_listener = if notify && !recovering {
                inner.listener.clone()
            } else {
                None
            };
        }

        if let Some(listener) = notify_listener {
            listener.notify_data_available();
        }
        true
    }

    /// Appends the end-of-partition event and finishes the subpartition.
    pub fn finish(&self) -> bool {
        let added = self.add(BufferConsumer::finished_event(END_OF_PARTITION_EVENT), true);
        debug!(partition = %self.partition_id, index = self.index, "finished subpartition");
        added
    }

    /// Dispatches the next buffer, from the replay cursor if one is
    /// active, else from the queued consumers.
    ///
    /// Returns `None` while the downstream peer is failed or this
    /// subpartition is rebuilding its in-flight state.
    pub fn poll_buffer(&self) -> Option<BufferAndBacklog> {
        if self.downstream_failed.load(Ordering::Acquire) {
            debug!(
                partition = %self.partition_id,
                index = self.index,
                "poll while downstream is still failed"
            );
            return None;
        }
        if self.recovering_in_flight_state.load(Ordering::Acquire) {
            debug!(
                partition = %self.partition_id,
                index = self.index,
                "poll while still recovering in-flight state"
            );
            return None;
        }

        let mut inner = self.inner.lock();
        if inner.replay.is_some() {
            self.replayed_buffer(&mut inner)
        } else {
            self.buffer_from_queued_consumers(&mut inner)
        }
    }

    /// Requests a flush: makes any queued data visible to the read view
    /// even if the tail consumer is unfinished.
    pub fn flush(&self) {
        let listener;
        {
            let mut inner = self.inner.lock();
            if inner.buffers.is_empty() {
                return;
            }
            inner.flush_requested = true;
            listener = inner.listener.clone();
        }
        if !self.recovering_in_flight_state.load(Ordering::Acquire) {
            if let Some(listener) = listener {
                listener.notify_data_available();
            }
        }
    }

    /// Releases the subpartition: closes and clears all queued consumers
    /// and detaches the read view. Idempotent.
    ///
    /// The in-flight log stays open; a hot-standby replacement of the
    /// consumer may still request a replay from it.
    pub fn release(&self) {
        let listener;
        {
            let mut inner = self.inner.lock();
            if self.is_released.swap(true, Ordering::AcqRel) {
                return;
            }
            for consumer in inner.buffers.drain(..) {
                consumer.close();
            }
            listener = inner.listener.take();
        }
        debug!(partition = %self.partition_id, index = self.index, "released subpartition");
        // Wake a consumer blocked on availability so it observes the
        // released flag.
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    /// Whether [`release`](Self::release) ran.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.is_released.load(Ordering::Acquire)
    }

    /// Marks the downstream consumer failed: subsequent polls return
    /// `None`, finished buffers drain into the in-flight log, and the
    /// failure is propagated upstream through the partition parent.
    pub fn send_fail_consumer_trigger(&self, reason: &str) {
        debug!(
            partition = %self.partition_id,
            index = self.index,
            reason,
            "sending fail consumer trigger"
        );
        self.downstream_failed.store(true, Ordering::Release);

        {
            let mut inner = self.inner.lock();
            if !self.recovering_in_flight_state.load(Ordering::Acquire) {
                self.send_finished_buffers_to_in_flight_log(&mut inner);
            }
        }

        if let Some(parent) = self.parent.lock().upgrade() {
            parent.propagate_fail_consumer(self.index, reason);
        }
    }

    /// Installs a fresh replay cursor over the in-flight log (closing a
    /// prior one) and clears the downstream-failed flag. With an empty
    /// log, dispatch resumes directly from the queue.
    pub fn request_replay(&self) {
        debug!(partition = %self.partition_id, index = self.index, "replay requested");
        let mut inner = self.inner.lock();
        if let Some(mut prior) = inner.replay.take() {
            prior.close();
        }
        inner.replay = inner.in_flight_log.in_flight_iterator();
        self.downstream_failed.store(false, Ordering::Release);
    }

    /// Creates (or re-binds) the read view consumed by the downstream
    /// channel.
    ///
    /// While the owning task is recovering, the attach is reported to the
    /// recovery manager instead of notifying availability.
    pub fn create_read_view(
        self: &Arc<Self>,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Result<SubpartitionView, PartitionError> {
        {
            let mut inner = self.inner.lock();
            if self.is_released.load(Ordering::Acquire) {
                return Err(PartitionError::SubpartitionReleased {
                    partition_id: self.partition_id,
                    index: self.index,
                });
            }
            if inner.listener.is_some() {
                debug!(
                    partition = %self.partition_id,
                    index = self.index,
                    "re-binding read view listener"
                );
            }
            inner.listener = Some(Arc::clone(&listener));
        }

        let recovery = self.recovery_listener.lock().upgrade();
        match recovery {
            Some(manager) if manager.is_recovering() => {
                manager.notify_new_output_channel(self.partition_id, self.index);
            }
            _ => listener.notify_data_available(),
        }

        Ok(SubpartitionView {
            parent: Arc::clone(self),
        })
    }

    /// Forwards a downstream acknowledgement to the in-flight log.
    pub fn notify_downstream_checkpoint_complete(&self, num_buffers_processed: usize) {
        let mut inner = self.inner.lock();
        inner
            .in_flight_log
            .notify_downstream_checkpoint_complete(num_buffers_processed);
    }

    /// Enters in-flight-state rebuild mode: polls return `None` and
    /// availability notifications are suppressed until
    /// [`conclude_in_flight_state_recovery`](Self::conclude_in_flight_state_recovery).
    pub fn begin_in_flight_state_recovery(&self) {
        self.recovering_in_flight_state.store(true, Ordering::Release);
    }

    /// Whether the subpartition is rebuilding its in-flight state.
    #[must_use]
    pub fn is_recovering_in_flight_state(&self) -> bool {
        self.recovering_in_flight_state.load(Ordering::Acquire)
    }

    /// Blocks until a consumer is queued, the rebuild mode ends, or
    /// `timeout` elapses. Returns whether a consumer is queued.
    pub fn wait_for_queued_buffer(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if !inner.buffers.is_empty() {
            return true;
        }
        if !self.recovering_in_flight_state.load(Ordering::Acquire) {
            return false;
        }
        let _ = self.buffers_cond.wait_for(&mut inner, timeout);
        !inner.buffers.is_empty()
    }

    /// Leaves rebuild mode: drains finished buffers into the in-flight
    /// log, reports completion to the recovery manager, and resumes
    /// availability notifications.
    pub fn conclude_in_flight_state_recovery(&self) {
        let listener;
        {
            let mut inner = self.inner.lock();
            self.send_finished_buffers_to_in_flight_log(&mut inner);
            self.recovering_in_flight_state.store(false, Ordering::Release);
            self.buffers_cond.notify_all();
            listener = inner.listener.clone();
        }

        if let Some(manager) = self.recovery_listener.lock().upgrade() {
            manager.notify_subpartition_in_flight_state_recovered(self.partition_id, self.index);
        }
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    /// Whether a poll would currently yield a buffer.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        self.is_available_locked(&inner)
    }

    /// Buffers retained by the in-flight log.
    #[must_use]
    pub fn in_flight_log_size(&self) -> usize {
        self.inner.lock().in_flight_log.retained_buffers()
    }

    /// Queued consumers plus buffers remaining in an active replay.
    #[must_use]
    pub fn queued_buffer_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.buffers.len()
            + inner
                .replay
                .as_ref()
                .map_or(0, InFlightIterator::number_remaining)
    }

    /// Buffers queued past the currently read head.
    #[must_use]
    pub fn buffers_in_backlog(&self) -> u32 {
        self.inner.lock().backlog
    }

    /// Total consumers ever accepted and payload bytes ever dispatched.
    #[must_use]
    pub fn statistics(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.total_buffers, inner.total_bytes)
    }

    // ------------------------------------------------------------------
    // Lock-held helpers
    // ------------------------------------------------------------------

    fn should_notify_data_available(&self, inner: &Inner) -> bool {
        // Notify only when the first finished buffer turned up.
        inner.listener.is_some() && !inner.flush_requested && self.finished_buffer_count(inner) == 1
    }

    fn finished_buffer_count(&self, inner: &Inner) -> usize {
        let replay_remaining = inner
            .replay
            .as_ref()
            .map_or(0, InFlightIterator::number_remaining);
        if inner.buffers.len() == 1 && inner.buffers.back().is_some_and(BufferConsumer::is_finished)
        {
            return 1 + replay_remaining;
        }
        // Only the tail may be unfinished.
        (inner.buffers.len() + replay_remaining).saturating_sub(1)
    }

    fn is_available_locked(&self, inner: &Inner) -> bool {
        inner.flush_requested || self.finished_buffer_count(inner) > 0
    }

    fn next_buffer_is_event(&self, inner: &Inner) -> bool {
        if let Some(replay) = &inner.replay {
            return replay.peek_next().is_some_and(Buffer::is_event);
        }
        inner
            .buffers
            .front()
            .is_some_and(|consumer| !consumer.is_buffer())
    }

    fn replayed_buffer(&self, inner: &mut Inner) -> Option<BufferAndBacklog> {
        debug!(
            partition = %self.partition_id,
            index = self.index,
            "serving next buffer from the in-flight replay"
        );
        let replay = inner.replay.as_mut()?;
        let buffer = replay.next()?;
        let remaining = replay.number_remaining();
        if !replay.has_next() {
            inner.replay = None;
            debug!(
                partition = %self.partition_id,
                index = self.index,
                "finished replaying in-flight log"
            );
        }

        let more_available = inner.replay.is_some() || self.is_available_locked(inner);
        let backlog = inner.backlog + u32::try_from(remaining).unwrap_or(u32::MAX);
        Some(BufferAndBacklog {
            buffer,
            more_available,
            buffers_in_backlog: backlog,
            next_is_event: self.next_buffer_is_event(inner),
        })
    }

    fn buffer_from_queued_consumers(&self, inner: &mut Inner) -> Option<BufferAndBacklog> {
        let mut buffer: Option<Buffer> = None;
        let mut completed_consumer = false;

        if inner.buffers.is_empty() {
            inner.flush_requested = false;
        }

        while let Some(head) = inner.buffers.front() {
            let built = head.build();
            let finished = head.is_finished();

            assert!(
                finished || inner.buffers.len() == 1,
                "an unfinished buffer consumer may only sit at the tail of the queue"
            );

            if inner.buffers.len() == 1 {
                // Drained all available data.
                inner.flush_requested = false;
            }

            if finished {
                completed_consumer = true;
                let consumer = inner
                    .buffers
                    .pop_front()
                    .expect("head existence checked above");
                if consumer.is_buffer() {
                    inner.backlog = inner.backlog.saturating_sub(1);
                }
                consumer.close();
            }

            if built.readable_bytes() > 0 {
                buffer = Some(built);
                break;
            }

            built.recycle();
            if !finished {
                break;
            }
        }

        let buffer = buffer?;
        inner.in_flight_log.log(buffer.clone(), completed_consumer);
        inner.total_bytes += buffer.readable_bytes() as u64;

        debug!(
            partition = %self.partition_id,
            index = self.index,
            bytes = buffer.readable_bytes(),
            backlog = inner.backlog,
            "polled buffer"
        );
        Some(BufferAndBacklog {
            buffer,
            more_available: self.is_available_locked(inner),
            buffers_in_backlog: inner.backlog,
            next_is_event: self.next_buffer_is_event(inner),
        })
    }

    fn send_finished_buffers_to_in_flight_log(&self, inner: &mut Inner) {
        while inner.buffers.len() > 1 {
            match self.buffer_from_queued_consumers(inner) {
                Some(dispatched) => dispatched.buffer.recycle(),
                None => break,
            }
        }
    }
}

impl EpochStartListener for PipelinedSubpartition {
    fn on_epoch_start(&self, epoch: EpochId) {
        self.inner.lock().in_flight_log.start_new_epoch(epoch);
    }
}

impl CheckpointListener for PipelinedSubpartition {
    fn on_checkpoint_complete(&self, checkpoint_id: EpochId) {
        self.inner
            .lock()
            .in_flight_log
            .truncate_epochs_through(checkpoint_id);
    }
}

impl std::fmt::Debug for PipelinedSubpartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PipelinedSubpartition")
            .field("index", &self.index)
            .field("partition_id", &self.partition_id)
            .field("queued", &inner.buffers.len())
            .field("backlog", &inner.backlog)
            .field("in_flight", &inner.in_flight_log.retained_buffers())
            .field("finished", &inner.is_finished)
            .field("released", &self.is_released.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The consumer-visible handle on a subpartition.
#[derive(Clone)]
pub struct SubpartitionView {
    parent: Arc<PipelinedSubpartition>,
}

impl SubpartitionView {
    /// Dispatches the next buffer, if any.
    #[must_use]
    pub fn get_next_buffer(&self) -> Option<BufferAndBacklog> {
        self.parent.poll_buffer()
    }

    /// Whether the viewed subpartition was released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.parent.is_released()
    }

    /// Whether a poll would currently yield a buffer.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.parent.is_available()
    }

    /// The viewed subpartition's index.
    #[must_use]
    pub fn subpartition_index(&self) -> u32 {
        self.parent.index()
    }

    /// Releases the viewed subpartition. A pipelined subpartition is
    /// consumed once; the consumer letting go tears down the producer
    /// side.
    pub fn release_all_resources(&self) {
        self.parent.release();
    }
}

impl std::fmt::Debug for SubpartitionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubpartitionView")
            .field("partition_id", &self.parent.partition_id())
            .field("index", &self.parent.index())
            .finish()
    }
}

struct NoParent;
impl FailConsumerPropagator for NoParent {
    fn propagate_fail_consumer(&self, _subpartition_index: u32, reason: &str) {
        warn!(reason, "fail consumer trigger with no partition parent wired");
    }
}

struct NoRecovery;
impl SubpartitionRecoveryListener for NoRecovery {
    fn is_recovering(&self) -> bool {
        false
    }
    fn notify_new_output_channel(&self, _partition_id: PartitionId, _subpartition_index: u32) {}
    fn notify_subpartition_in_flight_state_recovered(
        &self,
        _partition_id: PartitionId,
        _subpartition_index: u32,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        notifications: AtomicUsize,
    }

    impl BufferAvailabilityListener for CountingListener {
        fn notify_data_available(&self) {
            self.notifications.fetch_add(1, Ordering::Relaxed);
        }
    }

    impl CountingListener {
        fn count(&self) -> usize {
            self.notifications.load(Ordering::Relaxed)
        }
    }

    fn subpartition() -> Arc<PipelinedSubpartition> {
        PipelinedSubpartition::new(0, PartitionId::from_bytes([1u8; 16]), 1)
    }

    fn payload(bytes: &'static [u8]) -> BufferConsumer {
        BufferConsumer::finished_data(bytes)
    }

    #[test]
    fn test_dispatch_equals_log() {
        let sub = subpartition();
        sub.add(payload(b"b1"), false);
        sub.add(payload(b"b2"), false);

        let first = sub.poll_buffer().unwrap();
        assert_eq!(first.buffer.as_bytes().as_ref(), b"b1");
        assert!(first.more_available);
        let second = sub.poll_buffer().unwrap();
        assert_eq!(second.buffer.as_bytes().as_ref(), b"b2");
        assert!(!second.more_available);

        assert_eq!(sub.in_flight_log_size(), 2);
        assert!(sub.poll_buffer().is_none());
    }

    #[test]
    fn test_backlog_accounting() {
        let sub = subpartition();
        sub.add(payload(b"b1"), false);
        sub.add(payload(b"b2"), false);
        assert_eq!(sub.buffers_in_backlog(), 2);

        let first = sub.poll_buffer().unwrap();
        assert_eq!(first.buffers_in_backlog, 1);
        let second = sub.poll_buffer().unwrap();
        assert_eq!(second.buffers_in_backlog, 0);
    }

    #[test]
    fn test_downstream_failed_drains_to_log_without_dispatch() {
        let sub = subpartition();
        // B1, B2 dispatched normally.
        sub.add(payload(b"b1"), false);
        sub.add(payload(b"b2"), false);
        sub.poll_buffer().unwrap();
        sub.poll_buffer().unwrap();

        sub.send_fail_consumer_trigger("consumer lost");
        assert!(sub.poll_buffer().is_none());

        // B3, B4 drain into the log with no dispatch. B4 stays queued
        // until another append pushes it off the tail.
        sub.add(payload(b"b3"), false);
        sub.add(payload(b"b4"), false);
        assert_eq!(sub.in_flight_log_size(), 3);
        assert!(sub.poll_buffer().is_none());
    }

    #[test]
    fn test_replay_returns_logged_sequence_then_queue() {
        let sub = subpartition();
        sub.add(payload(b"b1"), false);
        sub.add(payload(b"b2"), false);
        sub.poll_buffer().unwrap();
        sub.poll_buffer().unwrap();
        sub.send_fail_consumer_trigger("consumer lost");
        sub.add(payload(b"b3"), false);
        sub.add(payload(b"b4"), false);

        sub.request_replay();

        let replayed: Vec<_> = (0..4)
            .map(|_| sub.poll_buffer().unwrap())
            .map(|bnb| bnb.buffer.as_bytes().clone())
            .collect();
        assert_eq!(replayed, vec![&b"b1"[..], b"b2", b"b3", b"b4"]);

        // Replay must not re-log: three were replayed from the log and
        // b4 was logged on its first (normal) dispatch.
        assert_eq!(sub.in_flight_log_size(), 4);

        // New appends after the replay dispatch normally.
        sub.add(payload(b"b5"), false);
        let next = sub.poll_buffer().unwrap();
        assert_eq!(next.buffer.as_bytes().as_ref(), b"b5");
    }

    #[test]
    fn test_request_replay_on_empty_log_resumes_queue_dispatch() {
        let sub = subpartition();
        sub.send_fail_consumer_trigger("consumer lost");
        sub.request_replay();

        sub.add(payload(b"b1"), false);
        let polled = sub.poll_buffer().unwrap();
        assert_eq!(polled.buffer.as_bytes().as_ref(), b"b1");
    }

    #[test]
    fn test_flush_notification_semantics() {
        let sub = subpartition();
        let listener = Arc::new(CountingListener::default());
        let _view = sub.create_read_view(listener.clone()).unwrap();
        assert_eq!(listener.count(), 1); // view creation notifies

        // Unfinished consumer: no notification.
        let (builder, consumer) = BufferConsumer::data_pair();
        builder.append(b"partial");
        sub.add(consumer, false);
        assert_eq!(listener.count(), 1);

        // Second consumer: the first is implicitly considered finished.
        builder.finish();
        sub.add(payload(b"b2"), false);
        assert_eq!(listener.count(), 2);

        // Drain to empty: no further notification without a new finished
        // buffer or an explicit flush.
        while sub.poll_buffer().is_some() {}
        assert_eq!(listener.count(), 2);

        let (builder2, consumer2) = BufferConsumer::data_pair();
        builder2.append(b"tail");
        sub.add(consumer2, false);
        assert_eq!(listener.count(), 2);

        sub.flush();
        assert_eq!(listener.count(), 3);
    }

    #[test]
    fn test_release_is_idempotent_and_clears_queue() {
        let sub = subpartition();
        sub.add(payload(b"b1"), false);
        sub.release();
        assert!(sub.is_released());
        assert_eq!(sub.queued_buffer_count(), 0);
        sub.release();
        assert!(sub.is_released());

        // Rejected after release.
        assert!(!sub.add(payload(b"b2"), false));
    }

    #[test]
    fn test_add_after_finish_rejected() {
        let sub = subpartition();
        assert!(sub.finish());
        assert!(!sub.add(payload(b"late"), false));
    }

    #[test]
    fn test_finish_appends_end_of_partition_event() {
        let sub = subpartition();
        sub.finish();
        let polled = sub.poll_buffer().unwrap();
        assert!(polled.buffer.is_event());
    }

    #[test]
    fn test_recovering_in_flight_state_suppresses_polls_and_notifications() {
        let sub = subpartition();
        let listener = Arc::new(CountingListener::default());
        let _view = sub.create_read_view(listener.clone()).unwrap();
        let baseline = listener.count();

        sub.begin_in_flight_state_recovery();
        sub.add(payload(b"b1"), false);
        assert!(sub.poll_buffer().is_none());
        assert_eq!(listener.count(), baseline);

        sub.conclude_in_flight_state_recovery();
        // Conclusion drains nothing (single queued consumer stays) but
        // resumes notifications.
        assert_eq!(listener.count(), baseline + 1);
        let polled = sub.poll_buffer().unwrap();
        assert_eq!(polled.buffer.as_bytes().as_ref(), b"b1");
    }

    #[test]
    fn test_wait_for_queued_buffer_signaled_by_add() {
        let sub = subpartition();
        sub.begin_in_flight_state_recovery();

        let waiter = {
            let sub = Arc::clone(&sub);
            std::thread::spawn(move || sub.wait_for_queued_buffer(Duration::from_secs(5)))
        };
        // Give the waiter a moment to block.
        std::thread::sleep(Duration::from_millis(20));
        sub.add(payload(b"b1"), false);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_replay_restart_closes_prior_iterator() {
        let sub = subpartition();
        sub.add(payload(b"b1"), false);
        sub.add(payload(b"b2"), false);
        sub.poll_buffer().unwrap();
        sub.poll_buffer().unwrap();

        sub.request_replay();
        let first = sub.poll_buffer().unwrap();
        assert_eq!(first.buffer.as_bytes().as_ref(), b"b1");

        // Restarting replays from the log head again.
        sub.request_replay();
        let restarted = sub.poll_buffer().unwrap();
        assert_eq!(restarted.buffer.as_bytes().as_ref(), b"b1");
    }

    #[test]
    fn test_empty_finished_consumers_are_skipped() {
        let sub = subpartition();
        sub.add(BufferConsumer::finished_data(b""), false);
        sub.add(payload(b"real"), false);

        let polled = sub.poll_buffer().unwrap();
        assert_eq!(polled.buffer.as_bytes().as_ref(), b"real");
        // The empty consumer produced no logged buffer.
        assert_eq!(sub.in_flight_log_size(), 1);
    }
}
