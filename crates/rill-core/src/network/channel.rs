//! Consumer-side input channels.
//!
//! A [`LocalInputChannel`] consumes a subpartition produced in the same
//! process through the partition registry; a [`RemoteInputChannel`]
//! consumes one fed by the network transport. Both share the dedup
//! protocol used after an upstream replay: the recovery manager arms a
//! dedup count on the replacement channel, the first `n` received
//! buffers are silently dropped, and delivery resumes once the counter
//! hits zero.
//!
//! Channels can mutate identity at runtime: `to_new_local_input_channel`
//! / `to_new_remote_input_channel` produce a replacement at the same
//! channel index after releasing the old channel. Credit-based gates
//! reassign exclusive buffer segments to remote replacements.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::causal::PartitionId;
use crate::protocol::TaskEvent;
use crate::time::TimerQueue;

use super::buffer::Buffer;
use super::dispatch::TaskEventDispatcher;
use super::partition::{PartitionError, ResultPartitionManager};
use super::subpartition::{BufferAvailabilityListener, SubpartitionView};

/// Errors surfaced by input channels.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Registry-level failure; `PartitionNotFound` is retried with
    /// backoff until `max_backoff` is exhausted.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// The channel was already released.
    #[error("input channel {channel_index} for partition {partition_id} already released")]
    Released {
        /// The released channel's index.
        channel_index: u32,
        /// The partition it consumed.
        partition_id: PartitionId,
    },

    /// The consumed subpartition was released mid-read; unwinds the
    /// consumer as a task cancellation.
    #[error("consumed subpartition of input channel {channel_index} was released")]
    Cancelled {
        /// The affected channel's index.
        channel_index: u32,
    },

    /// A buffer was queried before the subpartition was requested.
    #[error("input channel {channel_index} queried before requesting the subpartition")]
    NotRequested {
        /// The affected channel's index.
        channel_index: u32,
    },

    /// Publishing a task event failed because the producer was not
    /// reachable.
    #[error("error publishing task event to producer of partition {partition_id}")]
    EventPublish {
        /// The partition whose producer was unreachable.
        partition_id: PartitionId,
    },
}

/// Exponential backoff bounds for subpartition requests.
#[derive(Debug, Clone, Copy)]
pub struct ChannelBackoffConfig {
    /// First retry delay. Zero disables retries.
    pub initial_backoff: Duration,
    /// Retry delays double up to this bound; the next miss is fatal.
    pub max_backoff: Duration,
}

impl Default for ChannelBackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Gate-side hook notified when a channel has data to poll.
pub trait ChannelAvailabilityListener: Send + Sync {
    /// Called when `channel_index` transitioned to non-empty.
    fn notify_channel_non_empty(&self, channel_index: u32);
}

/// Dedup surface the recovery manager drives on replacement channels.
pub trait DeduplicatingChannel: Send + Sync {
    /// Position of this channel in its gate.
    fn channel_index(&self) -> u32;
    /// The partition this channel consumes.
    fn partition_id(&self) -> PartitionId;
    /// Arms the number of replayed buffers to drop silently.
    fn set_number_buffers_deduplicate(&self, count: u32);
    /// Starts dropping until the armed counter reaches zero.
    fn set_deduplicating(&self);
    /// Returns and zeroes the delivered-buffer counter; bounds the
    /// upstream in-flight truncation request.
    fn take_number_buffers_removed(&self) -> u32;
    /// Buffers consumed since the last reset; seeds the dedup count of
    /// a successor channel after an upstream failure.
    fn number_buffers_consumed(&self) -> u32;
    /// Zeroes the consumed counter at a checkpoint boundary.
    fn reset_number_buffers_consumed(&self);
}

/// A delivered buffer with availability telemetry.
#[derive(Debug)]
pub struct BufferAndAvailability {
    /// The delivered buffer.
    pub buffer: Buffer,
    /// Whether another poll would yield a buffer right away.
    pub more_available: bool,
    /// Sender-side backlog behind this buffer.
    pub buffers_in_backlog: u32,
}

/// State shared by both channel flavors.
struct ChannelCore {
    channel_index: u32,
    partition_id: PartitionId,
    backoff: ChannelBackoffConfig,
    current_backoff: Mutex<Option<Duration>>,
    num_buffers_removed: AtomicU32,
    num_buffers_consumed: AtomicU32,
    dedup_remaining: AtomicU32,
    deduplicating: AtomicBool,
    released: AtomicBool,
    error: Mutex<Option<ChannelError>>,
    availability: Mutex<Option<Arc<dyn ChannelAvailabilityListener>>>,
}

impl ChannelCore {
    fn new(channel_index: u32, partition_id: PartitionId, backoff: ChannelBackoffConfig) -> Self {
        Self {
            channel_index,
            partition_id,
            backoff,
            current_backoff: Mutex::new(None),
            num_buffers_removed: AtomicU32::new(0),
            num_buffers_consumed: AtomicU32::new(0),
            dedup_remaining: AtomicU32::new(0),
            deduplicating: AtomicBool::new(false),
            released: AtomicBool::new(false),
            error: Mutex::new(None),
            availability: Mutex::new(None),
        }
    }

    fn check_error(&self) -> Result<(), ChannelError> {
        match self.error.lock().as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn set_error(&self, error: ChannelError) {
        warn!(
            channel = self.channel_index,
            partition = %self.partition_id,
            %error,
            "input channel entered error state"
        );
        self.error.lock().get_or_insert(error);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Doubles the current backoff up to the bound. Returns whether a
    /// retry is allowed.
    fn increase_backoff(&self) -> bool {
        if self.backoff.initial_backoff.is_zero() {
            return false;
        }
        let mut current = self.current_backoff.lock();
        match *current {
            None => {
                *current = Some(self.backoff.initial_backoff);
                true
            }
            Some(backoff) if backoff < self.backoff.max_backoff => {
                *current = Some((backoff * 2).min(self.backoff.max_backoff));
                true
            }
            Some(_) => false,
        }
    }

    fn current_backoff(&self) -> Duration {
        self.current_backoff.lock().unwrap_or(Duration::ZERO)
    }

    /// Whether the next received buffer must be dropped as a replayed
    /// duplicate. Consumes one unit of the armed counter.
    fn consume_dedup(&self) -> bool {
        if !self.deduplicating.load(Ordering::Acquire) {
            return false;
        }
        let remaining = self.dedup_remaining.load(Ordering::Acquire);
        if remaining == 0 {
            self.deduplicating.store(false, Ordering::Release);
            return false;
        }
        self.dedup_remaining.store(remaining - 1, Ordering::Release);
        if remaining == 1 {
            self.deduplicating.store(false, Ordering::Release);
        }
        true
    }

    fn record_delivered(&self) {
        self.num_buffers_removed.fetch_add(1, Ordering::Relaxed);
        self.num_buffers_consumed.fetch_add(1, Ordering::Relaxed);
    }

    fn notify_non_empty(&self) {
        let listener = self.availability.lock().clone();
        if let Some(listener) = listener {
            listener.notify_channel_non_empty(self.channel_index);
        }
    }

    fn released_error(&self) -> ChannelError {
        ChannelError::Released {
            channel_index: self.channel_index,
            partition_id: self.partition_id,
        }
    }
}

macro_rules! impl_deduplicating_channel {
    ($ty:ty) => {
        impl DeduplicatingChannel for $ty {
            fn channel_index(&self) -> u32 {
                self.core.channel_index
            }

            fn partition_id(&self) -> PartitionId {
                self.core.partition_id
            }

            fn set_number_buffers_deduplicate(&self, count: u32) {
                self.core.dedup_remaining.store(count, Ordering::Release);
            }

            fn set_deduplicating(&self) {
                if self.core.dedup_remaining.load(Ordering::Acquire) > 0 {
                    self.core.deduplicating.store(true, Ordering::Release);
                }
            }

            fn take_number_buffers_removed(&self) -> u32 {
                let removed = self.core.num_buffers_removed.swap(0, Ordering::AcqRel);
                info!(
                    channel = self.core.channel_index,
                    removed, "taking delivered-buffer count to bound upstream truncation"
                );
                removed
            }

            fn number_buffers_consumed(&self) -> u32 {
                self.core.num_buffers_consumed.load(Ordering::Acquire)
            }

            fn reset_number_buffers_consumed(&self) {
                self.core.num_buffers_consumed.store(0, Ordering::Release);
            }
        }
    };
}

// ---------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------

/// An input channel that consumes a colocated subpartition.
pub struct LocalInputChannel {
    core: ChannelCore,
    partition_manager: Arc<ResultPartitionManager>,
    dispatcher: Arc<TaskEventDispatcher>,
    timer: Arc<TimerQueue>,
    /// Guards the lazy establishment of the subpartition view.
    view: Mutex<Option<SubpartitionView>>,
    view_ready: Condvar,
    requested: AtomicBool,
    pending_retrigger: Mutex<Option<u64>>,
}

impl LocalInputChannel {
    /// Creates a channel consuming `partition_id` through the local
    /// registry.
    #[must_use]
    pub fn new(
        channel_index: u32,
        partition_id: PartitionId,
        partition_manager: Arc<ResultPartitionManager>,
        dispatcher: Arc<TaskEventDispatcher>,
        timer: Arc<TimerQueue>,
        backoff: ChannelBackoffConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ChannelCore::new(channel_index, partition_id, backoff),
            partition_manager,
            dispatcher,
            timer,
            view: Mutex::new(None),
            view_ready: Condvar::new(),
            requested: AtomicBool::new(false),
            pending_retrigger: Mutex::new(None),
        })
    }

    /// Registers the gate-side availability hook.
    pub fn set_availability_listener(&self, listener: Arc<dyn ChannelAvailabilityListener>) {
        *self.core.availability.lock() = Some(listener);
    }

    /// Requests the subpartition view, retrying `PartitionNotFound` with
    /// exponential backoff through the per-task timer queue.
    pub fn request_subpartition(
        self: &Arc<Self>,
        subpartition_index: u32,
    ) -> Result<(), ChannelError> {
        self.requested.store(true, Ordering::Release);
        let retrigger_delay;
        {
            let mut view = self.view.lock();
            if self.core.is_released() {
                return Err(self.core.released_error());
            }
            if view.is_some() {
                return Ok(());
            }

            debug!(
                channel = self.core.channel_index,
                partition = %self.core.partition_id,
                subpartition_index,
                "requesting local subpartition"
            );
            let listener: Arc<dyn BufferAvailabilityListener> = Arc::clone(self) as Arc<dyn BufferAvailabilityListener>;
            match self.partition_manager.create_subpartition_view(
                self.core.partition_id,
                subpartition_index,
                listener,
            ) {
                Ok(created) => {
                    *view = Some(created);
                    // The channel may have been released while the
                    // request was in flight.
                    if self.core.is_released() {
                        if let Some(view) = view.take() {
                            view.release_all_resources();
                        }
                    }
                    self.view_ready.notify_all();
                    return Ok(());
                }
                Err(PartitionError::PartitionNotFound(id)) => {
                    if self.core.increase_backoff() {
                        retrigger_delay = self.core.current_backoff();
                    } else {
                        return Err(PartitionError::PartitionNotFound(id).into());
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }

        // Outside the lock: scheduling re-enters this method later.
        self.retrigger_subpartition_request(retrigger_delay, subpartition_index);
        Ok(())
    }

    fn retrigger_subpartition_request(self: &Arc<Self>, delay: Duration, subpartition_index: u32) {
        debug!(
            channel = self.core.channel_index,
            partition = %self.core.partition_id,
            delay_ms = delay.as_millis() as u64,
            "retriggering subpartition request"
        );
        let this = Arc::clone(self);
        let id = self.timer.schedule(
            delay,
            Box::new(move |_queue| {
                if this.core.is_released() {
                    return;
                }
                if let Err(error) = this.request_subpartition(subpartition_index) {
                    this.core.set_error(error);
                    // Wake a consumer blocked on the view so it observes
                    // the error.
                    this.view_ready.notify_all();
                }
            }),
        );
        *self.pending_retrigger.lock() = Some(id);
    }

    fn check_and_wait_for_subpartition_view(&self) -> Result<SubpartitionView, ChannelError> {
        // Blocks until the asynchronous request completes or the channel
        // is released.
        let mut view = self.view.lock();
        loop {
            self.core.check_error()?;
            if self.core.is_released() {
                return Err(self.core.released_error());
            }
            if let Some(view) = view.as_ref() {
                return Ok(view.clone());
            }
            if !self.requested.load(Ordering::Acquire) {
                return Err(ChannelError::NotRequested {
                    channel_index: self.core.channel_index,
                });
            }
            self.view_ready.wait(&mut view);
        }
    }

    /// Polls the next buffer, applying replay deduplication.
    ///
    /// Returns `Ok(None)` when nothing is available; `Cancelled` when
    /// the consumed subpartition was released mid-read.
    pub fn get_next_buffer(&self) -> Result<Option<BufferAndAvailability>, ChannelError> {
        self.core.check_error()?;

        let view = {
            let guard = self.view.lock();
            match guard.as_ref() {
                Some(view) => view.clone(),
                None => {
                    if self.core.is_released() {
                        debug!(
                            channel = self.core.channel_index,
                            "released channel polled: returning empty"
                        );
                        return Ok(None);
                    }
                    drop(guard);
                    self.check_and_wait_for_subpartition_view()?
                }
            }
        };

        loop {
            let Some(next) = view.get_next_buffer() else {
                if view.is_released() {
                    return Err(ChannelError::Cancelled {
                        channel_index: self.core.channel_index,
                    });
                }
                return Ok(None);
            };

            if self.core.consume_dedup() {
                debug!(
                    channel = self.core.channel_index,
                    "dropped replayed duplicate buffer"
                );
                let more = next.more_available;
                next.buffer.recycle();
                if more {
                    continue;
                }
                return Ok(None);
            }

            self.core.record_delivered();
            return Ok(Some(BufferAndAvailability {
                buffer: next.buffer,
                more_available: next.more_available,
                buffers_in_backlog: next.buffers_in_backlog,
            }));
        }
    }

    /// Publishes a task event to the producer of the consumed partition.
    pub fn send_task_event(&self, event: TaskEvent) -> Result<(), ChannelError> {
        self.core.check_error()?;
        assert!(
            self.view.lock().is_some() || matches!(event, TaskEvent::InFlightLogRequest(_)),
            "task event sent to producer before requesting the subpartition"
        );
        debug!(
            channel = self.core.channel_index,
            partition = %self.core.partition_id,
            "sending task event"
        );
        if self.dispatcher.publish(self.core.partition_id, event) {
            Ok(())
        } else {
            Err(ChannelError::EventPublish {
                partition_id: self.core.partition_id,
            })
        }
    }

    /// Whether [`release_all_resources`](Self::release_all_resources)
    /// ran.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.core.is_released()
    }

    /// Releases the channel. Idempotent; cancels an outstanding
    /// retrigger; concurrent polls observe the flag and return empty.
    ///
    /// If the channel is in an error state the consumed view is kept
    /// alive so a hot-standby replacement can still replay from it.
    pub fn release_all_resources(&self) {
        if self.core.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.pending_retrigger.lock().take() {
            self.timer.cancel(id);
        }
        let view = self.view.lock().take();
        self.view_ready.notify_all();
        if let Some(view) = view {
            if self.core.error.lock().is_some() {
                debug!(
                    channel = self.core.channel_index,
                    "released channel resources but kept the consumed view"
                );
            } else {
                view.release_all_resources();
            }
        }
    }

    /// Replaces this channel with a fresh local one at the same index,
    /// releasing this one first.
    #[must_use]
    pub fn to_new_local_input_channel(
        &self,
        new_partition_id: PartitionId,
        partition_manager: Arc<ResultPartitionManager>,
        dispatcher: Arc<TaskEventDispatcher>,
        timer: Arc<TimerQueue>,
        backoff: ChannelBackoffConfig,
    ) -> Arc<LocalInputChannel> {
        self.release_all_resources();
        LocalInputChannel::new(
            self.core.channel_index,
            new_partition_id,
            partition_manager,
            dispatcher,
            timer,
            backoff,
        )
    }

    /// Replaces this channel with a remote one at the same index,
    /// releasing this one first. Credit-based gates get the replacement
    /// handed over for exclusive-segment assignment.
    #[must_use]
    pub fn to_new_remote_input_channel(
        &self,
        new_partition_id: PartitionId,
        producer_address: ConnectionId,
        connection_manager: Arc<dyn ConnectionManager>,
        backoff: ChannelBackoffConfig,
        gate: Option<&dyn CreditAssigner>,
    ) -> Arc<RemoteInputChannel> {
        self.release_all_resources();
        let replacement = RemoteInputChannel::new(
            self.core.channel_index,
            new_partition_id,
            producer_address,
            connection_manager,
            backoff,
        );
        if let Some(gate) = gate {
            if gate.is_credit_based() {
                gate.assign_exclusive_segments(&replacement);
            }
        }
        replacement
    }
}

impl BufferAvailabilityListener for LocalInputChannel {
    fn notify_data_available(&self) {
        self.core.notify_non_empty();
    }
}

impl_deduplicating_channel!(LocalInputChannel);

impl std::fmt::Debug for LocalInputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalInputChannel")
            .field("channel_index", &self.core.channel_index)
            .field("partition_id", &self.core.partition_id)
            .field("released", &self.core.is_released())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------

/// Address of a producer reachable over the network transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Transport address of the producing task manager.
    pub address: String,
    /// Multiplexing index on that connection.
    pub connection_index: u32,
}

/// Transport-side collaborator for remote channels.
pub trait ConnectionManager: Send + Sync {
    /// Opens (or reuses) a client to the producer and issues the
    /// subpartition request. Buffers arrive asynchronously through
    /// [`RemoteInputChannel::on_buffer`].
    fn request_subpartition(
        &self,
        connection: &ConnectionId,
        partition_id: PartitionId,
        subpartition_index: u32,
        channel: &Arc<RemoteInputChannel>,
    ) -> Result<(), ChannelError>;

    /// Sends a task event to the producer over the data connection.
    fn send_task_event(
        &self,
        connection: &ConnectionId,
        partition_id: PartitionId,
        event: TaskEvent,
    ) -> Result<(), ChannelError>;
}

/// Gate-side hook that re-assigns exclusive buffer segments when a
/// remote channel replaces another channel at the same index.
pub trait CreditAssigner: Send + Sync {
    /// Whether the gate runs the credit-based flow control mode.
    fn is_credit_based(&self) -> bool;
    /// Hands `channel` its exclusive buffer segments.
    fn assign_exclusive_segments(&self, channel: &RemoteInputChannel);
}

/// An input channel fed by the network transport.
pub struct RemoteInputChannel {
    core: ChannelCore,
    connection_id: ConnectionId,
    connection_manager: Arc<dyn ConnectionManager>,
    received: Mutex<VecDeque<(Buffer, u32)>>,
    exclusive_segments: AtomicU32,
    requested: AtomicBool,
}

impl RemoteInputChannel {
    /// Creates a channel consuming `partition_id` from a remote
    /// producer.
    #[must_use]
    pub fn new(
        channel_index: u32,
        partition_id: PartitionId,
        connection_id: ConnectionId,
        connection_manager: Arc<dyn ConnectionManager>,
        backoff: ChannelBackoffConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ChannelCore::new(channel_index, partition_id, backoff),
            connection_id,
            connection_manager,
            received: Mutex::new(VecDeque::new()),
            exclusive_segments: AtomicU32::new(0),
            requested: AtomicBool::new(false),
        })
    }

    /// Registers the gate-side availability hook.
    pub fn set_availability_listener(&self, listener: Arc<dyn ChannelAvailabilityListener>) {
        *self.core.availability.lock() = Some(listener);
    }

    /// The producer's transport address.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Issues the remote subpartition request.
    pub fn request_subpartition(
        self: &Arc<Self>,
        subpartition_index: u32,
    ) -> Result<(), ChannelError> {
        if self.core.is_released() {
            return Err(self.core.released_error());
        }
        self.requested.store(true, Ordering::Release);
        debug!(
            channel = self.core.channel_index,
            partition = %self.core.partition_id,
            subpartition_index,
            address = %self.connection_id.address,
            "requesting remote subpartition"
        );
        self.connection_manager.request_subpartition(
            &self.connection_id,
            self.core.partition_id,
            subpartition_index,
            self,
        )
    }

    /// Transport callback: a buffer arrived for this channel.
    ///
    /// `sender_backlog` is the producer's queue depth behind it.
    pub fn on_buffer(&self, buffer: Buffer, sender_backlog: u32) {
        if self.core.is_released() {
            debug!(
                channel = self.core.channel_index,
                "buffer for released channel dropped"
            );
            buffer.recycle();
            return;
        }
        self.received.lock().push_back((buffer, sender_backlog));
        self.core.notify_non_empty();
    }

    /// Polls the next received buffer, applying replay deduplication.
    pub fn get_next_buffer(&self) -> Result<Option<BufferAndAvailability>, ChannelError> {
        self.core.check_error()?;
        if self.core.is_released() {
            return Ok(None);
        }
        assert!(
            self.requested.load(Ordering::Acquire),
            "queried for a buffer before requesting the subpartition"
        );

        loop {
            let (buffer, backlog, more) = {
                let mut received = self.received.lock();
                let Some((buffer, backlog)) = received.pop_front() else {
                    return Ok(None);
                };
                (buffer, backlog, !received.is_empty())
            };

            if self.core.consume_dedup() {
                debug!(
                    channel = self.core.channel_index,
                    "dropped replayed duplicate buffer"
                );
                buffer.recycle();
                continue;
            }

            self.core.record_delivered();
            return Ok(Some(BufferAndAvailability {
                buffer,
                more_available: more,
                buffers_in_backlog: backlog,
            }));
        }
    }

    /// Sends a task event to the producer over the data connection.
    pub fn send_task_event(&self, event: TaskEvent) -> Result<(), ChannelError> {
        self.core.check_error()?;
        self.connection_manager
            .send_task_event(&self.connection_id, self.core.partition_id, event)
    }

    /// Number of exclusive buffer segments assigned by the gate.
    #[must_use]
    pub fn exclusive_segments(&self) -> u32 {
        self.exclusive_segments.load(Ordering::Acquire)
    }

    /// Assigns exclusive buffer segments (credit-based gates only).
    pub fn assign_exclusive_segments(&self, count: u32) {
        self.exclusive_segments.store(count, Ordering::Release);
    }

    /// Whether [`release_all_resources`](Self::release_all_resources)
    /// ran.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.core.is_released()
    }

    /// Releases the channel and every queued buffer. Idempotent.
    pub fn release_all_resources(&self) {
        if self.core.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.received.lock().drain(..).collect();
        debug!(
            channel = self.core.channel_index,
            dropped = drained.len(),
            "released remote channel"
        );
        for (buffer, _) in drained {
            buffer.recycle();
        }
    }

    /// Replaces this channel with a remote one pointed at a new
    /// producer, releasing this one first.
    #[must_use]
    pub fn to_new_remote_input_channel(
        &self,
        new_partition_id: PartitionId,
        producer_address: ConnectionId,
        connection_manager: Arc<dyn ConnectionManager>,
        backoff: ChannelBackoffConfig,
        gate: Option<&dyn CreditAssigner>,
    ) -> Arc<RemoteInputChannel> {
        self.release_all_resources();
        let replacement = RemoteInputChannel::new(
            self.core.channel_index,
            new_partition_id,
            producer_address,
            connection_manager,
            backoff,
        );
        if let Some(gate) = gate {
            if gate.is_credit_based() {
                gate.assign_exclusive_segments(&replacement);
            }
        }
        replacement
    }

    /// Replaces this channel with a local one at the same index,
    /// releasing this one first.
    #[must_use]
    pub fn to_new_local_input_channel(
        &self,
        new_partition_id: PartitionId,
        partition_manager: Arc<ResultPartitionManager>,
        dispatcher: Arc<TaskEventDispatcher>,
        timer: Arc<TimerQueue>,
        backoff: ChannelBackoffConfig,
    ) -> Arc<LocalInputChannel> {
        self.release_all_resources();
        LocalInputChannel::new(
            self.core.channel_index,
            new_partition_id,
            partition_manager,
            dispatcher,
            timer,
            backoff,
        )
    }
}

impl_deduplicating_channel!(RemoteInputChannel);

impl std::fmt::Debug for RemoteInputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteInputChannel")
            .field("channel_index", &self.core.channel_index)
            .field("partition_id", &self.core.partition_id)
            .field("address", &self.connection_id.address)
            .field("released", &self.core.is_released())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::buffer::BufferConsumer;
    use crate::network::partition::ResultPartition;
    use bytes::Bytes;
    use std::time::Instant;

    fn partition_id(tag: u8) -> PartitionId {
        PartitionId::from_bytes([tag; 16])
    }

    struct Harness {
        manager: Arc<ResultPartitionManager>,
        dispatcher: Arc<TaskEventDispatcher>,
        timer: Arc<TimerQueue>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                manager: ResultPartitionManager::new(),
                dispatcher: TaskEventDispatcher::new(),
                timer: Arc::new(TimerQueue::new()),
            }
        }

        fn channel(&self, pid: PartitionId, backoff: ChannelBackoffConfig) -> Arc<LocalInputChannel> {
            LocalInputChannel::new(
                0,
                pid,
                Arc::clone(&self.manager),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.timer),
                backoff,
            )
        }
    }

    #[test]
    fn test_request_and_poll_local_subpartition() {
        let harness = Harness::new();
        let pid = partition_id(1);
        let partition = ResultPartition::new(pid, "map-0", 1, 0);
        harness.manager.register_partition(Arc::clone(&partition));
        partition
            .subpartition(0)
            .unwrap()
            .add(BufferConsumer::finished_data(b"payload"), false);

        let channel = harness.channel(pid, ChannelBackoffConfig::default());
        channel.request_subpartition(0).unwrap();

        let delivered = channel.get_next_buffer().unwrap().unwrap();
        assert_eq!(delivered.buffer.as_bytes().as_ref(), b"payload");
        assert_eq!(channel.take_number_buffers_removed(), 1);
        assert_eq!(channel.take_number_buffers_removed(), 0);
    }

    #[test]
    fn test_backoff_retries_then_surfaces_partition_not_found() {
        let harness = Harness::new();
        let pid = partition_id(2);
        let channel = harness.channel(
            pid,
            ChannelBackoffConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
        );

        // First request misses and schedules a retry at 10ms.
        channel.request_subpartition(0).unwrap();
        assert_eq!(harness.timer.len(), 1);

        let mut now = Instant::now();
        // The 10ms and 20ms retries miss and reschedule.
        for _ in 0..2 {
            now += Duration::from_millis(50);
            assert_eq!(harness.timer.run_due(now), 1);
            assert_eq!(harness.timer.len(), 1);
        }
        // The 40ms retry misses with the backoff exhausted: the error
        // surfaces and nothing is rescheduled.
        now += Duration::from_millis(50);
        assert_eq!(harness.timer.run_due(now), 1);
        assert!(harness.timer.is_empty());

        let err = channel.get_next_buffer().unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Partition(PartitionError::PartitionNotFound(_))
        ));
    }

    #[test]
    fn test_backoff_retry_succeeds_when_partition_appears() {
        let harness = Harness::new();
        let pid = partition_id(3);
        let channel = harness.channel(
            pid,
            ChannelBackoffConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
        );
        channel.request_subpartition(0).unwrap();

        // Partition registers before the retry fires.
        let partition = ResultPartition::new(pid, "map-0", 1, 0);
        harness.manager.register_partition(Arc::clone(&partition));
        partition
            .subpartition(0)
            .unwrap()
            .add(BufferConsumer::finished_data(b"late"), false);

        harness.timer.run_due(Instant::now() + Duration::from_secs(1));
        let delivered = channel.get_next_buffer().unwrap().unwrap();
        assert_eq!(delivered.buffer.as_bytes().as_ref(), b"late");
    }

    #[test]
    fn test_zero_initial_backoff_disables_retries() {
        let harness = Harness::new();
        let channel = harness.channel(
            partition_id(4),
            ChannelBackoffConfig {
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
        );
        let err = channel.request_subpartition(0).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Partition(PartitionError::PartitionNotFound(_))
        ));
    }

    #[test]
    fn test_deduplication_drops_prefix_and_delivers_suffix() {
        let harness = Harness::new();
        let pid = partition_id(5);
        let partition = ResultPartition::new(pid, "map-0", 1, 0);
        harness.manager.register_partition(Arc::clone(&partition));
        let sub = partition.subpartition(0).unwrap();
        for payload in [&b"b1"[..], b"b2", b"b3", b"b4"] {
            sub.add(BufferConsumer::finished_data(payload), false);
        }

        let channel = harness.channel(pid, ChannelBackoffConfig::default());
        channel.set_number_buffers_deduplicate(2);
        channel.set_deduplicating();
        channel.request_subpartition(0).unwrap();

        let first = channel.get_next_buffer().unwrap().unwrap();
        assert_eq!(first.buffer.as_bytes().as_ref(), b"b3");
        let second = channel.get_next_buffer().unwrap().unwrap();
        assert_eq!(second.buffer.as_bytes().as_ref(), b"b4");
        assert!(channel.get_next_buffer().unwrap().is_none());

        // Only delivered buffers count towards truncation.
        assert_eq!(channel.take_number_buffers_removed(), 2);
    }

    #[test]
    fn test_release_makes_polls_empty_and_is_idempotent() {
        let harness = Harness::new();
        let pid = partition_id(6);
        let partition = ResultPartition::new(pid, "map-0", 1, 0);
        harness.manager.register_partition(Arc::clone(&partition));

        let channel = harness.channel(pid, ChannelBackoffConfig::default());
        channel.request_subpartition(0).unwrap();
        channel.release_all_resources();
        channel.release_all_resources();

        assert!(channel.is_released());
        assert!(channel.get_next_buffer().unwrap().is_none());
        // Consumed-once semantics: releasing the channel released the
        // producer side too.
        assert!(partition.subpartition(0).unwrap().is_released());
    }

    #[test]
    fn test_release_cancels_pending_retrigger() {
        let harness = Harness::new();
        let channel = harness.channel(
            partition_id(7),
            ChannelBackoffConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
        );
        channel.request_subpartition(0).unwrap();
        assert_eq!(harness.timer.len(), 1);

        channel.release_all_resources();
        assert!(harness.timer.is_empty());
    }

    #[test]
    fn test_cancelled_when_subpartition_released_mid_read() {
        let harness = Harness::new();
        let pid = partition_id(8);
        let partition = ResultPartition::new(pid, "map-0", 1, 0);
        harness.manager.register_partition(Arc::clone(&partition));

        let channel = harness.channel(pid, ChannelBackoffConfig::default());
        channel.request_subpartition(0).unwrap();

        partition.subpartition(0).unwrap().release();
        let err = channel.get_next_buffer().unwrap_err();
        assert!(matches!(err, ChannelError::Cancelled { .. }));
    }

    #[test]
    fn test_poll_before_request_is_rejected() {
        let harness = Harness::new();
        let channel = harness.channel(partition_id(9), ChannelBackoffConfig::default());
        let err = channel.get_next_buffer().unwrap_err();
        assert!(matches!(err, ChannelError::NotRequested { .. }));
    }

    #[test]
    fn test_in_flight_log_request_allowed_before_view() {
        let harness = Harness::new();
        let channel = harness.channel(partition_id(10), ChannelBackoffConfig::default());
        let event = TaskEvent::InFlightLogRequest(crate::protocol::InFlightLogRequestEvent {
            partition_id: partition_id(10),
            subpartition_index: 0,
            num_buffers_removed: 0,
        });
        // Producer not registered: publish error, not an assertion.
        let err = channel.send_task_event(event).unwrap_err();
        assert!(matches!(err, ChannelError::EventPublish { .. }));
    }

    #[test]
    fn test_remote_channel_dedup_and_release() {
        struct NullConnections;
        impl ConnectionManager for NullConnections {
            fn request_subpartition(
                &self,
                _connection: &ConnectionId,
                _partition_id: PartitionId,
                _subpartition_index: u32,
                _channel: &Arc<RemoteInputChannel>,
            ) -> Result<(), ChannelError> {
                Ok(())
            }
            fn send_task_event(
                &self,
                _connection: &ConnectionId,
                _partition_id: PartitionId,
                _event: TaskEvent,
            ) -> Result<(), ChannelError> {
                Ok(())
            }
        }

        let channel = RemoteInputChannel::new(
            3,
            partition_id(11),
            ConnectionId {
                address: "producer-1:4242".into(),
                connection_index: 0,
            },
            Arc::new(NullConnections),
            ChannelBackoffConfig::default(),
        );
        channel.request_subpartition(0).unwrap();
        channel.set_number_buffers_deduplicate(1);
        channel.set_deduplicating();

        let replayed = Buffer::from_bytes(Bytes::from_static(b"dup"));
        let probe = replayed.clone();
        channel.on_buffer(replayed, 1);
        channel.on_buffer(Buffer::from_bytes(Bytes::from_static(b"fresh")), 0);

        let delivered = channel.get_next_buffer().unwrap().unwrap();
        assert_eq!(delivered.buffer.as_bytes().as_ref(), b"fresh");
        assert_eq!(probe.ref_count(), 1);

        let queued = Buffer::from_bytes(Bytes::from_static(b"queued"));
        let queued_probe = queued.clone();
        channel.on_buffer(queued, 0);
        channel.release_all_resources();
        assert_eq!(queued_probe.ref_count(), 1);
        assert!(channel.get_next_buffer().unwrap().is_none());
    }

    #[test]
    fn test_channel_mutation_to_remote_assigns_credit_segments() {
        struct NullConnections;
        impl ConnectionManager for NullConnections {
            fn request_subpartition(
                &self,
                _connection: &ConnectionId,
                _partition_id: PartitionId,
                _subpartition_index: u32,
                _channel: &Arc<RemoteInputChannel>,
            ) -> Result<(), ChannelError> {
                Ok(())
            }
            fn send_task_event(
                &self,
                _connection: &ConnectionId,
                _partition_id: PartitionId,
                _event: TaskEvent,
            ) -> Result<(), ChannelError> {
                Ok(())
            }
        }

        struct CreditGate;
        impl CreditAssigner for CreditGate {
            fn is_credit_based(&self) -> bool {
                true
            }
            fn assign_exclusive_segments(&self, channel: &RemoteInputChannel) {
                channel.assign_exclusive_segments(2);
            }
        }

        let harness = Harness::new();
        let old = harness.channel(partition_id(12), ChannelBackoffConfig::default());
        let replacement = old.to_new_remote_input_channel(
            partition_id(13),
            ConnectionId {
                address: "producer-2:4242".into(),
                connection_index: 1,
            },
            Arc::new(NullConnections),
            ChannelBackoffConfig::default(),
            Some(&CreditGate),
        );

        assert!(old.is_released());
        assert_eq!(replacement.channel_index(), 0);
        assert_eq!(replacement.partition_id(), partition_id(13));
        assert_eq!(replacement.exclusive_segments(), 2);
    }
}
