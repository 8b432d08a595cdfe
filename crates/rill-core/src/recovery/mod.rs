//! # Recovery Module
//!
//! The per-task finite state machine that orchestrates causal recovery:
//! restore → determinant fetch → deterministic replay → running.
//!
//! ## Phases
//!
//! 1. [`Standby`](RecoveryPhase::Standby): nothing to do yet. A cleanly
//!    deployed task starts directly in `Running` instead.
//! 2. [`WaitingConnections`](RecoveryPhase::WaitingConnections): wait
//!    until every input and output channel of the restarted task is
//!    re-established.
//! 3. [`WaitingDeterminants`](RecoveryPhase::WaitingDeterminants):
//!    broadcast a [`DeterminantRequestEvent`] upstream and merge the
//!    responses (the longest log per stream wins).
//! 4. [`ReplayingDeterminants`](RecoveryPhase::ReplayingDeterminants):
//!    feed the merged determinants to the operator and count produced
//!    records until the armed target is reached.
//! 5. [`Running`](RecoveryPhase::Running): answer in-flight log requests
//!    immediately; flush the ones stored while recovering.
//!
//! Events may arrive from the task thread and from network I/O callback
//! threads; every entry point is serialized by the manager's own mutex,
//! and all cross-component calls (replay, dedup arming, request-replay)
//! are issued after that mutex is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::causal::epoch::{EpochTracker, RecordCountTargetListener};
use crate::causal::{CausalLogId, EpochId, PartitionId, VertexId};
use crate::network::buffer::Buffer;
use crate::network::channel::DeduplicatingChannel;
use crate::network::dispatch::{TaskEventDispatcher, TaskEventListener};
use crate::network::partition::SubpartitionTable;
use crate::network::subpartition::{PipelinedSubpartition, SubpartitionRecoveryListener};
use crate::protocol::{
    DeterminantRequestEvent, DeterminantResponseEvent, InFlightLogRequestEvent, TaskEvent,
};

/// Operator-side hook that re-executes the merged determinant streams.
pub trait DeterminantReplayer: Send + Sync {
    /// Feeds the determinants into the operator (input selector, timers,
    /// RNG seeds) for deterministic re-execution. Returns the number of
    /// records the replay will produce before reaching the pre-failure
    /// frontier — the record-count target armed on the epoch tracker.
    fn replay(&self, determinants: &BTreeMap<CausalLogId, Buffer>) -> u32;
}

/// Gate-side hook that resets a channel's record deserializer when the
/// channel is rebuilt mid-stream.
pub trait ChannelResetHook: Send + Sync {
    /// Drops any partially deserialized record state of `channel_index`.
    fn reset_channel_deserializer(&self, channel_index: u32);
}

/// Externally observable FSM phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Created for a restarted task; waiting for the recovery kick-off.
    Standby,
    /// Waiting for all sibling channels to be reachable again.
    WaitingConnections,
    /// Waiting for determinant responses from upstream peers.
    WaitingDeterminants,
    /// Replaying determinants into the operator.
    ReplayingDeterminants,
    /// Normal operation.
    Running,
}

enum State {
    Standby,
    WaitingConnections {
        pending_input_channels: usize,
        pending_output_channels: usize,
    },
    WaitingDeterminants {
        outstanding_responses: usize,
        collector: Option<DeterminantResponseEvent>,
    },
    ReplayingDeterminants,
    Running,
}

impl State {
    fn phase(&self) -> RecoveryPhase {
        match self {
            Self::Standby => RecoveryPhase::Standby,
            Self::WaitingConnections { .. } => RecoveryPhase::WaitingConnections,
            Self::WaitingDeterminants { .. } => RecoveryPhase::WaitingDeterminants,
            Self::ReplayingDeterminants => RecoveryPhase::ReplayingDeterminants,
            Self::Running => RecoveryPhase::Running,
        }
    }
}

/// Collaborators and identity of the owning task.
pub struct RecoveryManagerContext {
    /// Compact id of the owning task vertex.
    pub task_vertex_id: VertexId,
    /// Arena of the task's produced subpartitions.
    pub subpartition_table: Arc<SubpartitionTable>,
    /// Dispatcher used to broadcast determinant requests upstream.
    pub dispatcher: Arc<TaskEventDispatcher>,
    /// The task's epoch tracker; its mutex doubles as the checkpoint
    /// lock.
    pub epoch_tracker: Arc<Mutex<EpochTracker>>,
    /// Partitions produced by the upstream peers of this task.
    pub upstream_partitions: Vec<PartitionId>,
    /// Input channels that must reconnect before determinants are
    /// fetched.
    pub expected_input_channels: usize,
    /// Output channels (read views) that must re-attach before
    /// determinants are fetched.
    pub expected_output_channels: usize,
    /// Operator-side determinant replay hook.
    pub replayer: Arc<dyn DeterminantReplayer>,
    /// Optional deserializer reset hook for rebuilt channels.
    pub channel_reset: Option<Arc<dyn ChannelResetHook>>,
}

struct Inner {
    state: State,
    incomplete_state_restorations: FxHashSet<EpochId>,
    unanswered_in_flight_log_requests: FxHashMap<(PartitionId, u32), InFlightLogRequestEvent>,
    next_correlation_id: u64,
    current_correlation_id: u64,
}

/// Per-task recovery orchestrator.
pub struct RecoveryManager {
    context: RecoveryManagerContext,
    inner: Mutex<Inner>,
}

impl RecoveryManager {
    /// Creates a manager for a cleanly deployed task, starting in
    /// `Running`.
    #[must_use]
    pub fn running(context: RecoveryManagerContext) -> Arc<Self> {
        Self::with_state(context, State::Running)
    }

    /// Creates a manager for a restarted task, starting in `Standby`.
    #[must_use]
    pub fn standby(context: RecoveryManagerContext) -> Arc<Self> {
        Self::with_state(context, State::Standby)
    }

    fn with_state(context: RecoveryManagerContext, state: State) -> Arc<Self> {
        Arc::new(Self {
            context,
            inner: Mutex::new(Inner {
                state,
                incomplete_state_restorations: FxHashSet::default(),
                unanswered_in_flight_log_requests: FxHashMap::default(),
                next_correlation_id: 1,
                current_correlation_id: 0,
            }),
        })
    }

    /// Current FSM phase.
    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        self.inner.lock().state.phase()
    }

    /// Whether the task has not yet returned to normal operation.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        let inner = self.inner.lock();
        !matches!(inner.state, State::Running) || !inner.incomplete_state_restorations.is_empty()
    }

    /// Kicks off recovery once every sibling peer is reachable.
    pub fn notify_start_recovery(&self) {
        let advance = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, State::WaitingConnections { .. }) {
                warn!(vertex = %self.context.task_vertex_id, "recovery already starting");
                return;
            }
            info!(vertex = %self.context.task_vertex_id, "starting recovery");
            inner.state = State::WaitingConnections {
                pending_input_channels: self.context.expected_input_channels,
                pending_output_channels: self.context.expected_output_channels,
            };
            self.connections_complete(&inner)
        };
        if advance {
            self.begin_waiting_determinants();
        }
    }

    /// An input channel of the recovering task was (re)created.
    ///
    /// The dedup count is recorded and armed on the channel in every
    /// state; outside `Running` this must not drop the task into a
    /// normal run.
    pub fn notify_new_input_channel(
        &self,
        channel: &Arc<dyn DeduplicatingChannel>,
        consumed_subpartition_index: u32,
        num_buffers_deduplicate: u32,
    ) {
        info!(
            vertex = %self.context.task_vertex_id,
            channel = channel.channel_index(),
            consumed_subpartition_index,
            num_buffers_deduplicate,
            "new input channel; will deduplicate the first replayed buffers"
        );
        channel.set_number_buffers_deduplicate(num_buffers_deduplicate);
        channel.set_deduplicating();

        let (advance, reset_deserializer) = {
            let mut inner = self.inner.lock();
            match &mut inner.state {
                State::WaitingConnections {
                    pending_input_channels,
                    ..
                } => {
                    *pending_input_channels = pending_input_channels.saturating_sub(1);
                    (self.connections_complete(&inner), false)
                }
                State::Running => (false, true),
                other => {
                    debug!(
                        vertex = %self.context.task_vertex_id,
                        phase = ?other.phase(),
                        "input channel recorded while recovering"
                    );
                    (false, false)
                }
            }
        };

        if reset_deserializer {
            if let Some(reset) = &self.context.channel_reset {
                reset.reset_channel_deserializer(channel.channel_index());
            }
        }
        if advance {
            self.begin_waiting_determinants();
        }
    }

    /// A peer answered a determinant request.
    pub fn notify_determinant_response(&self, response: DeterminantResponseEvent) {
        let finished = {
            let mut inner = self.inner.lock();
            let current = inner.current_correlation_id;
            match &mut inner.state {
                State::WaitingDeterminants {
                    outstanding_responses,
                    collector,
                } => {
                    if response.correlation_id != current {
                        warn!(
                            vertex = %self.context.task_vertex_id,
                            got = response.correlation_id,
                            expected = current,
                            "stale determinant response dropped"
                        );
                        None
                    } else {
                        collector
                            .as_mut()
                            .expect("collector present while waiting")
                            .merge(response);
                        *outstanding_responses -= 1;
                        if *outstanding_responses == 0 {
                            let merged = collector.take();
                            inner.state = State::ReplayingDeterminants;
                            merged
                        } else {
                            None
                        }
                    }
                }
                other => {
                    warn!(
                        vertex = %self.context.task_vertex_id,
                        phase = ?other.phase(),
                        "unexpected determinant response dropped"
                    );
                    None
                }
            }
        };

        if let Some(merged) = finished {
            self.replay_determinants(&merged);
        }
    }

    /// A downstream peer asked for an in-flight log replay.
    pub fn notify_in_flight_log_request(&self, event: InFlightLogRequestEvent) {
        let subpartition = {
            let mut inner = self.inner.lock();
            let key = (event.partition_id, event.subpartition_index);
            if matches!(inner.state, State::Running) {
                match self
                    .context
                    .subpartition_table
                    .get(event.partition_id, event.subpartition_index)
                {
                    Some(subpartition) if subpartition.is_recovering_in_flight_state() => {
                        // Still rebuilding: answer once the rebuild ends.
                        debug!(
                            vertex = %self.context.task_vertex_id,
                            partition = %event.partition_id,
                            index = event.subpartition_index,
                            "in-flight log request stored: subpartition still recovering"
                        );
                        inner.unanswered_in_flight_log_requests.insert(key, event);
                        None
                    }
                    Some(subpartition) => {
                        info!(
                            vertex = %self.context.task_vertex_id,
                            partition = %event.partition_id,
                            index = event.subpartition_index,
                            "received in-flight log request"
                        );
                        Some(subpartition)
                    }
                    None => {
                        warn!(
                            vertex = %self.context.task_vertex_id,
                            partition = %event.partition_id,
                            index = event.subpartition_index,
                            "in-flight log request for unknown subpartition dropped"
                        );
                        None
                    }
                }
            } else {
                // Recovery must finish before answering; flushed on the
                // transition into `Running`.
                info!(
                    vertex = %self.context.task_vertex_id,
                    partition = %event.partition_id,
                    index = event.subpartition_index,
                    "in-flight log request stored until recovery completes"
                );
                inner.unanswered_in_flight_log_requests.insert(key, event);
                None
            }
        };

        if let Some(subpartition) = subpartition {
            Self::answer_in_flight_log_request(&subpartition, &event);
        }
    }

    /// State restoration of `checkpoint_id` started.
    pub fn notify_state_restoration_start(&self, checkpoint_id: EpochId) {
        info!(
            vertex = %self.context.task_vertex_id,
            checkpoint_id,
            "started restoring state"
        );
        self.inner
            .lock()
            .incomplete_state_restorations
            .insert(checkpoint_id);
    }

    /// State restoration of `checkpoint_id` finished.
    pub fn notify_state_restoration_complete(&self, checkpoint_id: EpochId) {
        info!(
            vertex = %self.context.task_vertex_id,
            checkpoint_id,
            "completed restoring state"
        );
        self.inner
            .lock()
            .incomplete_state_restorations
            .remove(&checkpoint_id);
    }

    // ------------------------------------------------------------------
    // Internal transitions
    // ------------------------------------------------------------------

    /// Whether both channel counters of `WaitingConnections` hit zero.
    fn connections_complete(&self, inner: &Inner) -> bool {
        if let State::WaitingConnections {
            pending_input_channels,
            pending_output_channels,
        } = inner.state
        {
            pending_input_channels == 0 && pending_output_channels == 0
        } else {
            false
        }
    }

    /// Enters `WaitingDeterminants` and broadcasts the request upstream.
    fn begin_waiting_determinants(&self) {
        let correlation_id = {
            let mut inner = self.inner.lock();
            let correlation_id = inner.next_correlation_id;
            inner.next_correlation_id += 1;
            inner.current_correlation_id = correlation_id;
            // With no upstream peers a single synthetic not-found
            // response resolves the wait.
            inner.state = State::WaitingDeterminants {
                outstanding_responses: self.context.upstream_partitions.len().max(1),
                collector: Some(DeterminantResponseEvent::not_found(
                    self.context.task_vertex_id,
                    correlation_id,
                )),
            };
            correlation_id
        };
        info!(
            vertex = %self.context.task_vertex_id,
            correlation_id,
            peers = self.context.upstream_partitions.len(),
            "all channels ready; requesting determinants upstream"
        );

        if self.context.upstream_partitions.is_empty() {
            self.notify_determinant_response(DeterminantResponseEvent::not_found(
                self.context.task_vertex_id,
                correlation_id,
            ));
            return;
        }

        // Failed publishes are folded in as synthetic not-found
        // responses so the collector bookkeeping stays in one place.
        let mut missing = 0usize;
        for partition_id in &self.context.upstream_partitions {
            let request = TaskEvent::DeterminantRequest(DeterminantRequestEvent {
                failed_vertex: self.context.task_vertex_id,
                upstream_correlation_id: correlation_id,
            });
            if !self.context.dispatcher.publish(*partition_id, request) {
                warn!(
                    vertex = %self.context.task_vertex_id,
                    partition = %partition_id,
                    "determinant request could not be published"
                );
                missing += 1;
            }
        }
        for _ in 0..missing {
            self.notify_determinant_response(DeterminantResponseEvent::not_found(
                self.context.task_vertex_id,
                correlation_id,
            ));
        }
    }

    /// Feeds the merged determinants to the operator and arms the
    /// record-count target that ends the replay.
    fn replay_determinants(&self, merged: &DeterminantResponseEvent) {
        info!(
            vertex = %self.context.task_vertex_id,
            found = merged.found,
            streams = merged.determinants.len(),
            "replaying determinants"
        );
        let target = self.context.replayer.replay(&merged.determinants);
        // Arms the target under the checkpoint lock; a zero target fires
        // back into `on_record_count_target_reached` immediately.
        self.context
            .epoch_tracker
            .lock()
            .set_record_count_target(target);
    }

    /// Answers one stored or live request: bound the log truncation by
    /// the consumer's delivered count, then replay.
    fn answer_in_flight_log_request(
        subpartition: &Arc<PipelinedSubpartition>,
        event: &InFlightLogRequestEvent,
    ) {
        if event.num_buffers_removed > 0 {
            subpartition
                .notify_downstream_checkpoint_complete(event.num_buffers_removed as usize);
        }
        subpartition.request_replay();
    }

    /// Flushes requests stored while recovering. Subpartitions still
    /// rebuilding their own in-flight state keep their request stored.
    fn flush_unanswered_requests(&self, inner: &mut Inner) -> Vec<(Arc<PipelinedSubpartition>, InFlightLogRequestEvent)> {
        let stored: Vec<_> = inner
            .unanswered_in_flight_log_requests
            .drain()
            .map(|(_, event)| event)
            .collect();
        let mut answerable = Vec::new();
        for event in stored {
            let key = (event.partition_id, event.subpartition_index);
            match self
                .context
                .subpartition_table
                .get(event.partition_id, event.subpartition_index)
            {
                Some(subpartition) if subpartition.is_recovering_in_flight_state() => {
                    inner.unanswered_in_flight_log_requests.insert(key, event);
                }
                Some(subpartition) => answerable.push((subpartition, event)),
                None => warn!(
                    partition = %event.partition_id,
                    index = event.subpartition_index,
                    "stored in-flight log request for unknown subpartition dropped"
                ),
            }
        }
        answerable
    }
}

impl RecordCountTargetListener for RecoveryManager {
    fn on_record_count_target_reached(&self, target: u32) {
        let answerable = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, State::ReplayingDeterminants) {
                debug!(
                    vertex = %self.context.task_vertex_id,
                    target,
                    phase = ?inner.state.phase(),
                    "record count target outside determinant replay ignored"
                );
                return;
            }
            info!(
                vertex = %self.context.task_vertex_id,
                target,
                "determinant replay reached its target; recovery complete"
            );
            inner.state = State::Running;
            self.flush_unanswered_requests(&mut inner)
        };
        for (subpartition, event) in answerable {
            Self::answer_in_flight_log_request(&subpartition, &event);
        }
    }
}

impl SubpartitionRecoveryListener for RecoveryManager {
    fn is_recovering(&self) -> bool {
        RecoveryManager::is_recovering(self)
    }

    fn notify_new_output_channel(&self, partition_id: PartitionId, subpartition_index: u32) {
        let advance = {
            let mut inner = self.inner.lock();
            match &mut inner.state {
                State::WaitingConnections {
                    pending_output_channels,
                    ..
                } => {
                    info!(
                        vertex = %self.context.task_vertex_id,
                        partition = %partition_id,
                        index = subpartition_index,
                        "output channel re-attached"
                    );
                    *pending_output_channels = pending_output_channels.saturating_sub(1);
                    self.connections_complete(&inner)
                }
                other => {
                    debug!(
                        vertex = %self.context.task_vertex_id,
                        phase = ?other.phase(),
                        "unexpected new output channel"
                    );
                    false
                }
            }
        };
        if advance {
            self.begin_waiting_determinants();
        }
    }

    fn notify_subpartition_in_flight_state_recovered(
        &self,
        partition_id: PartitionId,
        subpartition_index: u32,
    ) {
        let answerable = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, State::Running) {
                return;
            }
            inner
                .unanswered_in_flight_log_requests
                .remove(&(partition_id, subpartition_index))
                .and_then(|event| {
                    self.context
                        .subpartition_table
                        .get(partition_id, subpartition_index)
                        .map(|subpartition| (subpartition, event))
                })
        };
        if let Some((subpartition, event)) = answerable {
            Self::answer_in_flight_log_request(&subpartition, &event);
        }
    }
}

impl TaskEventListener for RecoveryManager {
    fn on_task_event(&self, event: TaskEvent) {
        match event {
            TaskEvent::InFlightLogRequest(request) => self.notify_in_flight_log_request(request),
            TaskEvent::DeterminantResponse(_) | TaskEvent::DeterminantRequest(_) => {
                debug!(
                    vertex = %self.context.task_vertex_id,
                    "determinant traffic is routed explicitly, not through the dispatcher listener"
                );
            }
        }
    }
}
