//! Result partitions and the partition registry.
//!
//! A [`ResultPartition`] groups the pipelined subpartitions one task
//! produces. The [`ResultPartitionManager`] is the process-local
//! registry consumers go through to open read views, and the
//! [`SubpartitionTable`] is the arena the recovery manager indexes by
//! `(partition, subpartition)` instead of owning handles.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::causal::epoch::{CheckpointListener, EpochStartListener};
use crate::causal::{EpochId, PartitionId};

use super::subpartition::{
    BufferAvailabilityListener, FailConsumerPropagator, PipelinedSubpartition, SubpartitionView,
};

/// Errors surfaced by the partition registry and read-view lifecycle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PartitionError {
    /// The requested partition is not (or no longer) registered here.
    /// Transient during deployment: consumers retry with backoff.
    #[error("partition {0} not found")]
    PartitionNotFound(PartitionId),

    /// The partition exists but has no subpartition at this index.
    #[error("partition {partition_id} has no subpartition {index}")]
    UnknownSubpartition {
        /// The partition that was found.
        partition_id: PartitionId,
        /// The out-of-range subpartition index.
        index: u32,
    },

    /// The subpartition was already released.
    #[error("subpartition {index} of partition {partition_id} already released")]
    SubpartitionReleased {
        /// The partition the subpartition belongs to.
        partition_id: PartitionId,
        /// The released subpartition's index.
        index: u32,
    },
}

/// The produced side of one task: a set of pipelined subpartitions.
pub struct ResultPartition {
    partition_id: PartitionId,
    owning_task: String,
    subpartitions: Vec<Arc<PipelinedSubpartition>>,
    propagator: RwLock<Weak<dyn FailConsumerPropagator>>,
}

impl ResultPartition {
    /// Creates a partition with `num_subpartitions` pipelined
    /// subpartitions, each wired back to this partition for
    /// fail-consumer propagation.
    #[must_use]
    pub fn new(
        partition_id: PartitionId,
        owning_task: impl Into<String>,
        num_subpartitions: u32,
        initial_epoch: EpochId,
    ) -> Arc<Self> {
        let partition = Arc::new(Self {
            partition_id,
            owning_task: owning_task.into(),
            subpartitions: (0..num_subpartitions)
                .map(|index| PipelinedSubpartition::new(index, partition_id, initial_epoch))
                .collect(),
            propagator: RwLock::new(Weak::<NeverPropagate>::new()),
        });
        let weak: Weak<dyn FailConsumerPropagator> =
            Arc::downgrade(&partition) as Weak<dyn FailConsumerPropagator>;
        for subpartition in &partition.subpartitions {
            subpartition.set_parent(weak.clone());
        }
        partition
    }

    /// The partition's id.
    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Name of the task producing this partition.
    #[must_use]
    pub fn owning_task(&self) -> &str {
        &self.owning_task
    }

    /// Number of subpartitions.
    #[must_use]
    pub fn num_subpartitions(&self) -> u32 {
        u32::try_from(self.subpartitions.len()).expect("subpartition count fits u32")
    }

    /// The subpartition at `index`, if in range.
    #[must_use]
    pub fn subpartition(&self, index: u32) -> Option<&Arc<PipelinedSubpartition>> {
        self.subpartitions.get(index as usize)
    }

    /// All subpartitions, by index.
    #[must_use]
    pub fn subpartitions(&self) -> &[Arc<PipelinedSubpartition>] {
        &self.subpartitions
    }

    /// Wires the cluster-side hook that carries fail-consumer signals to
    /// the peers upstream of a failed consumer.
    pub fn set_fail_consumer_propagator(&self, propagator: Weak<dyn FailConsumerPropagator>) {
        *self.propagator.write() = propagator;
    }

    /// Finishes every subpartition.
    pub fn finish(&self) {
        for subpartition in &self.subpartitions {
            subpartition.finish();
        }
    }

    /// Releases every subpartition. Idempotent.
    pub fn release(&self) {
        debug!(partition = %self.partition_id, task = %self.owning_task, "releasing partition");
        for subpartition in &self.subpartitions {
            subpartition.release();
        }
    }
}

impl FailConsumerPropagator for ResultPartition {
    fn propagate_fail_consumer(&self, subpartition_index: u32, reason: &str) {
        debug!(
            partition = %self.partition_id,
            index = subpartition_index,
            reason,
            "propagating fail consumer signal"
        );
        if let Some(propagator) = self.propagator.read().upgrade() {
            propagator.propagate_fail_consumer(subpartition_index, reason);
        }
    }
}

impl EpochStartListener for ResultPartition {
    fn on_epoch_start(&self, epoch: EpochId) {
        for subpartition in &self.subpartitions {
            subpartition.on_epoch_start(epoch);
        }
    }
}

impl CheckpointListener for ResultPartition {
    fn on_checkpoint_complete(&self, checkpoint_id: EpochId) {
        for subpartition in &self.subpartitions {
            subpartition.on_checkpoint_complete(checkpoint_id);
        }
    }
}

struct NeverPropagate;
impl FailConsumerPropagator for NeverPropagate {
    fn propagate_fail_consumer(&self, _subpartition_index: u32, _reason: &str) {}
}

/// Process-local registry of produced partitions.
#[derive(Default)]
pub struct ResultPartitionManager {
    partitions: RwLock<FxHashMap<PartitionId, Arc<ResultPartition>>>,
}

impl ResultPartitionManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a produced partition for consumption.
    pub fn register_partition(&self, partition: Arc<ResultPartition>) {
        let previous = self
            .partitions
            .write()
            .insert(partition.partition_id(), partition);
        if let Some(previous) = previous {
            warn!(partition = %previous.partition_id(), "re-registered partition replaces a live one");
        }
    }

    /// Looks up a registered partition.
    #[must_use]
    pub fn get_partition(&self, partition_id: PartitionId) -> Option<Arc<ResultPartition>> {
        self.partitions.read().get(&partition_id).cloned()
    }

    /// Unregisters and releases a partition. No-op if unknown.
    pub fn release_partition(&self, partition_id: PartitionId) {
        if let Some(partition) = self.partitions.write().remove(&partition_id) {
            partition.release();
        }
    }

    /// Opens a read view on `(partition_id, subpartition_index)`,
    /// registering `listener` for availability callbacks.
    pub fn create_subpartition_view(
        &self,
        partition_id: PartitionId,
        subpartition_index: u32,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Result<SubpartitionView, PartitionError> {
        let partition = self
            .get_partition(partition_id)
            .ok_or(PartitionError::PartitionNotFound(partition_id))?;
        let subpartition =
            partition
                .subpartition(subpartition_index)
                .ok_or(PartitionError::UnknownSubpartition {
                    partition_id,
                    index: subpartition_index,
                })?;
        subpartition.create_read_view(listener)
    }
}

/// Arena of subpartitions indexed by `(partition, subpartition)`.
///
/// The recovery manager routes in-flight log requests through this table
/// instead of owning subpartition handles, which keeps the
/// manager/subpartition reference graph acyclic.
#[derive(Default)]
pub struct SubpartitionTable {
    inner: RwLock<FxHashMap<(PartitionId, u32), Arc<PipelinedSubpartition>>>,
}

impl SubpartitionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Indexes every subpartition of `partition`.
    pub fn register_partition(&self, partition: &ResultPartition) {
        let mut inner = self.inner.write();
        for subpartition in partition.subpartitions() {
            inner.insert(
                (partition.partition_id(), subpartition.index()),
                Arc::clone(subpartition),
            );
        }
    }

    /// Looks up one subpartition.
    #[must_use]
    pub fn get(
        &self,
        partition_id: PartitionId,
        subpartition_index: u32,
    ) -> Option<Arc<PipelinedSubpartition>> {
        self.inner
            .read()
            .get(&(partition_id, subpartition_index))
            .cloned()
    }

    /// Number of indexed subpartitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::buffer::BufferConsumer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct NoopListener;
    impl BufferAvailabilityListener for NoopListener {
        fn notify_data_available(&self) {}
    }

    fn partition_id(tag: u8) -> PartitionId {
        PartitionId::from_bytes([tag; 16])
    }

    #[test]
    fn test_create_subpartition_view_unknown_partition() {
        let manager = ResultPartitionManager::new();
        let err = manager
            .create_subpartition_view(partition_id(1), 0, Arc::new(NoopListener))
            .unwrap_err();
        assert!(matches!(err, PartitionError::PartitionNotFound(_)));
    }

    #[test]
    fn test_create_subpartition_view_unknown_index() {
        let manager = ResultPartitionManager::new();
        let partition = ResultPartition::new(partition_id(1), "map-0", 2, 0);
        manager.register_partition(partition);

        let err = manager
            .create_subpartition_view(partition_id(1), 9, Arc::new(NoopListener))
            .unwrap_err();
        assert!(matches!(
            err,
            PartitionError::UnknownSubpartition { index: 9, .. }
        ));
    }

    #[test]
    fn test_create_view_and_poll_through_registry() {
        let manager = ResultPartitionManager::new();
        let partition = ResultPartition::new(partition_id(1), "map-0", 1, 0);
        manager.register_partition(Arc::clone(&partition));

        partition
            .subpartition(0)
            .unwrap()
            .add(BufferConsumer::finished_data(b"payload"), false);

        let view = manager
            .create_subpartition_view(partition_id(1), 0, Arc::new(NoopListener))
            .unwrap();
        let polled = view.get_next_buffer().unwrap();
        assert_eq!(polled.buffer.as_bytes().as_ref(), b"payload");
    }

    #[test]
    fn test_view_on_released_subpartition_rejected() {
        let manager = ResultPartitionManager::new();
        let partition = ResultPartition::new(partition_id(1), "map-0", 1, 0);
        manager.register_partition(Arc::clone(&partition));
        partition.release();

        let err = manager
            .create_subpartition_view(partition_id(1), 0, Arc::new(NoopListener))
            .unwrap_err();
        assert!(matches!(err, PartitionError::SubpartitionReleased { .. }));
    }

    #[test]
    fn test_release_partition_is_idempotent() {
        let manager = ResultPartitionManager::new();
        let partition = ResultPartition::new(partition_id(1), "map-0", 2, 0);
        manager.register_partition(Arc::clone(&partition));

        manager.release_partition(partition_id(1));
        assert!(partition.subpartition(0).unwrap().is_released());
        // Second release of an unregistered partition is a no-op.
        manager.release_partition(partition_id(1));
    }

    #[test]
    fn test_fail_consumer_signal_reaches_propagator() {
        struct CountingPropagator {
            calls: AtomicUsize,
        }
        impl FailConsumerPropagator for CountingPropagator {
            fn propagate_fail_consumer(&self, subpartition_index: u32, _reason: &str) {
                assert_eq!(subpartition_index, 1);
                self.calls.fetch_add(1, Ordering::Relaxed);
            }
        }

        let partition = ResultPartition::new(partition_id(1), "map-0", 2, 0);
        let propagator = Arc::new(CountingPropagator {
            calls: AtomicUsize::new(0),
        });
        let weak: Weak<dyn FailConsumerPropagator> =
            Arc::downgrade(&propagator) as Weak<dyn FailConsumerPropagator>;
        partition.set_fail_consumer_propagator(weak);

        partition
            .subpartition(1)
            .unwrap()
            .send_fail_consumer_trigger("downstream gone");
        assert_eq!(propagator.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subpartition_table_lookup() {
        let table = SubpartitionTable::new();
        let partition = ResultPartition::new(partition_id(3), "sink-0", 2, 0);
        table.register_partition(&partition);

        assert_eq!(table.len(), 2);
        let found = table.get(partition_id(3), 1).unwrap();
        assert_eq!(found.index(), 1);
        assert!(table.get(partition_id(3), 7).is_none());
    }

    #[test]
    fn test_epoch_and_checkpoint_fanout() {
        let partition = ResultPartition::new(partition_id(4), "map-0", 1, 0);
        let sub = partition.subpartition(0).unwrap();

        partition.on_epoch_start(1);
        sub.add(BufferConsumer::finished_data(b"x"), false);
        sub.poll_buffer().unwrap();
        assert_eq!(sub.in_flight_log_size(), 1);

        partition.on_checkpoint_complete(1);
        assert_eq!(sub.in_flight_log_size(), 0);
    }
}
