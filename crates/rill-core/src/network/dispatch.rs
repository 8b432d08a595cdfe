//! Task-event dispatch between colocated tasks.
//!
//! Recovery control events address a partition; the producer of that
//! partition registers itself here to receive them. `publish` returning
//! `false` means the producer is not (or no longer) registered — the
//! caller surfaces that as a publish error and the recovery manager
//! restarts its current state.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::causal::PartitionId;
use crate::protocol::TaskEvent;

/// Receiver of task events addressed to one produced partition.
pub trait TaskEventListener: Send + Sync {
    /// Called on the publisher's thread, in publish order.
    fn on_task_event(&self, event: TaskEvent);
}

/// Routes task events to the registered producer of a partition.
#[derive(Default)]
pub struct TaskEventDispatcher {
    listeners: RwLock<FxHashMap<PartitionId, Arc<dyn TaskEventListener>>>,
}

impl TaskEventDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the producer-side listener for `partition_id`,
    /// replacing any previous registration.
    pub fn register_partition(&self, partition_id: PartitionId, listener: Arc<dyn TaskEventListener>) {
        self.listeners.write().insert(partition_id, listener);
    }

    /// Removes the registration for `partition_id`.
    pub fn unregister_partition(&self, partition_id: PartitionId) {
        self.listeners.write().remove(&partition_id);
    }

    /// Delivers `event` to the producer of `partition_id`.
    ///
    /// Returns `false` if no producer is registered; the event is
    /// dropped.
    pub fn publish(&self, partition_id: PartitionId, event: TaskEvent) -> bool {
        let listener = self.listeners.read().get(&partition_id).cloned();
        match listener {
            Some(listener) => {
                listener.on_task_event(event);
                true
            }
            None => {
                debug!(partition = %partition_id, "task event dropped: producer not registered");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal::VertexId;
    use crate::protocol::DeterminantRequestEvent;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<u64>>,
    }

    impl TaskEventListener for Recorder {
        fn on_task_event(&self, event: TaskEvent) {
            if let TaskEvent::DeterminantRequest(request) = event {
                self.events.lock().push(request.upstream_correlation_id);
            }
        }
    }

    fn request(correlation: u64) -> TaskEvent {
        TaskEvent::DeterminantRequest(DeterminantRequestEvent {
            failed_vertex: VertexId(1),
            upstream_correlation_id: correlation,
        })
    }

    #[test]
    fn test_publish_reaches_registered_listener_in_order() {
        let dispatcher = TaskEventDispatcher::new();
        let partition = PartitionId::from_bytes([2u8; 16]);
        let recorder = Arc::new(Recorder::default());
        dispatcher.register_partition(partition, recorder.clone());

        assert!(dispatcher.publish(partition, request(1)));
        assert!(dispatcher.publish(partition, request(2)));
        assert_eq!(*recorder.events.lock(), vec![1, 2]);
    }

    #[test]
    fn test_publish_without_registration_fails() {
        let dispatcher = TaskEventDispatcher::new();
        assert!(!dispatcher.publish(PartitionId::from_bytes([3u8; 16]), request(1)));
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let dispatcher = TaskEventDispatcher::new();
        let partition = PartitionId::from_bytes([2u8; 16]);
        let recorder = Arc::new(Recorder::default());
        dispatcher.register_partition(partition, recorder.clone());
        dispatcher.unregister_partition(partition);

        assert!(!dispatcher.publish(partition, request(1)));
        assert!(recorder.events.lock().is_empty());
    }
}
