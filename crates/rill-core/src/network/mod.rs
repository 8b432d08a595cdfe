//! # Network Module
//!
//! The pipelined, back-pressured data plane between operator tasks.
//!
//! ## Module Overview
//!
//! - [`buffer`]: refcounted buffers and the builder/consumer split
//! - [`inflight`]: per-subpartition in-flight logging of dispatched
//!   buffers
//! - [`subpartition`]: the producer-side output queue state machine
//! - [`partition`]: result partitions, the partition registry, and the
//!   subpartition arena
//! - [`channel`]: consumer-side local/remote input channels with replay
//!   deduplication
//! - [`dispatch`]: task-event routing between colocated tasks

pub mod buffer;
pub mod channel;
pub mod dispatch;
pub mod inflight;
pub mod partition;
pub mod subpartition;

pub use buffer::{Buffer, BufferAndBacklog, BufferBuilder, BufferConsumer, BufferKind};
pub use channel::{
    BufferAndAvailability, ChannelAvailabilityListener, ChannelBackoffConfig, ChannelError,
    ConnectionId, ConnectionManager, CreditAssigner, DeduplicatingChannel, LocalInputChannel,
    RemoteInputChannel,
};
pub use dispatch::{TaskEventDispatcher, TaskEventListener};
pub use inflight::{InFlightIterator, InFlightLog};
pub use partition::{PartitionError, ResultPartition, ResultPartitionManager, SubpartitionTable};
pub use subpartition::{
    BufferAvailabilityListener, FailConsumerPropagator, PipelinedSubpartition,
    SubpartitionRecoveryListener, SubpartitionView,
};
