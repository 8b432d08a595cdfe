//! # rill-core
//!
//! Causal recovery core of the rill stream-processing task runtime.
//!
//! Rill executes a directed graph of stateful operator tasks connected
//! by pipelined, back-pressured channels. When a task fails, its
//! downstream peers must keep seeing an output stream indistinguishable
//! from the pre-failure one — even though re-execution alone cannot
//! reproduce the failed task's nondeterministic choices. This crate
//! provides that guarantee:
//!
//! - [`causal`] logs nondeterminism determinants per epoch and segments
//!   execution with the [`EpochTracker`](causal::EpochTracker)
//! - [`network`] keeps a bounded in-flight log of output buffers pending
//!   downstream acknowledgement and deduplicates replayed buffers on
//!   the consumer side
//! - [`recovery`] orchestrates the restore → determinant-fetch →
//!   log-replay → running state machine
//! - [`protocol`] carries the determinant and in-flight log request
//!   traffic between peers
//! - [`time`] schedules channel request retriggers on a per-task timer
//!   queue
//!
//! ## Scope
//!
//! Task scheduling, checkpoint coordination RPC, record serialization,
//! network transport, and state backends are external collaborators,
//! consumed through the traits each module defines
//! (`ResultPartitionManager` registry surface, `TaskEventDispatcher`,
//! `ConnectionManager`, `DeterminantReplayer`). The in-flight log is
//! in-memory only; nothing in this crate persists to disk.

pub mod causal;
pub mod network;
pub mod protocol;
pub mod recovery;
pub mod time;

pub use causal::{
    CausalLogId, CausalLogManager, Determinant, EpochId, EpochTracker, JobVertexId, PartitionId,
    VertexId,
};
pub use network::{
    Buffer, BufferAndBacklog, BufferConsumer, InFlightLog, LocalInputChannel,
    PipelinedSubpartition, RemoteInputChannel, ResultPartition, ResultPartitionManager,
};
pub use protocol::{
    DeterminantRequestEvent, DeterminantResponseEvent, InFlightLogRequestEvent, ProtocolError,
    TaskEvent,
};
pub use recovery::{RecoveryManager, RecoveryManagerContext, RecoveryPhase};
pub use time::TimerQueue;
