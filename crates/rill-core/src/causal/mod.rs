//! # Causal Logging Module
//!
//! Determinant logging for deterministic replay after task failure.
//!
//! A stateful operator task makes nondeterministic choices while it runs:
//! which input channel to read next, when a timer fires, what a random
//! draw produced. Re-executing the task after a failure cannot reproduce
//! those choices, so the runtime records each one as a [`Determinant`]
//! in a per-vertex, per-channel causal log. During recovery the merged
//! determinant stream is replayed into the operator, which then produces
//! an output stream indistinguishable from the pre-failure one.
//!
//! ## Module Overview
//!
//! - [`determinant`]: determinant variants and their binary encoding
//! - [`log`]: append-only, epoch-indexed determinant logs
//! - [`epoch`]: the [`EpochTracker`](epoch::EpochTracker) that segments
//!   execution into checkpoint-bounded epochs

pub mod determinant;
pub mod epoch;
pub mod log;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use determinant::{Determinant, DeterminantDecoder, DeterminantEncoder, DeterminantError};
pub use epoch::{CheckpointListener, EpochStartListener, EpochTracker, RecordCountTargetListener};
pub use log::{CausalLogManager, VertexCausalLog};

/// Identifier of an epoch. Equal to the checkpoint ID that opened it.
pub type EpochId = u64;

/// Compact identifier of a task vertex instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VertexId(pub u16);

impl std::fmt::Display for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// 16-byte identifier of a job graph vertex (the logical operator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobVertexId(Uuid);

impl JobVertexId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an identifier from its raw 16-byte form.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The raw 16-byte form.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for JobVertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// 16-byte identifier of a result partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(Uuid);

impl PartitionId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an identifier from its raw 16-byte form.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The raw 16-byte form.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of one determinant stream: a single channel of a single
/// subtask of a job vertex, scoped to the partition it flows through.
///
/// Totally ordered by field order, so determinant maps keyed by this
/// type iterate (and serialize) deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CausalLogId {
    /// The logical operator the determinants belong to.
    pub job_vertex_id: JobVertexId,
    /// Parallel subtask index within the vertex.
    pub subtask_index: u16,
    /// Channel index within the subtask.
    pub channel_index: u8,
    /// The partition the determinant stream is scoped to.
    pub partition_id: PartitionId,
}

impl CausalLogId {
    /// Fixed wire width: 16 + 2 + 1 + 16 bytes, big-endian integers.
    pub const WIRE_LEN: usize = 35;

    /// Appends the fixed-width wire form to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.job_vertex_id.as_bytes());
        buf.put_u16(self.subtask_index);
        buf.put_u8(self.channel_index);
        buf.put_slice(self.partition_id.as_bytes());
    }

    /// Reads the fixed-width wire form from `buf`.
    ///
    /// Returns `None` if fewer than [`Self::WIRE_LEN`] bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::WIRE_LEN {
            return None;
        }
        let mut vertex = [0u8; 16];
        buf.copy_to_slice(&mut vertex);
        let subtask_index = buf.get_u16();
        let channel_index = buf.get_u8();
        let mut partition = [0u8; 16];
        buf.copy_to_slice(&mut partition);
        Some(Self {
            job_vertex_id: JobVertexId::from_bytes(vertex),
            subtask_index,
            channel_index,
            partition_id: PartitionId::from_bytes(partition),
        })
    }
}

impl std::fmt::Display for CausalLogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}.{}@{}",
            self.job_vertex_id, self.subtask_index, self.channel_index, self.partition_id
        )
    }
}
