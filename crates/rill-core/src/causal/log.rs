//! Append-only, epoch-indexed determinant logs.
//!
//! A [`VertexCausalLog`] holds the determinant stream of one
//! [`CausalLogId`]: an ordered sequence of `(epoch, bytes)` segments.
//! Segments are append-only; a segment becomes eligible for truncation
//! once the checkpoint that covers its epoch is acknowledged.
//!
//! The [`CausalLogManager`] owns all logs of a task, routes appends by
//! log id, answers determinant requests for a failed vertex, and plugs
//! into the [`EpochTracker`](super::epoch::EpochTracker) as both an
//! epoch-start and a checkpoint-complete subscriber.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::network::buffer::Buffer;
use crate::protocol::{DeterminantRequestEvent, DeterminantResponseEvent};

use super::determinant::{Determinant, DeterminantEncoder};
use super::epoch::{CheckpointListener, EpochStartListener};
use super::{CausalLogId, EpochId, VertexId};

struct EpochSegment {
    epoch: EpochId,
    encoder: DeterminantEncoder,
}

/// The determinant stream of a single causal log id.
pub struct VertexCausalLog {
    causal_log_id: CausalLogId,
    segments: VecDeque<EpochSegment>,
}

impl VertexCausalLog {
    /// Creates an empty log positioned at `initial_epoch`.
    #[must_use]
    pub fn new(causal_log_id: CausalLogId, initial_epoch: EpochId) -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(EpochSegment {
            epoch: initial_epoch,
            encoder: DeterminantEncoder::new(),
        });
        Self {
            causal_log_id,
            segments,
        }
    }

    /// The id this log records determinants for.
    #[must_use]
    pub fn causal_log_id(&self) -> &CausalLogId {
        &self.causal_log_id
    }

    /// Appends a determinant to the current epoch segment.
    pub fn append(&mut self, determinant: &Determinant) {
        self.segments
            .back_mut()
            .expect("a causal log always has a current segment")
            .encoder
            .append(determinant);
    }

    /// Closes the current segment and opens one for `epoch`.
    ///
    /// An empty current segment is re-tagged instead of leaving a
    /// zero-length segment behind.
    pub fn start_new_epoch(&mut self, epoch: EpochId) {
        let current = self
            .segments
            .back_mut()
            .expect("a causal log always has a current segment");
        if current.encoder.is_empty() {
            current.epoch = epoch;
            return;
        }
        self.segments.push_back(EpochSegment {
            epoch,
            encoder: DeterminantEncoder::new(),
        });
    }

    /// Drops all segments of epochs `<= checkpoint_id`.
    ///
    /// If that removes every segment, a fresh one is opened at the
    /// youngest truncated epoch so appends keep a destination.
    pub fn truncate(&mut self, checkpoint_id: EpochId) {
        let mut last_dropped = None;
        while let Some(front) = self.segments.front() {
            if front.epoch > checkpoint_id {
                break;
            }
            last_dropped = Some(front.epoch);
            self.segments.pop_front();
        }
        if self.segments.is_empty() {
            self.segments.push_back(EpochSegment {
                epoch: last_dropped.unwrap_or(checkpoint_id),
                encoder: DeterminantEncoder::new(),
            });
        }
    }

    /// Total encoded bytes currently retained.
    #[must_use]
    pub fn retained_len(&self) -> usize {
        self.segments.iter().map(|s| s.encoder.len()).sum()
    }

    /// Concatenation of all retained segments, oldest epoch first.
    #[must_use]
    pub fn retained_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.retained_len());
        for segment in &self.segments {
            out.extend_from_slice(&segment.encoder.snapshot());
        }
        out.freeze()
    }

    /// Number of retained epoch segments (empty current included).
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

struct ManagerInner {
    logs: FxHashMap<CausalLogId, VertexCausalLog>,
    vertex_index: FxHashMap<VertexId, Vec<CausalLogId>>,
    current_epoch: EpochId,
}

/// All causal logs held by one task, keyed by [`CausalLogId`] and
/// indexed by the vertex they record determinants for.
pub struct CausalLogManager {
    inner: Mutex<ManagerInner>,
}

impl CausalLogManager {
    /// Creates an empty manager positioned at epoch 0.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ManagerInner {
                logs: FxHashMap::default(),
                vertex_index: FxHashMap::default(),
                current_epoch: 0,
            }),
        })
    }

    /// Registers a determinant stream for `vertex`. Idempotent.
    pub fn register_log(&self, vertex: VertexId, causal_log_id: CausalLogId) {
        let mut inner = self.inner.lock();
        let epoch = inner.current_epoch;
        inner
            .logs
            .entry(causal_log_id)
            .or_insert_with(|| VertexCausalLog::new(causal_log_id, epoch));
        let ids = inner.vertex_index.entry(vertex).or_default();
        if !ids.contains(&causal_log_id) {
            ids.push(causal_log_id);
        }
    }

    /// Appends a determinant to the stream of `causal_log_id`.
    ///
    /// Appending to an unregistered stream warns and is dropped.
    pub fn append(&self, causal_log_id: &CausalLogId, determinant: &Determinant) {
        let mut inner = self.inner.lock();
        match inner.logs.get_mut(causal_log_id) {
            Some(log) => log.append(determinant),
            None => warn!(%causal_log_id, "append to unregistered causal log dropped"),
        }
    }

    /// Total retained bytes of one stream, if registered.
    #[must_use]
    pub fn retained_len(&self, causal_log_id: &CausalLogId) -> Option<usize> {
        self.inner.lock().logs.get(causal_log_id).map(VertexCausalLog::retained_len)
    }

    /// Builds the response to a determinant request: every retained
    /// stream recorded for the failed vertex, or a not-found response if
    /// the vertex is unknown here.
    #[must_use]
    pub fn respond_to(&self, request: &DeterminantRequestEvent) -> DeterminantResponseEvent {
        let inner = self.inner.lock();
        let Some(ids) = inner.vertex_index.get(&request.failed_vertex) else {
            debug!(vertex = %request.failed_vertex, "no determinants recorded for failed vertex");
            return DeterminantResponseEvent::not_found(
                request.failed_vertex,
                request.upstream_correlation_id,
            );
        };

        let mut response = DeterminantResponseEvent::found(
            request.failed_vertex,
            request.upstream_correlation_id,
        );
        for id in ids {
            if let Some(log) = inner.logs.get(id) {
                response
                    .determinants
                    .insert(*id, Buffer::from_bytes(log.retained_bytes()));
            }
        }
        response
    }
}

impl EpochStartListener for CausalLogManager {
    fn on_epoch_start(&self, epoch: EpochId) {
        let mut inner = self.inner.lock();
        inner.current_epoch = epoch;
        for log in inner.logs.values_mut() {
            log.start_new_epoch(epoch);
        }
    }
}

impl CheckpointListener for CausalLogManager {
    fn on_checkpoint_complete(&self, checkpoint_id: EpochId) {
        let mut inner = self.inner.lock();
        for log in inner.logs.values_mut() {
            log.truncate(checkpoint_id);
        }
    }
}
