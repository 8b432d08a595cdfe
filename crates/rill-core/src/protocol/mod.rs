//! Task-event wire protocol for the recovery plane.
//!
//! Recovery control traffic rides the same transport as data buffers, in
//! FIFO order relative to them: determinant requests broadcast upstream
//! by a recovering task, determinant responses carrying causal log
//! deltas back, and in-flight log requests asking a producer to replay.
//!
//! All multi-byte integers are big-endian. Each event is a tag byte
//! followed by its body:
//!
//! | Event                 | Tag  |
//! |-----------------------|------|
//! | `DeterminantRequest`  | 0x01 |
//! | `DeterminantResponse` | 0x02 |
//! | `InFlightLogRequest`  | 0x03 |

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::causal::{CausalLogId, DeterminantError, PartitionId, VertexId};
use crate::network::buffer::Buffer;

const TAG_DETERMINANT_REQUEST: u8 = 0x01;
const TAG_DETERMINANT_RESPONSE: u8 = 0x02;
const TAG_IN_FLIGHT_LOG_REQUEST: u8 = 0x03;

/// Errors surfaced while encoding or decoding protocol frames.
///
/// All of these are fatal to the recovery attempt in progress.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame ended before a promised field.
    #[error("truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the current field still required.
        needed: usize,
        /// Bytes left in the frame.
        remaining: usize,
    },

    /// The envelope does not start with a known event tag.
    #[error("unknown task event tag {0:#04x}")]
    UnknownEventTag(u8),

    /// A response carries more determinant deltas than the `u8` counter
    /// can express.
    #[error("determinant delta count {0} exceeds protocol limit of 255")]
    OversizedDeltaCount(usize),

    /// A delta payload declared a negative length.
    #[error("negative determinant payload length {0}")]
    NegativePayloadLength(i32),

    /// A delta payload is too large for its `i32` length prefix.
    #[error("determinant delta payload of {0} bytes exceeds the i32 length prefix")]
    OversizedDeltaPayload(usize),

    /// A determinant frame inside a delta was corrupt.
    #[error(transparent)]
    Determinant(#[from] DeterminantError),
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Broadcast upstream by a recovering task to collect the failed
/// vertex's determinants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeterminantRequestEvent {
    /// The vertex whose determinants are requested.
    pub failed_vertex: VertexId,
    /// Correlates the fan-out of this request with its responses.
    pub upstream_correlation_id: u64,
}

impl DeterminantRequestEvent {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.failed_vertex.0);
        buf.put_u64(self.upstream_correlation_id);
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure(buf, 10)?;
        Ok(Self {
            failed_vertex: VertexId(buf.get_u16()),
            upstream_correlation_id: buf.get_u64(),
        })
    }
}

/// A peer's (possibly partial) answer to a determinant request.
///
/// Responses from multiple peers are merged: each peer observed some
/// prefix of the failed vertex's determinant stream, so for any
/// [`CausalLogId`] present on both sides the longer delta wins and the
/// shorter one is released.
#[derive(Debug)]
pub struct DeterminantResponseEvent {
    /// Whether any responding peer knew the failed vertex.
    pub found: bool,
    /// The vertex the determinants belong to.
    pub vertex_id: VertexId,
    /// Echo of the request's correlation id.
    pub correlation_id: u64,
    /// Determinant deltas keyed by stream, deterministically ordered.
    pub determinants: BTreeMap<CausalLogId, Buffer>,
}

impl DeterminantResponseEvent {
    /// A not-found response for `vertex_id`.
    #[must_use]
    pub fn not_found(vertex_id: VertexId, correlation_id: u64) -> Self {
        Self {
            found: false,
            vertex_id,
            correlation_id,
            determinants: BTreeMap::new(),
        }
    }

    /// An affirmative response with no deltas yet attached.
    #[must_use]
    pub fn found(vertex_id: VertexId, correlation_id: u64) -> Self {
        Self {
            found: true,
            vertex_id,
            correlation_id,
            determinants: BTreeMap::new(),
        }
    }

    /// Folds `other` into this response.
    ///
    /// Not-found merges to not-found only when both sides are. For a
    /// stream present on both sides, the delta with more readable bytes
    /// is kept and the other released; this relies on one peer's log
    /// being a prefix of the other's.
    pub fn merge(&mut self, other: DeterminantResponseEvent) {
        if !self.found && !other.found {
            return;
        }
        self.found = true;

        for (id, incoming) in other.determinants {
            let keep_existing = self
                .determinants
                .get(&id)
                .is_some_and(|existing| existing.readable_bytes() > incoming.readable_bytes());
            if keep_existing {
                incoming.recycle();
            } else if let Some(shorter) = self.determinants.insert(id, incoming) {
                shorter.recycle();
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(u8::from(self.found));
        buf.put_u16(self.vertex_id.0);
        buf.put_i64(self.correlation_id as i64);
        let num_deltas = self.determinants.len();
        let counter =
            u8::try_from(num_deltas).map_err(|_| ProtocolError::OversizedDeltaCount(num_deltas))?;
        buf.put_u8(counter);
        for (id, delta) in &self.determinants {
            id.encode(buf);
            let len = i32::try_from(delta.readable_bytes())
                .map_err(|_| ProtocolError::OversizedDeltaPayload(delta.readable_bytes()))?;
            buf.put_i32(len);
            buf.put_slice(delta.as_bytes());
        }
        Ok(())
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure(buf, 12)?;
        let found = buf.get_u8() != 0;
        let vertex_id = VertexId(buf.get_u16());
        #[allow(clippy::cast_sign_loss)]
        let correlation_id = buf.get_i64() as u64;
        let num_deltas = buf.get_u8();

        let mut determinants = BTreeMap::new();
        for _ in 0..num_deltas {
            let id = CausalLogId::decode(buf).ok_or(ProtocolError::Truncated {
                needed: CausalLogId::WIRE_LEN,
                remaining: buf.remaining(),
            })?;
            ensure(buf, 4)?;
            let declared = buf.get_i32();
            if declared < 0 {
                return Err(ProtocolError::NegativePayloadLength(declared));
            }
            #[allow(clippy::cast_sign_loss)]
            let len = declared as usize;
            ensure(buf, len)?;
            determinants.insert(id, Buffer::from_bytes(buf.copy_to_bytes(len)));
        }

        Ok(Self {
            found,
            vertex_id,
            correlation_id,
            determinants,
        })
    }
}

/// Asks a producer to replay its in-flight log for one subpartition.
///
/// `num_buffers_removed` is the consumer's delivered-buffer counter
/// since the last acknowledgement; the producer uses it to bound a
/// truncation of the prefix the consumer has definitely processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightLogRequestEvent {
    /// The partition whose subpartition should replay.
    pub partition_id: PartitionId,
    /// Subpartition index within the partition.
    pub subpartition_index: u32,
    /// Buffers the consumer delivered before failing over.
    pub num_buffers_removed: u32,
}

impl InFlightLogRequestEvent {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.partition_id.as_bytes());
        buf.put_u32(self.subpartition_index);
        buf.put_u32(self.num_buffers_removed);
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure(buf, 24)?;
        let mut partition = [0u8; 16];
        buf.copy_to_slice(&mut partition);
        Ok(Self {
            partition_id: PartitionId::from_bytes(partition),
            subpartition_index: buf.get_u32(),
            num_buffers_removed: buf.get_u32(),
        })
    }
}

/// The task-event envelope carried in-band with data buffers.
#[derive(Debug)]
pub enum TaskEvent {
    /// See [`DeterminantRequestEvent`].
    DeterminantRequest(DeterminantRequestEvent),
    /// See [`DeterminantResponseEvent`].
    DeterminantResponse(DeterminantResponseEvent),
    /// See [`InFlightLogRequestEvent`].
    InFlightLogRequest(InFlightLogRequestEvent),
}

impl TaskEvent {
    /// Serializes the envelope: tag byte plus big-endian body.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Self::DeterminantRequest(event) => {
                buf.put_u8(TAG_DETERMINANT_REQUEST);
                event.encode_body(&mut buf);
            }
            Self::DeterminantResponse(event) => {
                buf.put_u8(TAG_DETERMINANT_RESPONSE);
                event.encode_body(&mut buf)?;
            }
            Self::InFlightLogRequest(event) => {
                buf.put_u8(TAG_IN_FLIGHT_LOG_REQUEST);
                event.encode_body(&mut buf);
            }
        }
        Ok(buf.freeze())
    }

    /// Deserializes one envelope from `buf`.
    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure(buf, 1)?;
        match buf.get_u8() {
            TAG_DETERMINANT_REQUEST => Ok(Self::DeterminantRequest(
                DeterminantRequestEvent::decode_body(buf)?,
            )),
            TAG_DETERMINANT_RESPONSE => Ok(Self::DeterminantResponse(
                DeterminantResponseEvent::decode_body(buf)?,
            )),
            TAG_IN_FLIGHT_LOG_REQUEST => Ok(Self::InFlightLogRequest(
                InFlightLogRequestEvent::decode_body(buf)?,
            )),
            other => Err(ProtocolError::UnknownEventTag(other)),
        }
    }
}
