//! Determinant variants and their binary encoding.
//!
//! A determinant records one nondeterministic choice made by an operator
//! while processing records: the input channel it read from, a timer that
//! fired, a random draw, or an opaque operator-defined payload. Within an
//! epoch, determinants are appended in record-processing order and
//! replayed in exactly that order during recovery.
//!
//! ## Wire Format
//!
//! Each determinant is a tag byte followed by a big-endian payload:
//!
//! | Variant        | Tag  | Payload           |
//! |----------------|------|-------------------|
//! | `Order`        | 0x01 | `u8` channel      |
//! | `Timer`        | 0x02 | `u64` timer id    |
//! | `Rng`          | 0x03 | `u64` value       |
//! | `Serializable` | 0x04 | `u32` len + bytes |

use bytes::{Buf, BufMut, Bytes, BytesMut};

const TAG_ORDER: u8 = 0x01;
const TAG_TIMER: u8 = 0x02;
const TAG_RNG: u8 = 0x03;
const TAG_SERIALIZABLE: u8 = 0x04;

/// A recorded nondeterministic choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Determinant {
    /// The operator read its next record from this input channel.
    Order {
        /// Input channel index the record was taken from.
        channel: u8,
    },
    /// A registered timer fired.
    Timer {
        /// The timer registration that fired.
        timer_id: u64,
    },
    /// A random draw (or the seed that produced a deterministic stream).
    Rng {
        /// The drawn value or seed.
        value: u64,
    },
    /// An opaque operator-defined determinant.
    Serializable {
        /// Operator-serialized payload.
        payload: Bytes,
    },
}

impl Determinant {
    /// Encoded size in bytes, tag included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Order { .. } => 2,
            Self::Timer { .. } | Self::Rng { .. } => 9,
            Self::Serializable { payload } => 5 + payload.len(),
        }
    }
}

/// Errors surfaced while parsing a determinant frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeterminantError {
    /// The frame does not start with a known determinant tag.
    #[error("unknown determinant tag {0:#04x}")]
    UnknownTag(u8),

    /// The frame ended before the payload the tag promised.
    #[error("truncated determinant frame: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the current field still required.
        needed: usize,
        /// Bytes left in the frame.
        remaining: usize,
    },
}

/// Append-only binary writer for a determinant stream.
///
/// One encoder backs one epoch segment of a [`VertexCausalLog`]
/// (see [`super::log`]); determinants are appended in record-processing
/// order and the accumulated bytes are shipped wholesale in determinant
/// responses.
#[derive(Debug, Default)]
pub struct DeterminantEncoder {
    buf: BytesMut,
}

impl DeterminantEncoder {
    /// Creates an empty encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one determinant to the stream.
    pub fn append(&mut self, determinant: &Determinant) {
        match determinant {
            Determinant::Order { channel } => {
                self.buf.put_u8(TAG_ORDER);
                self.buf.put_u8(*channel);
            }
            Determinant::Timer { timer_id } => {
                self.buf.put_u8(TAG_TIMER);
                self.buf.put_u64(*timer_id);
            }
            Determinant::Rng { value } => {
                self.buf.put_u8(TAG_RNG);
                self.buf.put_u64(*value);
            }
            Determinant::Serializable { payload } => {
                self.buf.put_u8(TAG_SERIALIZABLE);
                self.buf.put_u32(u32::try_from(payload.len()).expect("determinant payload fits u32"));
                self.buf.put_slice(payload);
            }
        }
    }

    /// Number of encoded bytes accumulated so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// A cheap snapshot of the bytes accumulated so far.
    #[must_use]
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// Consumes the encoder, yielding the encoded stream.
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Forward-only parser over an encoded determinant stream.
///
/// Yields `Err` once on the first corrupt frame and nothing afterwards.
#[derive(Debug)]
pub struct DeterminantDecoder {
    buf: Bytes,
    poisoned: bool,
}

impl DeterminantDecoder {
    /// Creates a decoder over an encoded stream.
    #[must_use]
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            poisoned: false,
        }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn truncated(&mut self, needed: usize) -> DeterminantError {
        self.poisoned = true;
        DeterminantError::Truncated {
            needed,
            remaining: self.buf.remaining(),
        }
    }
}

impl Iterator for DeterminantDecoder {
    type Item = Result<Determinant, DeterminantError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || !self.buf.has_remaining() {
            return None;
        }
        let tag = self.buf.get_u8();
        let item = match tag {
            TAG_ORDER => {
                if self.buf.remaining() < 1 {
                    return Some(Err(self.truncated(1)));
                }
                Ok(Determinant::Order {
                    channel: self.buf.get_u8(),
                })
            }
            TAG_TIMER => {
                if self.buf.remaining() < 8 {
                    return Some(Err(self.truncated(8)));
                }
                Ok(Determinant::Timer {
                    timer_id: self.buf.get_u64(),
                })
            }
            TAG_RNG => {
                if self.buf.remaining() < 8 {
                    return Some(Err(self.truncated(8)));
                }
                Ok(Determinant::Rng {
                    value: self.buf.get_u64(),
                })
            }
            TAG_SERIALIZABLE => {
                if self.buf.remaining() < 4 {
                    return Some(Err(self.truncated(4)));
                }
                let len = self.buf.get_u32() as usize;
                if self.buf.remaining() < len {
                    return Some(Err(self.truncated(len)));
                }
                Ok(Determinant::Serializable {
                    payload: self.buf.copy_to_bytes(len),
                })
            }
            other => {
                self.poisoned = true;
                Err(DeterminantError::UnknownTag(other))
            }
        };
        Some(item)
    }
}
