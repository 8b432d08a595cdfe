//! Refcounted network buffers and the builder/consumer split.
//!
//! A [`Buffer`] is a refcounted view of an immutable memory segment.
//! Cloning retains a share; dropping (or [`Buffer::recycle`]) releases
//! it. Exactly one owner is responsible for releasing each share:
//! handing a buffer to the in-flight log transfers one share, replay
//! iterators hold their own.
//!
//! Writers produce data through a [`BufferBuilder`], while the paired
//! [`BufferConsumer`] is queued in a subpartition and snapshots the
//! bytes appended since its previous [`build`](BufferConsumer::build).

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

/// Payload classification of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// User records.
    Data,
    /// A control event (barrier, end-of-partition, ...).
    Event,
}

struct BufferShared {
    data: Bytes,
    kind: BufferKind,
}

/// A refcounted memory segment flowing through subpartitions and
/// channels.
#[derive(Clone)]
pub struct Buffer {
    shared: Arc<BufferShared>,
}

impl Buffer {
    /// Wraps `data` as a payload buffer.
    #[must_use]
    pub fn from_bytes(data: Bytes) -> Self {
        Self::with_kind(data, BufferKind::Data)
    }

    /// Wraps `data` as a control-event buffer.
    #[must_use]
    pub fn event(data: Bytes) -> Self {
        Self::with_kind(data, BufferKind::Event)
    }

    fn with_kind(data: Bytes, kind: BufferKind) -> Self {
        Self {
            shared: Arc::new(BufferShared { data, kind }),
        }
    }

    /// Bytes readable from this buffer.
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.shared.data.len()
    }

    /// Whether this buffer carries user records (as opposed to an event).
    #[must_use]
    pub fn is_buffer(&self) -> bool {
        self.shared.kind == BufferKind::Data
    }

    /// Whether this buffer carries a control event.
    #[must_use]
    pub fn is_event(&self) -> bool {
        self.shared.kind == BufferKind::Event
    }

    /// The payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.shared.data
    }

    /// Number of live shares of the underlying segment.
    ///
    /// Observable so tests can assert a segment was released exactly
    /// once.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Releases this share of the segment.
    ///
    /// Equivalent to dropping, spelled out at the call sites where
    /// ownership of a dispatched buffer ends.
    pub fn recycle(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("kind", &self.shared.kind)
            .field("readable_bytes", &self.readable_bytes())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

struct ConsumerInner {
    pending: BytesMut,
    finished: bool,
    closed: bool,
}

struct ConsumerShared {
    inner: Mutex<ConsumerInner>,
    kind: BufferKind,
}

/// Writer half of a buffer under construction.
pub struct BufferBuilder {
    shared: Arc<ConsumerShared>,
}

impl BufferBuilder {
    /// Appends bytes to the buffer. Ignored once the paired consumer
    /// was closed.
    pub fn append(&self, bytes: &[u8]) {
        let mut inner = self.shared.inner.lock();
        assert!(!inner.finished, "append to a finished buffer builder");
        if inner.closed {
            return;
        }
        inner.pending.extend_from_slice(bytes);
    }

    /// Marks the buffer complete. The paired consumer becomes finished
    /// once the remaining bytes are built.
    pub fn finish(self) {
        self.shared.inner.lock().finished = true;
    }
}

/// Reader half queued in a subpartition.
///
/// At most one unfinished consumer may sit in a subpartition queue, and
/// it must be at the tail.
pub struct BufferConsumer {
    shared: Arc<ConsumerShared>,
}

impl BufferConsumer {
    /// Creates a builder/consumer pair for a payload buffer.
    #[must_use]
    pub fn data_pair() -> (BufferBuilder, BufferConsumer) {
        Self::pair(BufferKind::Data)
    }

    /// Creates a builder/consumer pair for an event buffer.
    #[must_use]
    pub fn event_pair() -> (BufferBuilder, BufferConsumer) {
        Self::pair(BufferKind::Event)
    }

    fn pair(kind: BufferKind) -> (BufferBuilder, BufferConsumer) {
        let shared = Arc::new(ConsumerShared {
            inner: Mutex::new(ConsumerInner {
                pending: BytesMut::new(),
                finished: false,
                closed: false,
            }),
            kind,
        });
        (
            BufferBuilder {
                shared: Arc::clone(&shared),
            },
            BufferConsumer { shared },
        )
    }

    /// A consumer whose full payload is already written and finished.
    #[must_use]
    pub fn finished_data(data: &[u8]) -> Self {
        Self::finished(data, BufferKind::Data)
    }

    /// A finished control-event consumer.
    #[must_use]
    pub fn finished_event(data: &[u8]) -> Self {
        Self::finished(data, BufferKind::Event)
    }

    fn finished(data: &[u8], kind: BufferKind) -> Self {
        let (builder, consumer) = Self::pair(kind);
        builder.append(data);
        builder.finish();
        consumer
    }

    /// Snapshots the bytes appended since the previous build into a
    /// fresh [`Buffer`]. The snapshot may be empty.
    #[must_use]
    pub fn build(&self) -> Buffer {
        let mut inner = self.shared.inner.lock();
        let chunk = inner.pending.split().freeze();
        Buffer::with_kind(chunk, self.shared.kind)
    }

    /// Whether the writer finished (or the consumer was closed); all
    /// remaining bytes have been surfaced by the latest build.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.finished || inner.closed
    }

    /// Whether this consumer produces payload buffers.
    #[must_use]
    pub fn is_buffer(&self) -> bool {
        self.shared.kind == BufferKind::Data
    }

    /// Bytes written but not yet built.
    #[must_use]
    pub fn unread_bytes(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Discards pending bytes and detaches from the writer.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock();
        inner.closed = true;
        inner.pending.clear();
    }
}

impl std::fmt::Debug for BufferConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferConsumer")
            .field("kind", &self.shared.kind)
            .field("finished", &self.is_finished())
            .field("unread_bytes", &self.unread_bytes())
            .finish()
    }
}

/// A dispatched buffer with queue telemetry for the consumer side.
#[derive(Debug)]
pub struct BufferAndBacklog {
    /// The dispatched buffer.
    pub buffer: Buffer,
    /// Whether another poll would yield a buffer right away.
    pub more_available: bool,
    /// Buffers queued past the currently read head.
    pub buffers_in_backlog: u32,
    /// Whether the next dispatch would be a control event.
    pub next_is_event: bool,
}
