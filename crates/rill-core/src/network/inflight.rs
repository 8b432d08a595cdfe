//! Per-subpartition in-flight logging of dispatched buffers.
//!
//! Every buffer a subpartition dispatches downstream is also appended to
//! its [`InFlightLog`], scoped to the epoch it was dispatched in. The
//! log retains a share of each buffer until the downstream peer has
//! acknowledged consumption, so a failed consumer can be brought back by
//! replaying exactly the retained sequence.
//!
//! ## Truncation
//!
//! Two complementary paths shrink the log:
//!
//! - [`notify_downstream_checkpoint_complete`](InFlightLog::notify_downstream_checkpoint_complete)
//!   releases a counted prefix of the oldest unacknowledged epoch, driven
//!   by the consumer's delivered-buffer counter.
//! - [`truncate_epochs_through`](InFlightLog::truncate_epochs_through)
//!   drops whole epochs once the checkpoint covering them completes.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::causal::EpochId;

use super::buffer::Buffer;

struct LoggedBuffer {
    buffer: Buffer,
    is_last_of_consumer: bool,
}

struct EpochSlice {
    epoch: EpochId,
    buffers: VecDeque<LoggedBuffer>,
}

/// Ordered, epoch-scoped log of the buffers a subpartition dispatched.
pub struct InFlightLog {
    epochs: VecDeque<EpochSlice>,
    current_epoch: EpochId,
    closed: bool,
}

impl InFlightLog {
    /// Creates an empty log positioned at `initial_epoch`.
    #[must_use]
    pub fn new(initial_epoch: EpochId) -> Self {
        Self {
            epochs: VecDeque::new(),
            current_epoch: initial_epoch,
            closed: false,
        }
    }

    /// Appends a dispatched buffer to the current epoch, retaining a
    /// share until acknowledgement. `is_last_of_consumer` records whether
    /// this buffer completed its producing consumer.
    ///
    /// Appending to a closed log warns and drops the share.
    pub fn log(&mut self, buffer: Buffer, is_last_of_consumer: bool) {
        if self.closed {
            warn!("append to a closed in-flight log dropped");
            return;
        }
        let current_epoch = self.current_epoch;
        if self.epochs.back().is_none_or(|s| s.epoch != current_epoch) {
            self.epochs.push_back(EpochSlice {
                epoch: current_epoch,
                buffers: VecDeque::new(),
            });
        }
        self.epochs
            .back_mut()
            .expect("slice for the current epoch was just ensured")
            .buffers
            .push_back(LoggedBuffer {
                buffer,
                is_last_of_consumer,
            });
    }

    /// Scopes subsequent appends to `epoch`.
    pub fn start_new_epoch(&mut self, epoch: EpochId) {
        self.current_epoch = epoch;
    }

    /// The epoch subsequent appends are scoped to.
    #[must_use]
    pub fn current_epoch(&self) -> EpochId {
        self.current_epoch
    }

    /// Releases the first `n_buffers` of the oldest unacknowledged
    /// epoch, bounded by that epoch's tail. An emptied epoch advances
    /// the acknowledgement watermark.
    pub fn notify_downstream_checkpoint_complete(&mut self, n_buffers: usize) {
        let Some(oldest) = self.epochs.front_mut() else {
            debug!(n_buffers, "downstream checkpoint complete on empty in-flight log");
            return;
        };
        let released = n_buffers.min(oldest.buffers.len());
        for _ in 0..released {
            // Exactly one release per logged share.
            let logged = oldest.buffers.pop_front().expect("length checked above");
            logged.buffer.recycle();
        }
        debug!(
            epoch = oldest.epoch,
            released,
            requested = n_buffers,
            "released acknowledged in-flight prefix"
        );
        if oldest.buffers.is_empty() {
            self.epochs.pop_front();
        }
    }

    /// Drops every epoch `<= checkpoint_id` wholesale. Authorized by the
    /// completion of that checkpoint.
    pub fn truncate_epochs_through(&mut self, checkpoint_id: EpochId) {
        while let Some(front) = self.epochs.front() {
            if front.epoch > checkpoint_id {
                break;
            }
            let slice = self.epochs.pop_front().expect("front checked above");
            debug!(epoch = slice.epoch, buffers = slice.buffers.len(), "truncated in-flight epoch");
        }
    }

    /// A finite, forward-only cursor over everything retained at call
    /// time, oldest epoch first. Returns `None` if nothing is retained.
    ///
    /// The cursor holds its own shares and never observes buffers
    /// appended after its creation.
    #[must_use]
    pub fn in_flight_iterator(&self) -> Option<InFlightIterator> {
        let buffers: VecDeque<Buffer> = self
            .epochs
            .iter()
            .flat_map(|slice| slice.buffers.iter().map(|b| b.buffer.clone()))
            .collect();
        if buffers.is_empty() {
            None
        } else {
            Some(InFlightIterator {
                buffers,
                closed: false,
            })
        }
    }

    /// Number of buffers currently retained across all epochs.
    #[must_use]
    pub fn retained_buffers(&self) -> usize {
        self.epochs.iter().map(|s| s.buffers.len()).sum()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Whether the buffer at `index` (log order) completed its consumer.
    #[must_use]
    pub fn is_last_of_consumer(&self, index: usize) -> Option<bool> {
        self.epochs
            .iter()
            .flat_map(|s| s.buffers.iter())
            .nth(index)
            .map(|b| b.is_last_of_consumer)
    }

    /// Releases every retained share and refuses further appends.
    pub fn close(&mut self) {
        self.closed = true;
        self.epochs.clear();
    }

    /// Whether the log was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Finite, forward-only, non-restartable replay cursor.
pub struct InFlightIterator {
    buffers: VecDeque<Buffer>,
    closed: bool,
}

impl InFlightIterator {
    /// Whether another buffer remains.
    #[must_use]
    pub fn has_next(&self) -> bool {
        !self.closed && !self.buffers.is_empty()
    }

    /// The next buffer, transferring its share to the caller.
    pub fn next(&mut self) -> Option<Buffer> {
        if self.closed {
            return None;
        }
        self.buffers.pop_front()
    }

    /// A borrow of the next buffer without consuming it.
    #[must_use]
    pub fn peek_next(&self) -> Option<&Buffer> {
        if self.closed {
            return None;
        }
        self.buffers.front()
    }

    /// Buffers this cursor will still yield.
    #[must_use]
    pub fn number_remaining(&self) -> usize {
        if self.closed {
            0
        } else {
            self.buffers.len()
        }
    }

    /// Releases the remaining shares early. Subsequent use yields
    /// nothing.
    pub fn close(&mut self) {
        self.closed = true;
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn buffer(payload: &'static [u8]) -> Buffer {
        Buffer::from_bytes(Bytes::from_static(payload))
    }

    #[test]
    fn test_log_and_replay_in_dispatch_order() {
        let mut log = InFlightLog::new(1);
        let b1 = buffer(b"b1");
        let b2 = buffer(b"b2");
        log.log(b1.clone(), true);
        log.log(b2.clone(), false);

        let mut iter = log.in_flight_iterator().unwrap();
        assert_eq!(iter.number_remaining(), 2);
        assert_eq!(iter.peek_next().unwrap().as_bytes().as_ref(), b"b1");
        assert_eq!(iter.next().unwrap().as_bytes().as_ref(), b"b1");
        assert_eq!(iter.next().unwrap().as_bytes().as_ref(), b"b2");
        assert!(!iter.has_next());
        assert!(iter.next().is_none());

        assert_eq!(log.is_last_of_consumer(0), Some(true));
        assert_eq!(log.is_last_of_consumer(1), Some(false));
    }

    #[test]
    fn test_iterator_does_not_observe_later_appends() {
        let mut log = InFlightLog::new(1);
        log.log(buffer(b"old"), true);
        let mut iter = log.in_flight_iterator().unwrap();

        log.log(buffer(b"new"), true);
        assert_eq!(iter.number_remaining(), 1);
        assert_eq!(iter.next().unwrap().as_bytes().as_ref(), b"old");
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_downstream_checkpoint_complete_releases_prefix_once() {
        let mut log = InFlightLog::new(1);
        let b1 = buffer(b"b1");
        let b2 = buffer(b"b2");
        log.log(b1.clone(), true);
        log.log(b2.clone(), true);
        assert_eq!(b1.ref_count(), 2);

        log.notify_downstream_checkpoint_complete(1);
        assert_eq!(b1.ref_count(), 1);
        assert_eq!(b2.ref_count(), 2);
        assert_eq!(log.retained_buffers(), 1);
    }

    #[test]
    fn test_downstream_ack_bounded_by_epoch_tail() {
        let mut log = InFlightLog::new(1);
        let b1 = buffer(b"e1");
        log.log(b1.clone(), true);
        log.start_new_epoch(2);
        let b2 = buffer(b"e2");
        log.log(b2.clone(), true);

        // Over-counting only drains epoch 1.
        log.notify_downstream_checkpoint_complete(5);
        assert_eq!(b1.ref_count(), 1);
        assert_eq!(b2.ref_count(), 2);
        assert_eq!(log.retained_buffers(), 1);
    }

    #[test]
    fn test_epoch_truncation_through_checkpoint() {
        let mut log = InFlightLog::new(1);
        let b1 = buffer(b"e1");
        log.log(b1.clone(), true);
        log.start_new_epoch(2);
        let b2 = buffer(b"e2");
        log.log(b2.clone(), true);

        log.truncate_epochs_through(1);
        assert_eq!(b1.ref_count(), 1);
        assert_eq!(log.retained_buffers(), 1);

        log.truncate_epochs_through(2);
        assert!(log.is_empty());
        assert_eq!(b2.ref_count(), 1);
    }

    #[test]
    fn test_append_after_close_is_dropped() {
        let mut log = InFlightLog::new(1);
        log.close();
        let b = buffer(b"late");
        log.log(b.clone(), true);
        assert_eq!(b.ref_count(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_iterator_close_releases_remaining() {
        let mut log = InFlightLog::new(1);
        let b1 = buffer(b"b1");
        log.log(b1.clone(), true);

        let mut iter = log.in_flight_iterator().unwrap();
        assert_eq!(b1.ref_count(), 3);
        iter.close();
        assert_eq!(b1.ref_count(), 2);
        assert!(iter.next().is_none());
        assert_eq!(iter.number_remaining(), 0);
    }
}
