//! Per-task timer queue.
//!
//! Deferred work (channel request retriggers, backoff re-entries) is
//! modeled as a deterministic poll-based queue rather than a dedicated
//! timer thread: any thread may [`schedule`](TimerQueue::schedule), the
//! task thread drains due tasks with [`run_due`](TimerQueue::run_due),
//! and release paths cancel what is still outstanding. Tasks receive the
//! queue back so they can reschedule themselves.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A deferred unit of work. Receives the queue so it can reschedule.
pub type TimerTask = Box<dyn FnOnce(&TimerQueue) + Send>;

struct Scheduled {
    deadline: Instant,
    id: u64,
    task: TimerTask,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Scheduled {}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap behavior.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<Scheduled>,
    next_id: u64,
}

/// Poll-driven timer queue shared by the channels of one task.
pub struct TimerQueue {
    inner: Mutex<QueueInner>,
}

impl TimerQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_id: 0,
            }),
        }
    }

    /// Schedules `task` to become due after `delay`. Returns a handle
    /// usable with [`cancel`](Self::cancel).
    pub fn schedule(&self, delay: Duration, task: TimerTask) -> u64 {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Schedules `task` for an absolute deadline.
    pub fn schedule_at(&self, deadline: Instant, task: TimerTask) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.heap.push(Scheduled { deadline, id, task });
        id
    }

    /// Cancels a scheduled task. Returns whether it was still pending.
    pub fn cancel(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.heap.len();
        inner.heap.retain(|scheduled| scheduled.id != id);
        inner.heap.len() < before
    }

    /// Drops every outstanding task. Returns how many were drained.
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let drained = inner.heap.len();
        inner.heap.clear();
        drained
    }

    /// Pops every task due at or before `now`, in deadline order.
    pub fn poll_due(&self, now: Instant) -> Vec<TimerTask> {
        let mut due = Vec::new();
        let mut inner = self.inner.lock();
        while let Some(next) = inner.heap.peek() {
            if next.deadline > now {
                break;
            }
            due.push(inner.heap.pop().expect("peeked entry exists").task);
        }
        due
    }

    /// Runs every task due at or before `now`. Tasks may reschedule onto
    /// this queue; freshly scheduled work is not run in the same pass.
    pub fn run_due(&self, now: Instant) -> usize {
        let due = self.poll_due(now);
        let count = due.len();
        for task in due {
            task(self);
        }
        count
    }

    /// Outstanding tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
