//! Bounded single-producer/single-consumer queues between threads
//!
//! Each queue is a lock-free `ArrayQueue` split into a [`Producer`] and a
//! [`Consumer`]. Neither half is `Clone`, so exactly one thread can push and
//! one can pop. A push onto a full queue fails and hands the value back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

struct Shared<T> {
    queue: ArrayQueue<T>,
    /// Values refused because the queue was full.
    rejected: AtomicU64,
}

/// Creates a queue holding at most `capacity` values (minimum 1).
pub fn spsc<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity.max(1)),
        rejected: AtomicU64::new(0),
    });
    (Producer { shared: shared.clone() }, Consumer { shared })
}

pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Producer<T> {
    /// Enqueues `value`, or returns it when the queue is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        self.shared.queue.push(value).inspect_err(|_| {
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        })
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }
}

pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Consumer<T> {
    pub fn pop(&mut self) -> Option<T> {
        self.shared.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    /// Number of pushes refused so far because the queue was full.
    pub fn rejected(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    /// Pops and drops everything currently queued, returning the count.
    pub fn discard(&mut self) -> usize {
        let mut n = 0;
        while self.shared.queue.pop().is_some() {
            n += 1;
        }
        n
    }
}
