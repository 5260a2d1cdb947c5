// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed bounded message queue.
//!
//! `Queue<T>` is the channel that glues producers (including interrupt-style
//! producers) to cooperatively-scheduled consumer loops. It is a bounded
//! FIFO of values: items are moved in and moved out, and no shared
//! references cross the boundary.
//!
//! Operations:
//!
//! - [`Queue::send`] enqueues at the tail, optionally blocking while full.
//! - [`Queue::send_front`] enqueues at the head. This deliberately breaks
//!   FIFO order; it exists so a consumer can push a priority item (e.g. a
//!   prepared reply) in front of whatever its producers have buffered since.
//! - [`Queue::send_from_isr`] enqueues at the tail and never blocks. On
//!   this host platform "interrupt context" is just another thread and the
//!   operation takes the same short critical section as everything else; a
//!   port that has real interrupts must back this with a wait-free bounded
//!   single-producer ring instead. Callers size the queue so that a
//!   worst-case burst fits; overflow is reported but there is nothing
//!   useful an interrupt handler can do about it.
//! - [`Queue::receive`] / [`Queue::peek`] dequeue / inspect the head with a
//!   bounded or unbounded wait.
//!
//! [`Queue::sender`] and [`Queue::receiver`] hand out role-restricted
//! clones for wiring tasks together.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How long a queue operation may wait for space or data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    Forever,
    UpTo(Duration),
}

impl Wait {
    /// Do not wait at all.
    pub const NONE: Self = Wait::UpTo(Duration::ZERO);
}

/// Error returned when the queue has no room and the wait elapsed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFull;

/// Error returned when the queue has no items and the wait elapsed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueEmpty;

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    readable: Condvar,
    writable: Condvar,
}

/// A bounded multi-producer queue. Cloning yields another handle to the
/// same queue.
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Queue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    items: VecDeque::with_capacity(capacity),
                    capacity,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Enqueues at the tail, waiting for space per `wait`.
    pub fn send(&self, item: T, wait: Wait) -> Result<(), QueueFull> {
        let guard = self.lock();
        let mut guard = self
            .block_while(guard, wait, &self.shared.writable, |inner| {
                inner.items.len() >= inner.capacity
            })
            .ok_or(QueueFull)?;
        guard.items.push_back(item);
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Enqueues at the head, waiting for space per `wait`. The item will be
    /// the next one received, ahead of anything already queued.
    pub fn send_front(&self, item: T, wait: Wait) -> Result<(), QueueFull> {
        let guard = self.lock();
        let mut guard = self
            .block_while(guard, wait, &self.shared.writable, |inner| {
                inner.items.len() >= inner.capacity
            })
            .ok_or(QueueFull)?;
        guard.items.push_front(item);
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Non-blocking tail enqueue for interrupt-context producers.
    pub fn send_from_isr(&self, item: T) -> Result<(), QueueFull> {
        let mut guard = self.lock();
        if guard.items.len() >= guard.capacity {
            return Err(QueueFull);
        }
        guard.items.push_back(item);
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Dequeues the head item, waiting for one per `wait`.
    pub fn receive(&self, wait: Wait) -> Result<T, QueueEmpty> {
        let guard = self.lock();
        let mut guard = self
            .block_while(guard, wait, &self.shared.readable, |inner| {
                inner.items.is_empty()
            })
            .ok_or(QueueEmpty)?;
        // Non-empty by construction.
        let item = guard.items.pop_front().ok_or(QueueEmpty)?;
        self.shared.writable.notify_one();
        Ok(item)
    }

    /// Returns a copy of the head item without removing it.
    pub fn peek(&self, wait: Wait) -> Result<T, QueueEmpty>
    where
        T: Clone,
    {
        let guard = self.lock();
        let guard = self
            .block_while(guard, wait, &self.shared.readable, |inner| {
                inner.items.is_empty()
            })
            .ok_or(QueueEmpty)?;
        guard.items.front().cloned().ok_or(QueueEmpty)
    }

    pub fn sender(&self) -> Sender<T> {
        Sender(self.clone())
    }

    pub fn receiver(&self) -> Receiver<T> {
        Receiver(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // A poisoned lock means some other handle's thread panicked while
        // holding it; queue state is a plain VecDeque and stays coherent.
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Waits on `condvar` while `blocked` holds, honoring the wait policy.
    /// Returns `None` if the wait elapsed with `blocked` still true.
    fn block_while<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Inner<T>>,
        wait: Wait,
        condvar: &Condvar,
        blocked: impl Fn(&Inner<T>) -> bool,
    ) -> Option<MutexGuard<'a, Inner<T>>> {
        match wait {
            Wait::Forever => {
                while blocked(&guard) {
                    guard = condvar
                        .wait(guard)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(guard)
            }
            Wait::UpTo(limit) => {
                let deadline = Instant::now() + limit;
                while blocked(&guard) {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    guard = condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
                Some(guard)
            }
        }
    }
}

/// Send-side handle.
pub struct Sender<T>(Queue<T>);

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender(self.0.clone())
    }
}

impl<T> Sender<T> {
    pub fn send(&self, item: T, wait: Wait) -> Result<(), QueueFull> {
        self.0.send(item, wait)
    }

    pub fn send_front(&self, item: T, wait: Wait) -> Result<(), QueueFull> {
        self.0.send_front(item, wait)
    }

    pub fn send_from_isr(&self, item: T) -> Result<(), QueueFull> {
        self.0.send_from_isr(item)
    }
}

/// Receive-side handle.
pub struct Receiver<T>(Queue<T>);

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver(self.0.clone())
    }
}

impl<T> Receiver<T> {
    pub fn receive(&self, wait: Wait) -> Result<T, QueueEmpty> {
        self.0.receive(wait)
    }

    pub fn peek(&self, wait: Wait) -> Result<T, QueueEmpty>
    where
        T: Clone,
    {
        self.0.peek(wait)
    }
}
