// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bounded circular queue with optional blocking on either side.
//!
//! [`Que`] is the single primitive under every other container in the
//! runtime: mailbox receive queues, ack slots, the message free pool and the
//! empty/full buffer queues are all instances of it. Storage is allocated
//! once at creation and the queue never grows.

use crate::status::{Status, Timeout};
use std::{
    fmt,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

/// Blocking policy of a [`Que`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueFlags {
    /// `get` may wait for an element
    pub block_get: bool,
    /// `put` may wait for a free slot
    pub block_put: bool,
}

impl QueFlags {
    pub const NO_BLOCK: QueFlags = QueFlags {
        block_get: false,
        block_put: false,
    };
    pub const BLOCK_GET: QueFlags = QueFlags {
        block_get: true,
        block_put: false,
    };
    pub const BLOCK_PUT: QueFlags = QueFlags {
        block_get: false,
        block_put: true,
    };
    pub const BLOCK: QueFlags = QueFlags {
        block_get: true,
        block_put: true,
    };
}

/// An element the queue refused, handed back so it is never lost.
pub struct Rejected<T> {
    pub item: T,
    pub status: Status,
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Rejected({})", self.status)
    }
}

impl<T> From<Rejected<T>> for Status {
    fn from(r: Rejected<T>) -> Self {
        r.status
    }
}

/// Snapshot of the queue indices, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueStatus {
    pub count: usize,
    pub rd: usize,
    pub wr: usize,
}

impl fmt::Display for QueStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "elements {:3} write idx {:3} read idx {:3}",
            self.count, self.wr, self.rd
        )
    }
}

struct Inner<T> {
    slots: Vec<Option<T>>,
    rd: usize,
    wr: usize,
    count: usize,
    unblock_gen: u64,
}

pub struct Que<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    flags: QueFlags,
}

impl<T> Que<T> {
    /// Creates a queue holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, flags: QueFlags) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(Inner {
                slots,
                rd: 0,
                wr: 0,
                count: 0,
                unblock_gen: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            flags,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn flags(&self) -> QueFlags {
        self.flags
    }

    /// Appends `item`, waiting for a free slot if the queue blocks on put.
    pub fn put(&self, item: T, timeout: Timeout) -> Result<(), Rejected<T>> {
        if !timeout.is_no_wait() && !self.flags.block_put {
            return Err(Rejected {
                item,
                status: Status::InvalidArgument,
            });
        }
        let deadline = deadline(timeout);
        let mut inner = self.lock();
        let gen = inner.unblock_gen;
        while inner.count >= self.capacity {
            if timeout.is_no_wait() {
                return Err(Rejected {
                    item,
                    status: Status::QueueFull,
                });
            }
            match wait(&self.not_full, inner, deadline) {
                Some(guard) => inner = guard,
                None => {
                    return Err(Rejected {
                        item,
                        status: Status::Timeout,
                    })
                }
            }
            if inner.unblock_gen != gen {
                return Err(Rejected {
                    item,
                    status: Status::Timeout,
                });
            }
        }
        let wr = inner.wr;
        inner.slots[wr] = Some(item);
        inner.wr = (wr + 1) % self.capacity;
        inner.count += 1;
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest element, waiting if the queue blocks on get.
    pub fn get(&self, timeout: Timeout) -> Result<T, Status> {
        self.get_when(1, timeout)
    }

    /// Removes the oldest element once at least `min_count` elements are
    /// queued. `min_count` is clamped to `1..=capacity`.
    pub fn get_when(&self, min_count: usize, timeout: Timeout) -> Result<T, Status> {
        if !timeout.is_no_wait() && !self.flags.block_get {
            return Err(Status::InvalidArgument);
        }
        let min_count = min_count.clamp(1, self.capacity);
        let deadline = deadline(timeout);
        let mut inner = self.lock();
        let gen = inner.unblock_gen;
        while inner.count < min_count {
            if timeout.is_no_wait() {
                return Err(Status::QueueEmpty);
            }
            inner = wait(&self.not_empty, inner, deadline).ok_or(Status::Timeout)?;
            if inner.unblock_gen != gen {
                return Err(Status::Timeout);
            }
        }
        let rd = inner.rd;
        let item = inner.slots[rd].take();
        inner.rd = (rd + 1) % self.capacity;
        inner.count -= 1;
        drop(inner);
        self.not_full.notify_one();
        // count > 0 guarantees the slot at rd is occupied
        item.ok_or(Status::Fail)
    }

    /// Inspects the head element without removing it.
    pub fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.lock();
        if inner.count == 0 {
            return None;
        }
        inner.slots[inner.rd].as_ref().map(f)
    }

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn status(&self) -> QueStatus {
        let inner = self.lock();
        QueStatus {
            count: inner.count,
            rd: inner.rd,
            wr: inner.wr,
        }
    }

    /// Wakes every caller blocked in `get` or `put`; they return
    /// [`Status::Timeout`].
    pub fn unblock(&self) {
        let mut inner = self.lock();
        inner.unblock_gen = inner.unblock_gen.wrapping_add(1);
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Removes every queued element in FIFO order and resets the indices.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.lock();
        let mut out = Vec::with_capacity(inner.count);
        while inner.count > 0 {
            let rd = inner.rd;
            if let Some(item) = inner.slots[rd].take() {
                out.push(item);
            }
            inner.rd = (rd + 1) % self.capacity;
            inner.count -= 1;
        }
        inner.rd = 0;
        inner.wr = 0;
        drop(inner);
        self.not_full.notify_all();
        out
    }
}

fn deadline(timeout: Timeout) -> Option<Instant> {
    match timeout {
        Timeout::After(d) => Some(Instant::now() + d),
        _ => None,
    }
}

/// Waits on `cv`, returning `None` once `deadline` has passed.
fn wait<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, Inner<T>>,
    deadline: Option<Instant>,
) -> Option<MutexGuard<'a, Inner<T>>> {
    match deadline {
        None => Some(cv.wait(guard).unwrap_or_else(PoisonError::into_inner)),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            Some(guard)
        }
    }
}
